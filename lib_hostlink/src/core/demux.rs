//! # Event Demultiplexer
//!
//! Called once per inbound text frame by the connection's receive loop.
//!
//! - Replies go to the [`Correlator`].
//! - Events that carry the page-side hook's marker are forwarded to the push
//!   channel feeding the ingestion pipeline.
//! - Everything else is logged and dropped.
//!
//! Nothing in here returns an error to the receive loop: a bad frame costs one
//! log line, never the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::correlator::{decode_script_value, Correlator};
use crate::core::frame::InboundFrame;
use crate::utils::truncate_chars;

/// Event emitted when the page calls an exposed binding.
pub const BINDING_CALLED: &str = "Runtime.bindingCalled";
/// Event emitted for every console call in the page.
pub const CONSOLE_API_CALLED: &str = "Runtime.consoleAPICalled";

/// Markers identifying events produced by the injected capture hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxConfig {
    /// Binding name the hook calls with each captured record.
    pub binding_name: String,
    /// Prefix the hook puts on console lines carrying a record.
    pub console_marker: String,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            binding_name: "__hostlinkPush".to_string(),
            console_marker: "[hostlink]".to_string(),
        }
    }
}

/// An unsolicited record delivered by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// Event method that carried the record.
    pub method: String,
    /// The record, parsed as JSON when possible.
    pub payload: Value,
    /// When the frame was read off the socket.
    pub received_at: DateTime<Utc>,
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Reply matched a pending command.
    Resolved(u64),
    /// Reply for an id nobody is waiting on.
    Unmatched(u64),
    /// Marked event forwarded to the push channel.
    Pushed,
    /// Well-formed frame with no consumer.
    Ignored,
    /// Frame could not be parsed.
    Malformed,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    /// Replies delivered to a waiting caller.
    pub resolved: u64,
    /// Replies with no pending command.
    pub unmatched: u64,
    /// Records forwarded to the push channel.
    pub pushed: u64,
    /// Events without a recognized marker.
    pub ignored: u64,
    /// Unparseable frames.
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    resolved: AtomicU64,
    unmatched: AtomicU64,
    pushed: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
}

/// # Demultiplexer
pub struct Demultiplexer {
    config: DemuxConfig,
    correlator: Arc<Correlator>,
    push_sink: Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
    counters: Counters,
}

impl Demultiplexer {
    /// Creates a demultiplexer delivering replies to `correlator`.
    pub fn new(config: DemuxConfig, correlator: Arc<Correlator>) -> Self {
        Self {
            config,
            correlator,
            push_sink: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Marker configuration.
    pub fn config(&self) -> &DemuxConfig {
        &self.config
    }

    /// Connects the push channel; usually the ingestion pipeline's sender.
    pub fn set_push_sink(&self, sink: mpsc::UnboundedSender<PushEvent>) {
        *self.push_sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Routes one inbound text frame.
    pub fn route(&self, text: &str) -> Route {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping frame: {} ({})", e, truncate_chars(text, 120));
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return Route::Malformed;
            }
        };

        match frame {
            InboundFrame::Reply { id, outcome } => {
                if self.correlator.resolve(id, outcome) {
                    self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                    Route::Resolved(id)
                } else {
                    log::debug!("Reply #{} has no pending command (late or foreign)", id);
                    self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                    Route::Unmatched(id)
                }
            }
            InboundFrame::Event { method, params } => match self.extract_marked_payload(&method, &params) {
                Some(payload) => self.forward(method, payload),
                None => {
                    log::trace!("Ignoring event {}", method);
                    self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                    Route::Ignored
                }
            },
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DemuxStats {
        DemuxStats {
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }

    fn extract_marked_payload(&self, method: &str, params: &Value) -> Option<Value> {
        match method {
            BINDING_CALLED => {
                let name = params.get("name").and_then(Value::as_str)?;
                if name != self.config.binding_name {
                    return None;
                }
                match params.get("payload")? {
                    Value::String(raw) => Some(decode_script_value(Value::String(raw.clone()))),
                    other => Some(other.clone()),
                }
            }
            CONSOLE_API_CALLED => {
                let first = params.pointer("/args/0/value").and_then(Value::as_str)?;
                let rest = first.strip_prefix(self.config.console_marker.as_str())?;
                Some(decode_script_value(Value::String(rest.trim().to_string())))
            }
            _ => None,
        }
    }

    fn forward(&self, method: String, payload: Value) -> Route {
        let event = PushEvent {
            method,
            payload,
            received_at: Utc::now(),
        };
        let delivered = match self.push_sink.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        };
        if delivered {
            self.counters.pushed.fetch_add(1, Ordering::Relaxed);
            Route::Pushed
        } else {
            log::debug!("Push channel not connected; dropping marked event");
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            Route::Ignored
        }
    }
}
