//! # Ingestion Pipeline
//!
//! Collects records from every capture path, normalizes them, drops the ones
//! already seen and fans the rest out to subscribers as
//! `Arc<CanonicalMessage>`.
//!
//! ## Sources
//! Each source runs its own poller on its own interval:
//! - **Push**: drains records the demultiplexer forwarded from the page hook.
//! - **StructuredScan**: evaluates a local-store read on the host.
//! - **RenderedScan**: evaluates a scrape of the visible chat view.
//!
//! ## Priority
//! Structured captures are published as soon as they are decoded. Scraped
//! captures are only a fallback: each waits in a FIFO for the grace period and
//! is admitted only if no structured capture with the same dedup key showed up
//! in the meantime. A scrape also counts as seen when a published message in
//! the same channel has the same body prefix: the chat view often lacks the
//! account id and timestamp the structured key is built from. Order is
//! preserved within a source; there is no ordering across sources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::correlator::Correlator;
use crate::core::demux::PushEvent;
use crate::core::dispatcher::Dispatcher;
use crate::error::{BridgeError, BridgeResult};
use crate::ingestors::capture::{CanonicalMessage, CaptureSource, RawCapture};
use crate::ingestors::dedup::{DedupWindow, DEFAULT_DEDUP_CAPACITY};
use crate::ingestors::normalizer::{split_records, Decoded, Normalizer, NormalizerConfig};
use crate::ingestors::probe::{CaptureProbe, ScriptProbe};

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Keys remembered by the dedup window.
    pub dedup_capacity: usize,
    /// How long a scraped capture waits for a structured twin.
    pub fallback_grace: Duration,
    /// Key derivation and channel fallback.
    pub normalizer: NormalizerConfig,
    /// Team whose local store the structured scan reads.
    pub scan_channel: Option<String>,
    /// Messages read per structured scan.
    pub scan_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            fallback_grace: Duration::from_millis(1500),
            normalizer: NormalizerConfig::default(),
            scan_channel: None,
            scan_limit: 20,
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records handed to the pipeline.
    pub captured: u64,
    /// Messages delivered to subscribers.
    pub published: u64,
    /// Records whose key was already in the window.
    pub duplicates: u64,
    /// Records that could not be decoded.
    pub dropped: u64,
    /// Structured records re-routed through the text path.
    pub demoted: u64,
    /// Scraped records admitted after the grace period.
    pub fallback_admitted: u64,
    /// Scraped records superseded by a structured twin during the grace period.
    pub fallback_suppressed: u64,
    /// Poll cycles that returned an error.
    pub poll_errors: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    published: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    demoted: AtomicU64,
    fallback_admitted: AtomicU64,
    fallback_suppressed: AtomicU64,
    poll_errors: AtomicU64,
}

/// Keys of published messages.
struct SeenWindows {
    keys: DedupWindow,
    /// Content keys (channel + body prefix) of the same messages.
    content: DedupWindow,
}

impl SeenWindows {
    fn new(capacity: usize) -> Self {
        Self {
            keys: DedupWindow::new(capacity),
            content: DedupWindow::new(capacity),
        }
    }

    fn covers(&self, message: &CanonicalMessage, content_key: &str) -> bool {
        self.keys.contains(&message.dedup_key) || self.content.contains(content_key)
    }

    fn record(&mut self, message: &CanonicalMessage, content_key: &str) {
        self.keys.insert(&message.dedup_key);
        self.content.insert(content_key);
    }
}

/// A scraped message waiting out its grace period.
struct PendingFallback {
    message: CanonicalMessage,
    deadline: Instant,
}

/// # Ingestion Pipeline
pub struct IngestionPipeline {
    config: PipelineConfig,
    normalizer: Normalizer,
    commands: Arc<Correlator>,
    window: Mutex<SeenWindows>,
    dispatcher: Dispatcher<CanonicalMessage>,
    push_tx: mpsc::UnboundedSender<PushEvent>,
    push_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PushEvent>>>,
    fallback_tx: mpsc::UnboundedSender<PendingFallback>,
    fallback_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingFallback>>>,
    pollers: Mutex<HashMap<CaptureSource, CancellationToken>>,
    shutdown: CancellationToken,
    counters: Counters,
}

impl IngestionPipeline {
    /// Creates a pipeline whose scan pollers issue commands through `commands`.
    pub fn new(config: PipelineConfig, commands: Arc<Correlator>) -> Arc<Self> {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            normalizer: Normalizer::new(config.normalizer.clone()),
            window: Mutex::new(SeenWindows::new(config.dedup_capacity)),
            config,
            commands,
            dispatcher: Dispatcher::new(),
            push_tx,
            push_rx: Arc::new(tokio::sync::Mutex::new(push_rx)),
            fallback_tx,
            fallback_rx: Mutex::new(Some(fallback_rx)),
            pollers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        })
    }

    /// Settings in use.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Sender to hand to [`crate::core::Demultiplexer::set_push_sink`].
    pub fn push_sender(&self) -> mpsc::UnboundedSender<PushEvent> {
        self.push_tx.clone()
    }

    /// Registers a subscriber; every message published from now on arrives on
    /// the returned receiver.
    pub fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<Arc<CanonicalMessage>> {
        self.dispatcher.subscribe(name)
    }

    /// Runs `handler` on its own task for every published message. The handler
    /// must not block.
    pub fn subscribe_handler<F>(&self, name: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(Arc<CanonicalMessage>) + Send + 'static,
    {
        let mut rx = self.dispatcher.subscribe(name);
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler(message);
            }
            log::debug!("Handler '{}' finished", name);
        })
    }

    /// # Start Polling
    ///
    /// Starts the stock poller for `source`. A poller already running for the
    /// same source is replaced.
    pub fn start_polling(self: &Arc<Self>, source: CaptureSource, interval: Duration) -> BridgeResult<()> {
        match source {
            CaptureSource::Push => {
                self.start_polling_with(source, interval, PushDrain {
                    rx: Arc::clone(&self.push_rx),
                });
            }
            CaptureSource::StructuredScan => {
                let channel_id = self.config.scan_channel.as_deref().ok_or_else(|| {
                    BridgeError::InvalidRequest("structured scan needs a scan channel".to_string())
                })?;
                let probe = ScriptProbe::structured_scan(Arc::clone(&self.commands), channel_id, self.config.scan_limit);
                self.start_polling_with(source, interval, probe);
            }
            CaptureSource::RenderedScan => {
                let probe = ScriptProbe::rendered_scan(Arc::clone(&self.commands));
                self.start_polling_with(source, interval, probe);
            }
        }
        Ok(())
    }

    /// Starts a poller for `source` driven by a custom probe.
    pub fn start_polling_with<P: CaptureProbe>(self: &Arc<Self>, source: CaptureSource, interval: Duration, probe: P) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.lock_pollers().insert(source, token.clone()) {
            previous.cancel();
        }

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            log::info!("Poller '{}' started ({:?} interval)", source, interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match probe.poll().await {
                    Ok(records) => {
                        if !records.is_empty() {
                            let captures = records.into_iter().map(|r| RawCapture::new(source, r)).collect();
                            pipeline.ingest(captures);
                        }
                    }
                    Err(e) => {
                        pipeline.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Poller '{}' cycle failed: {}", source, e);
                    }
                }
            }
            log::info!("Poller '{}' stopped", source);
        });
    }

    /// Stops future ticks of `source`'s poller. Returns false if none was running.
    pub fn stop_polling(&self, source: CaptureSource) -> bool {
        match self.lock_pollers().remove(&source) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// True while a poller for `source` is registered.
    pub fn is_polling(&self, source: CaptureSource) -> bool {
        self.lock_pollers().contains_key(&source)
    }

    /// Stops every poller and the fallback admission task.
    pub fn shutdown(&self) {
        self.lock_pollers().clear();
        self.shutdown.cancel();
    }

    /// # Ingest
    ///
    /// Normalizes, deduplicates and publishes `captures` in order.
    pub fn ingest(self: &Arc<Self>, captures: Vec<RawCapture>) {
        for capture in captures {
            self.counters.captured.fetch_add(1, Ordering::Relaxed);
            match self.normalizer.decode(&capture) {
                Decoded::Message(message) if message.source.is_authoritative() => self.admit_now(message),
                Decoded::Message(message) => self.defer(message),
                Decoded::Demoted(rendered) => {
                    self.counters.demoted.fetch_add(1, Ordering::Relaxed);
                    match self.normalizer.decode(&rendered) {
                        Decoded::Message(message) => self.defer(message),
                        _ => self.drop_capture(&capture, "demoted record has no usable text"),
                    }
                }
                Decoded::Dropped(reason) => self.drop_capture(&capture, &reason),
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            captured: self.counters.captured.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            demoted: self.counters.demoted.load(Ordering::Relaxed),
            fallback_admitted: self.counters.fallback_admitted.load(Ordering::Relaxed),
            fallback_suppressed: self.counters.fallback_suppressed.load(Ordering::Relaxed),
            poll_errors: self.counters.poll_errors.load(Ordering::Relaxed),
        }
    }

    fn admit_now(&self, message: CanonicalMessage) {
        let content_key = self.normalizer.content_key(&message.channel, &message.body);
        let fresh = {
            let mut seen = self.lock_window();
            let fresh = !seen.keys.contains(&message.dedup_key);
            if fresh {
                seen.record(&message, &content_key);
            }
            fresh
        };
        if fresh {
            self.publish(message);
        } else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn defer(self: &Arc<Self>, message: CanonicalMessage) {
        let content_key = self.normalizer.content_key(&message.channel, &message.body);
        if self.lock_window().covers(&message, &content_key) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.config.fallback_grace.is_zero() {
            self.admit_fallback(message);
            return;
        }
        self.ensure_admission_task();
        let pending = PendingFallback {
            message,
            deadline: Instant::now() + self.config.fallback_grace,
        };
        if self.fallback_tx.send(pending).is_err() {
            log::debug!("Fallback queue closed; pipeline is shutting down");
        }
    }

    fn admit_fallback(&self, message: CanonicalMessage) {
        let content_key = self.normalizer.content_key(&message.channel, &message.body);
        let fresh = {
            let mut seen = self.lock_window();
            let fresh = !seen.covers(&message, &content_key);
            if fresh {
                seen.record(&message, &content_key);
            }
            fresh
        };
        if fresh {
            self.counters.fallback_admitted.fetch_add(1, Ordering::Relaxed);
            self.publish(message);
        } else {
            self.counters.fallback_suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn publish(&self, message: CanonicalMessage) {
        log::debug!(
            "Publishing {} message in {} from {} ({})",
            message.source,
            message.channel,
            message.sender,
            message.dedup_key
        );
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.dispatcher.broadcast(Arc::new(message));
    }

    fn drop_capture(&self, capture: &RawCapture, reason: &str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        log::debug!("Dropping {} capture: {}", capture.source, reason);
    }

    /// The admission task is started on first use so a pipeline can be built
    /// outside a runtime.
    fn ensure_admission_task(self: &Arc<Self>) {
        let Some(mut rx) = self.fallback_rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let pipeline: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => next,
                };
                let Some(pending) = next else { break };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(pending.deadline) => {}
                }
                let Some(pipeline) = pipeline.upgrade() else { break };
                pipeline.admit_fallback(pending.message);
            }
            log::debug!("Fallback admission stopped");
        });
    }

    fn lock_window(&self) -> MutexGuard<'_, SeenWindows> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pollers(&self) -> MutexGuard<'_, HashMap<CaptureSource, CancellationToken>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drains whatever the demultiplexer pushed since the last tick.
struct PushDrain {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PushEvent>>>,
}

impl CaptureProbe for PushDrain {
    async fn poll(&self) -> BridgeResult<Vec<serde_json::Value>> {
        let mut rx = self.rx.lock().await;
        let mut records = Vec::new();
        while let Ok(event) = rx.try_recv() {
            records.extend(split_records(event.payload));
        }
        Ok(records)
    }
}
