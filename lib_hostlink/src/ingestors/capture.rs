//! # Captures and Canonical Messages
//!
//! [`RawCapture`] is what a poller hands to the pipeline: one record, still in
//! whatever shape its source produced. [`CanonicalMessage`] is what subscribers
//! receive after normalization and deduplication.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a capture came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureSource {
    /// Records pushed by the injected page hook.
    Push,
    /// Periodic read of the host's local message store.
    StructuredScan,
    /// Periodic scrape of the rendered chat view.
    RenderedScan,
}

impl CaptureSource {
    /// All sources, in startup order.
    pub const ALL: [CaptureSource; 3] = [
        CaptureSource::Push,
        CaptureSource::StructuredScan,
        CaptureSource::RenderedScan,
    ];

    /// Structured sources win over the text scrape for the same event.
    pub fn is_authoritative(self) -> bool {
        !matches!(self, CaptureSource::RenderedScan)
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CaptureSource::Push => "push",
            CaptureSource::StructuredScan => "structured-scan",
            CaptureSource::RenderedScan => "rendered-scan",
        };
        f.write_str(label)
    }
}

/// One undecoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    /// Producing source.
    pub source: CaptureSource,
    /// The record as received.
    pub raw_payload: Value,
    /// When the record was read from the host.
    pub captured_at: DateTime<Utc>,
}

impl RawCapture {
    /// Stamps `raw_payload` with the current time.
    pub fn new(source: CaptureSource, raw_payload: Value) -> Self {
        Self {
            source,
            raw_payload,
            captured_at: Utc::now(),
        }
    }
}

/// Who sent the message, relative to the logged-in account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Sent by someone else.
    Incoming,
    /// Sent by the logged-in account.
    Outgoing,
}

/// Broad message category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Plain chat text.
    Text,
    /// Custom or rich payload rendered to text.
    Structured,
    /// Host notifications and tips.
    System,
}

/// A normalized, deduplicated message. Never mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    /// Content-derived identity used for cross-source deduplication.
    pub dedup_key: String,
    /// Channel (team or peer) id, without the session prefix.
    pub channel: String,
    /// Sender account id.
    pub sender: String,
    /// Sender display name; falls back to the account id.
    pub sender_name: String,
    /// In or out.
    pub direction: Direction,
    /// Category.
    pub kind: MessageKind,
    /// Message text.
    pub body: String,
    /// Host timestamp when the record had one, capture time otherwise.
    pub sent_at: DateTime<Utc>,
    /// When the record was read from the host.
    pub captured_at: DateTime<Utc>,
    /// Producing source.
    pub source: CaptureSource,
}
