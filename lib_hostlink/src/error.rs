//! # Bridge Error Taxonomy
//!
//! Every fallible operation in `lib_hostlink` reports a [`BridgeError`]. The
//! variants map one-to-one onto the ways a conversation with the host can go
//! wrong:
//!
//! - **Caller-visible**: `NotConnected`, `ConnectionLost` and `CommandTimeout`
//!   are returned straight to whoever issued the command.
//! - **Absorbed**: `MalformedFrame` and `Decode` are logged by the receive loop
//!   and the pollers and never escape them.
//! - **Retried**: `RateLimited` is consumed by the moderation executor and only
//!   surfaces once its backoff schedule is exhausted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP-style status the host uses for frequency control rejections.
pub const RATE_LIMIT_CODE: i64 = 416;

/// Convenience alias used across the crate.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// # Remote Error Payload
///
/// The `error` object of a reply frame, or the failure object a host-side
/// script hands back inside a successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Human readable reason reported by the host.
    #[serde(default)]
    pub message: String,
    /// Optional numeric code (`416` for frequency control).
    #[serde(default)]
    pub code: Option<i64>,
}

impl RemoteError {
    /// Builds a remote error from its parts.
    pub fn new(message: impl Into<String>, code: Option<i64>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// True when the host rejected the call because of frequency control.
    ///
    /// The host signals this either with code 416 or with a message that talks
    /// about call frequency (it localizes the text, so both spellings are checked).
    pub fn is_rate_limited(&self) -> bool {
        if self.code == Some(RATE_LIMIT_CODE) {
            return true;
        }
        let lowered = self.message.to_lowercase();
        lowered.contains("频率")
            || lowered.contains("rate limit")
            || lowered.contains("too frequent")
            || lowered.contains("frequency")
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// # Bridge Error
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// A command was issued while no connection was open.
    #[error("not connected to the host")]
    NotConnected,

    /// The connection dropped while the command was in flight.
    #[error("connection to the host was lost")]
    ConnectionLost,

    /// No reply arrived within the command's budget.
    #[error("command #{id} ({method}) timed out after {after:?}")]
    CommandTimeout {
        /// Correlation id of the abandoned command.
        id: u64,
        /// Method name, kept for diagnostics.
        method: String,
        /// The budget that elapsed.
        after: Duration,
    },

    /// An inbound frame could not be understood.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The host asked us to slow down.
    #[error("rate limited by host: {0}")]
    RateLimited(RemoteError),

    /// The host rejected the command for any other reason.
    #[error("host rejected command: {0}")]
    Remote(RemoteError),

    /// The host does not expose the requested operation.
    #[error("operation unavailable on host: {0}")]
    Unavailable(String),

    /// A capture could not be decoded into a canonical message.
    #[error("decode failure: {0}")]
    Decode(String),

    /// The WebSocket layer failed (handshake, write, invalid target).
    #[error("transport error: {0}")]
    Transport(String),

    /// A command could not be serialized or a result could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// The caller asked for something that cannot be expressed to the host.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BridgeError {
    /// Classifies a remote error payload into the rate-limited or generic bucket.
    pub fn from_remote(remote: RemoteError) -> Self {
        if remote.is_rate_limited() {
            BridgeError::RateLimited(remote)
        } else {
            BridgeError::Remote(remote)
        }
    }

    /// True for the frequency-control signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, BridgeError::RateLimited(_))
    }

    /// True for failures the caller may retry on the same connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::CommandTimeout { .. } | BridgeError::RateLimited(_)
        )
    }

    /// True when the caller must reconnect before retrying.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, BridgeError::ConnectionLost | BridgeError::NotConnected)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}
