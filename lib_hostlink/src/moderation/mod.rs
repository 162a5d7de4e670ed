//! # Moderation Module
//!
//! Idempotent state-changing commands (mute, unmute, remove) against the
//! host's rate-limited team API, with backoff and read-back confirmation.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Fixed backoff between rate-limited attempts.
pub mod backoff;
/// The executor state machine.
pub mod executor;
/// Authoritative state reads.
pub mod probe;
/// Targets, actions, host operations and outcomes.
pub mod request;

// --- Public API Re-exports ---
pub use backoff::BackoffSchedule;
pub use executor::{ModerationConfig, ModerationExecutor};
pub use probe::{ScriptStateProbe, StateProbe};
pub use request::{HostOperation, MemberState, ModerationAction, ModerationOutcome, ModerationRequest, ModerationTarget};
