//! # Core Engine Module
//!
//! The request/response and event plumbing that every other module rides on.
//!
//! ## Core Components:
//!
//! - **`frame`**: strict decoding of the host's wire frames into replies and
//!   events.
//! - **`correlator`**: id assignment, the pending-command table and per-command
//!   timeouts. Exposes the [`CommandChannel`] seam used by pollers and the
//!   moderation executor.
//! - **`demux`**: routes each inbound frame to the correlator or the push
//!   channel.
//! - **`dispatcher`**: zero-copy fan-out of published items to subscribers.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Wire frame encoding and classification.
pub mod frame;
/// Command ids, the pending table and timeouts.
pub mod correlator;
/// Inbound frame routing.
pub mod demux;
/// The zero-copy broadcaster for published messages.
pub mod dispatcher;

// --- Public API Re-exports ---
pub use correlator::{CommandChannel, CommandMode, Correlator, CorrelatorConfig};
pub use demux::{DemuxConfig, DemuxStats, Demultiplexer, PushEvent, Route};
pub use dispatcher::Dispatcher;
pub use frame::{CommandFrame, InboundFrame};
