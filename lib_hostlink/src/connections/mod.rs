//! # Connections Module
//!
//! Transport-level plumbing for the host's remote-debugging socket. The
//! [`ConnectionManager`] owns the WebSocket and its two tasks; commands and
//! events ride on top of it through the correlator and demultiplexer in
//! [`crate::core`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Lifecycle of the single host connection.
pub mod manager;

// --- Public API Re-exports ---
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionState};
