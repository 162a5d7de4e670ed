//! # lib_hostlink
//!
//! Drives a script-controllable host application over its remote-debugging
//! WebSocket: request/response commands with per-command timeouts, ingestion of
//! chat messages from several capture paths into one deduplicated stream, and
//! rate-limit aware moderation.
//!
//! Modules are gated by folder-level features; `full` (the default) enables
//! everything.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod error;

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "connections")]
pub mod collaborators;
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "connections")]
pub mod core;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "moderation")]
pub mod moderation;

#[cfg(feature = "utils")]
pub mod utils;

pub use error::{BridgeError, BridgeResult, RemoteError};
