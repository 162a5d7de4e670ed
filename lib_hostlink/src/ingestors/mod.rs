//! # Data Ingestors Module
//!
//! Everything between a raw record read from the host and the canonical
//! message stream handed to subscribers.
//!
//! ## Contained Modules:
//! - **`capture`**: raw capture and canonical message types.
//! - **`normalizer`**: tolerant per-source decoding and dedup key derivation.
//! - **`dedup`**: the bounded window of recently seen keys.
//! - **`probe`**: what one poll cycle runs, plus the host-side capture scripts.
//! - **`pipeline`**: pollers, source priority and fan-out.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Raw captures and canonical messages.
pub mod capture;
/// Bounded FIFO set of dedup keys.
pub mod dedup;
/// Record decoding and dedup keys.
pub mod normalizer;
/// Capture probes and host scripts.
pub mod probe;
/// The ingestion pipeline.
pub mod pipeline;

// --- Public API Re-exports ---
pub use capture::{CanonicalMessage, CaptureSource, Direction, MessageKind, RawCapture};
pub use dedup::DedupWindow;
pub use normalizer::{Decoded, Normalizer, NormalizerConfig};
pub use pipeline::{IngestionPipeline, PipelineConfig, PipelineStats};
pub use probe::{install_push_hook, CaptureProbe, ScriptProbe};
