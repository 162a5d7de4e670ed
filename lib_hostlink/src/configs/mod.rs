//! # Configuration Module
//!
//! File configuration for the whole stack, read from JSON5 so operators can
//! keep comments next to the values. Every field has a default; an empty file
//! (or `{}`) is a valid configuration.
//!
//! ```json5
//! {
//!   connection: { target: "ws://127.0.0.1:9222/devtools/page/ABC", reconnectAttempts: 3 },
//!   ingestion: { scanChannel: "123456", renderedIntervalMs: 5000 },
//!   moderation: { backoffMs: [0, 1000, 3000, 6000, 10000] },
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid JSON5 or does not match the schema.
    #[error("invalid config: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Connection and correlation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSection {
    /// Host debugging socket, e.g. `ws://127.0.0.1:9222/devtools/page/<id>`.
    pub target: Option<String>,
    /// WebSocket handshake budget.
    pub handshake_timeout_ms: u64,
    /// Budget for synchronous commands.
    pub sync_timeout_ms: u64,
    /// Budget for commands awaiting host-side promises.
    pub async_timeout_ms: u64,
    /// Page binding the push hook calls.
    pub binding_name: String,
    /// Console prefix used when the binding is missing.
    pub console_marker: String,
    /// Caller-side reconnect attempts after a loss; zero disables.
    pub reconnect_attempts: u32,
    /// Spacing between reconnect attempts.
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            target: None,
            handshake_timeout_ms: 10_000,
            sync_timeout_ms: 15_000,
            async_timeout_ms: 90_000,
            binding_name: "__hostlinkPush".to_string(),
            console_marker: "[hostlink]".to_string(),
            reconnect_attempts: 0,
            reconnect_delay_ms: 5_000,
        }
    }
}

/// Poller and dedup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestionSection {
    /// Push-channel drain interval.
    pub push_interval_ms: u64,
    /// Local-store scan interval.
    pub structured_interval_ms: u64,
    /// Rendered-view scrape interval.
    pub rendered_interval_ms: u64,
    /// Time a scraped capture waits for a structured twin.
    pub fallback_grace_ms: u64,
    /// Keys kept in the dedup window.
    pub dedup_capacity: usize,
    /// Dedup key time bucket.
    pub bucket_secs: i64,
    /// Body characters in the dedup key.
    pub key_prefix_chars: usize,
    /// Team read by the structured scan; the scan is skipped when unset.
    pub scan_channel: Option<String>,
    /// Messages per structured scan.
    pub scan_limit: usize,
    /// Channel assumed for scraped records that carry none.
    pub default_channel: Option<String>,
}

impl Default for IngestionSection {
    fn default() -> Self {
        Self {
            push_interval_ms: 200,
            structured_interval_ms: 3_000,
            rendered_interval_ms: 5_000,
            fallback_grace_ms: 1_500,
            dedup_capacity: 5_000,
            bucket_secs: 60,
            key_prefix_chars: 32,
            scan_channel: None,
            scan_limit: 20,
            default_channel: None,
        }
    }
}

/// Moderation executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModerationSection {
    /// Wait before each attempt; the first is normally zero.
    pub backoff_ms: Vec<u64>,
    /// Confirmation reads after success.
    pub confirm_attempts: u32,
    /// Wait before each confirmation read.
    pub confirm_delay_ms: u64,
    /// Skip actions whose end state already holds.
    pub precheck: bool,
}

impl Default for ModerationSection {
    fn default() -> Self {
        Self {
            backoff_ms: vec![0, 1_000, 3_000, 6_000, 10_000],
            confirm_attempts: 3,
            confirm_delay_ms: 300,
            precheck: true,
        }
    }
}

/// # Hostlink Config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostlinkConfig {
    /// Connection and correlation.
    pub connection: ConnectionSection,
    /// Pollers and dedup.
    pub ingestion: IngestionSection,
    /// Moderation executor.
    pub moderation: ModerationSection,
}

impl HostlinkConfig {
    /// Reads and validates a JSON5 file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json5(&text)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates JSON5 text. Blank text yields the defaults.
    pub fn from_json5(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = json5::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("ingestion.pushIntervalMs", self.ingestion.push_interval_ms),
            ("ingestion.structuredIntervalMs", self.ingestion.structured_interval_ms),
            ("ingestion.renderedIntervalMs", self.ingestion.rendered_interval_ms),
            ("connection.syncTimeoutMs", self.connection.sync_timeout_ms),
            ("connection.asyncTimeoutMs", self.connection.async_timeout_ms),
            ("connection.handshakeTimeoutMs", self.connection.handshake_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.ingestion.bucket_secs <= 0 {
            return Err(ConfigError::Invalid("ingestion.bucketSecs must be positive".to_string()));
        }
        if self.moderation.backoff_ms.is_empty() {
            return Err(ConfigError::Invalid("moderation.backoffMs needs at least one entry".to_string()));
        }
        if self.connection.binding_name.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.bindingName must not be blank".to_string()));
        }
        Ok(())
    }

    /// Reconnect spacing.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.connection.reconnect_delay_ms)
    }

    /// Interval for `source`'s poller.
    #[cfg(feature = "ingestors")]
    pub fn poll_interval(&self, source: crate::ingestors::CaptureSource) -> Duration {
        use crate::ingestors::CaptureSource;
        let ms = match source {
            CaptureSource::Push => self.ingestion.push_interval_ms,
            CaptureSource::StructuredScan => self.ingestion.structured_interval_ms,
            CaptureSource::RenderedScan => self.ingestion.rendered_interval_ms,
        };
        Duration::from_millis(ms)
    }

    /// Settings for [`crate::connections::ConnectionManager`].
    #[cfg(feature = "connections")]
    pub fn connection_config(&self) -> crate::connections::ConnectionConfig {
        crate::connections::ConnectionConfig {
            handshake_timeout: Duration::from_millis(self.connection.handshake_timeout_ms),
        }
    }

    /// Settings for [`crate::core::Correlator`].
    #[cfg(feature = "connections")]
    pub fn correlator_config(&self) -> crate::core::CorrelatorConfig {
        crate::core::CorrelatorConfig {
            sync_timeout: Duration::from_millis(self.connection.sync_timeout_ms),
            async_timeout: Duration::from_millis(self.connection.async_timeout_ms),
        }
    }

    /// Settings for [`crate::core::Demultiplexer`].
    #[cfg(feature = "connections")]
    pub fn demux_config(&self) -> crate::core::DemuxConfig {
        crate::core::DemuxConfig {
            binding_name: self.connection.binding_name.clone(),
            console_marker: self.connection.console_marker.clone(),
        }
    }

    /// Settings for [`crate::ingestors::IngestionPipeline`].
    #[cfg(feature = "ingestors")]
    pub fn pipeline_config(&self) -> crate::ingestors::PipelineConfig {
        crate::ingestors::PipelineConfig {
            dedup_capacity: self.ingestion.dedup_capacity,
            fallback_grace: Duration::from_millis(self.ingestion.fallback_grace_ms),
            normalizer: crate::ingestors::NormalizerConfig {
                bucket_secs: self.ingestion.bucket_secs,
                key_prefix_chars: self.ingestion.key_prefix_chars,
                default_channel: self.ingestion.default_channel.clone(),
            },
            scan_channel: self.ingestion.scan_channel.clone(),
            scan_limit: self.ingestion.scan_limit,
        }
    }

    /// Settings for [`crate::moderation::ModerationExecutor`].
    #[cfg(feature = "moderation")]
    pub fn moderation_config(&self) -> crate::moderation::ModerationConfig {
        crate::moderation::ModerationConfig {
            schedule: crate::moderation::BackoffSchedule::from_millis(&self.moderation.backoff_ms),
            confirm_attempts: self.moderation.confirm_attempts,
            confirm_delay: Duration::from_millis(self.moderation.confirm_delay_ms),
            precheck: self.moderation.precheck,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn blank_and_empty_documents_use_defaults() {
        assert_eq!(HostlinkConfig::from_json5("").unwrap(), HostlinkConfig::default());
        assert_eq!(HostlinkConfig::from_json5("{}").unwrap(), HostlinkConfig::default());
    }

    #[test]
    fn json5_with_comments_and_partial_sections() {
        let text = r#"
        {
            // local debugging port
            connection: { target: 'ws://127.0.0.1:9222/devtools/page/1', reconnectAttempts: 2, },
            ingestion: { scanChannel: "42", fallbackGraceMs: 800 },
            moderation: { backoffMs: [0, 500] },
        }"#;
        let config = HostlinkConfig::from_json5(text).unwrap();
        assert_eq!(config.connection.target.as_deref(), Some("ws://127.0.0.1:9222/devtools/page/1"));
        assert_eq!(config.connection.reconnect_attempts, 2);
        assert_eq!(config.connection.sync_timeout_ms, 15_000);
        assert_eq!(config.ingestion.scan_channel.as_deref(), Some("42"));
        assert_eq!(config.ingestion.dedup_capacity, 5_000);
        assert_eq!(config.moderation.backoff_ms, [0, 500]);
        assert_eq!(config.moderation.confirm_attempts, 3);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = HostlinkConfig::from_json5("{ ingestion: { pushIntervalMs: 0 } }").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("pushIntervalMs")));
        assert!(matches!(
            HostlinkConfig::from_json5("{ moderation: { backoffMs: [] } }"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(HostlinkConfig::from_json5("{ connection: "), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ ingestion: {{ renderedIntervalMs: 750 }} }}").unwrap();
        let config = HostlinkConfig::load(file.path()).unwrap();
        assert_eq!(config.ingestion.rendered_interval_ms, 750);

        assert!(matches!(
            HostlinkConfig::load("/definitely/not/here.json5"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[cfg(feature = "full")]
    #[test]
    fn converts_into_runtime_settings() {
        let config = HostlinkConfig::default();
        assert_eq!(config.correlator_config().async_timeout, Duration::from_secs(90));
        assert_eq!(config.pipeline_config().fallback_grace, Duration::from_millis(1500));
        assert_eq!(config.moderation_config().schedule.attempts(), 5);
        assert_eq!(config.demux_config().binding_name, "__hostlinkPush");
    }
}
