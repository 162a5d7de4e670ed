use std::io::Write;
use std::time::Duration;

use lib_hostlink::configs::{ConfigError, HostlinkConfig};
use lib_hostlink::ingestors::CaptureSource;

#[test]
fn json5_file_drives_every_component() {
    let mut file = tempfile::Builder::new().suffix(".json5").tempfile().unwrap();
    file.write_all(
        br#"{
            // comments are allowed
            connection: {
                target: 'ws://127.0.0.1:9222/devtools/page/ABC',
                syncTimeoutMs: 5000,
                bindingName: '__bridge',
            },
            ingestion: { renderedIntervalMs: 2500, fallbackGraceMs: 800, scanChannel: '777' },
            moderation: { backoffMs: [0, 500], confirmAttempts: 6 },
        }"#,
    )
    .unwrap();

    let config = HostlinkConfig::load(file.path()).unwrap();
    assert_eq!(config.correlator_config().sync_timeout, Duration::from_secs(5));
    assert_eq!(config.demux_config().binding_name, "__bridge");
    assert_eq!(config.poll_interval(CaptureSource::RenderedScan), Duration::from_millis(2500));

    let pipeline = config.pipeline_config();
    assert_eq!(pipeline.fallback_grace, Duration::from_millis(800));
    assert_eq!(pipeline.scan_channel.as_deref(), Some("777"));

    let moderation = config.moderation_config();
    assert_eq!(moderation.schedule.attempts(), 2);
    assert_eq!(moderation.confirm_attempts, 6);
}

#[test]
fn unreadable_and_invalid_files_are_reported() {
    assert!(matches!(
        HostlinkConfig::load("/definitely/not/here.json5"),
        Err(ConfigError::Io { .. })
    ));
    assert!(matches!(HostlinkConfig::from_json5("{ connection: "), Err(ConfigError::Parse(_))));
    assert!(matches!(
        HostlinkConfig::from_json5("{ ingestion: { pushIntervalMs: 0 } }"),
        Err(ConfigError::Invalid(_))
    ));
}
