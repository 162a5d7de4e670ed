use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lib_hostlink::configs::HostlinkConfig;
use lib_hostlink::moderation::ModerationAction;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "hostlink.json5";

#[derive(Parser, Debug)]
#[command(about = "Bridge daemon for a script-controllable chat host", version)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect, ingest messages and log them until stopped (the default).
    Run,
    /// Apply one moderation action, print the outcome and exit.
    Moderate {
        #[arg(long, help = "Channel (team) id.")]
        channel: String,
        #[arg(long, help = "Member account; omit for channel-wide actions.")]
        member: Option<String>,
        #[arg(long, value_enum)]
        action: ActionArg,
    },
    /// Send one text message and exit.
    Say {
        #[arg(long, help = "Channel or account to send to.")]
        to: String,
        #[arg(long)]
        text: String,
        #[arg(long, help = "Send as a one-to-one message instead of a team message.")]
        p2p: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionArg {
    Mute,
    Unmute,
    Remove,
}

impl From<ActionArg> for ModerationAction {
    fn from(value: ActionArg) -> Self {
        match value {
            ActionArg::Mute => ModerationAction::Mute,
            ActionArg::Unmute => ModerationAction::Unmute,
            ActionArg::Remove => ModerationAction::Remove,
        }
    }
}

/// Daemon-level settings. Each field can come from the `daemon` section of the
/// config file, the environment, or the command line, in increasing priority.
#[derive(Args, Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[arg(long, env = "HOSTLINK_CONFIG_PATH", global = true, help = "Path to the JSON5 configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "HOSTLINK_LOG_DIR", global = true, help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "HOSTLINK_LOG_LEVEL", global = true, help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "HOSTLINK_TARGET", global = true, help = "Host debugging socket, e.g. ws://127.0.0.1:9222/devtools/page/<id>.")]
    pub target: Option<String>,

    #[arg(long, env = "HOSTLINK_SCAN_CHANNEL", global = true, help = "Channel whose history the structured scan reads.")]
    pub scan_channel: Option<String>,

    #[arg(long, env = "HOSTLINK_DEFAULT_CHANNEL", global = true, help = "Channel assigned to rendered captures that carry none.")]
    pub default_channel: Option<String>,

    #[arg(long, env = "HOSTLINK_RECONNECT_ATTEMPTS", global = true, help = "Reconnect attempts after a connection loss; 0 disables.")]
    pub reconnect_attempts: Option<u32>,

    #[arg(long, env = "HOSTLINK_RECONNECT_DELAY_MS", global = true, help = "Fixed delay in milliseconds between reconnect attempts.")]
    pub reconnect_delay_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            target: other.target.or(self.target),
            scan_channel: other.scan_channel.or(self.scan_channel),
            default_channel: other.default_channel.or(self.default_channel),
            reconnect_attempts: other.reconnect_attempts.or(self.reconnect_attempts),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DaemonFile {
    daemon: Config,
}

/// Fully resolved settings for one daemon run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub log_level: String,
    /// File the settings were read from, if any.
    pub source: Option<PathBuf>,
    pub hostlink: HostlinkConfig,
}

/// Resolves settings: defaults, then the config file, then `overrides`
/// (environment and command line, as parsed by clap).
pub fn load_settings(overrides: Config) -> Result<Settings> {
    // 1. Defaults
    let mut current = Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };
    let mut hostlink = HostlinkConfig::default();

    // 2. Config file; an explicit path must exist, the implicit ones are optional
    let (config_path, explicit) = match overrides.config_path.clone() {
        Some(path) => (Some(path), true),
        None => (default_config_path(), false),
    };
    let mut source = None;
    if let Some(path) = config_path {
        if path.exists() {
            let text = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            hostlink = HostlinkConfig::from_json5(&text).with_context(|| format!("invalid config file {}", path.display()))?;
            if !text.trim().is_empty() {
                let file: DaemonFile = json5::from_str(&text).with_context(|| format!("invalid daemon section in {}", path.display()))?;
                current = current.merge(file.daemon);
            }
            source = Some(path);
        } else if explicit {
            bail!("config file {} does not exist", path.display());
        }
    }

    // 3. Environment variables and CLI arguments
    let current = current.merge(overrides);
    apply_overrides(&mut hostlink, &current);
    hostlink.validate().context("invalid configuration after applying overrides")?;

    Ok(Settings {
        log_dir: current.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level: current.log_level.unwrap_or_else(|| "info".to_string()),
        source,
        hostlink,
    })
}

fn apply_overrides(hostlink: &mut HostlinkConfig, config: &Config) {
    if let Some(target) = &config.target {
        hostlink.connection.target = Some(target.clone());
    }
    if let Some(channel) = &config.scan_channel {
        hostlink.ingestion.scan_channel = Some(channel.clone());
    }
    if let Some(channel) = &config.default_channel {
        hostlink.ingestion.default_channel = Some(channel.clone());
    }
    if let Some(attempts) = config.reconnect_attempts {
        hostlink.connection.reconnect_attempts = attempts;
    }
    if let Some(delay) = config.reconnect_delay_ms {
        hostlink.connection.reconnect_delay_ms = delay;
    }
}

// ./hostlink.json5 first, then <config dir>/hostlink/hostlink.json5.
fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("hostlink").join(DEFAULT_CONFIG_FILE))
        .filter(|path| path.exists())
}
