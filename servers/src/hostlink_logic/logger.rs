use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const LOG_PREFIX: &str = "server_hostlink_";

/// Routes `log` records to stdout and a fresh timestamped file in `log_dir`.
///
/// Earlier runs' files are pruned first; the newest one is kept so the last
/// session can still be inspected after a restart.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    fs::create_dir_all(log_dir).with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let leftovers = prune_old_logs(log_dir)?;

    let log_path = log_dir.join(format!(
        "{LOG_PREFIX}{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    ));
    let level = parse_level(log_level);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(io::stdout())
        .chain(fern::log_file(&log_path).with_context(|| format!("opening {}", log_path.display()))?)
        .apply()?;

    log::info!("Logging at {} to {}", level, log_path.display());
    for (path, e) in leftovers {
        log::warn!("Could not delete old log file {}: {}", path.display(), e);
    }
    Ok(())
}

fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" | "none" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Deletes every `.log` file in `log_dir` except the most recently modified.
/// Returns the files that could not be removed.
fn prune_old_logs(log_dir: &Path) -> Result<Vec<(PathBuf, io::Error)>> {
    let mut logs: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .collect();
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(logs
        .into_iter()
        .skip(1)
        .filter_map(|(_, path)| fs::remove_file(&path).err().map(|e| (path, e)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pruning_keeps_only_newest_log() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("server_hostlink_a.log");
        let newer = dir.path().join("server_hostlink_b.log");
        let other = dir.path().join("notes.txt");
        fs::write(&older, "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&newer, "b").unwrap();
        fs::write(&other, "c").unwrap();

        let failures = prune_old_logs(dir.path()).unwrap();
        assert!(failures.is_empty());
        assert!(!older.exists());
        assert!(newer.exists());
        assert!(other.exists());
    }

    #[test]
    fn undeletable_logs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let stuck = dir.path().join("stuck.log");
        fs::create_dir(&stuck).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("server_hostlink_b.log"), "b").unwrap();

        let failures = prune_old_logs(dir.path()).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, stuck);
        assert!(stuck.exists());
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(parse_level("TRACE"), log::LevelFilter::Trace);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Error);
        assert_eq!(parse_level("verbose"), log::LevelFilter::Info);
    }
}
