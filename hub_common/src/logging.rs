//! Logging setup: a per-run timestamped log file under the config
//! directory, with a handful of prior runs kept around for postmortems,
//! plus a dual stdout + file sink driven by the `log` facade.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;

/// Number of past run logs kept in `log_dir` alongside the current one.
const LOG_RETENTION_COUNT: usize = 5;

/// Initialize the global `log` backend. `log_dir` is created if missing.
/// `level` is parsed as a standard [`log::LevelFilter`] name
/// (`off`/`error`/`warn`/`info`/`debug`/`trace`, case-insensitive),
/// defaulting to `info` if it doesn't parse.
pub fn init_logging(log_dir: &Path, level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    prune_old_logs(log_dir)?;

    let log_file_name = format!("cockpit-hub_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    let level = log::LevelFilter::from_str(level).unwrap_or(log::LevelFilter::Info);

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
        // the serial and TCP transports log every accept/reconnect at debug;
        // at trace it's not worth drowning out the rest of the hub for it.
        .level_for("mio", log::LevelFilter::Info)
        .level_for("tokio_util::codec", log::LevelFilter::Info)
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

/// Keep the `LOG_RETENTION_COUNT` most recently modified `.log` files in
/// `log_dir` and delete the rest, so the directory doesn't grow unbounded
/// across restarts while still leaving a short history to inspect.
fn prune_old_logs(log_dir: &Path) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "log"))
        .collect();

    if entries.len() < LOG_RETENTION_COUNT {
        return Ok(());
    }

    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    let cutoff = entries.len() + 1 - LOG_RETENTION_COUNT;

    for entry in &entries[..cutoff] {
        if let Err(e) = fs::remove_file(entry.path()) {
            log::warn!("failed to delete old log file {:?}: {e}", entry.path());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_retention_count_when_over_the_limit() {
        let dir = std::env::temp_dir().join(format!("hub-logging-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        for i in 0..(LOG_RETENTION_COUNT + 3) {
            fs::write(dir.join(format!("run_{i}.log")), b"x").unwrap();
        }

        prune_old_logs(&dir).unwrap();
        let remaining = fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).count();
        assert_eq!(remaining, LOG_RETENTION_COUNT);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn prune_is_a_noop_under_the_retention_count() {
        let dir = std::env::temp_dir().join(format!("hub-logging-test-small-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("run_0.log"), b"x").unwrap();

        prune_old_logs(&dir).unwrap();
        let remaining = fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).count();
        assert_eq!(remaining, 1);

        fs::remove_dir_all(&dir).ok();
    }
}
