//! Shared logging utilities for Bellows binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "bellows_server=info,bellows_storage=info";
const VERBOSE_LOG_FILTER: &str =
    "bellows_server=debug,bellows_storage=debug,bellows_protocol=debug";

/// Keep a week of daily log files around.
const MAX_LOG_FILES: usize = 7;

/// Logging configuration shared by Bellows binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Raise the filter to debug for the bellows crates.
    pub verbose: bool,
}

/// Initialize tracing with a daily-rotated file writer and stderr output.
///
/// The server is headless, so stderr gets the same filter as the file;
/// `RUST_LOG` overrides both.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(config.app_name)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(&log_dir)
        .context("Failed to initialize rolling log writer")?;

    let default_filter = if config.verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();

    Ok(())
}

/// Get the Bellows home directory: ~/.bellows
pub fn bellows_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("BELLOWS_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".bellows")
}

/// Get the logs directory: ~/.bellows/logs
pub fn logs_dir() -> PathBuf {
    bellows_home().join("logs")
}

/// Get the data directory (database, per-job log files): ~/.bellows/data
pub fn data_dir() -> PathBuf {
    bellows_home().join("data")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Ensure the data directory exists.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let data = data_dir();
    fs::create_dir_all(&data)
        .with_context(|| format!("Failed to create data directory: {}", data.display()))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_override_redirects_all_dirs() {
        std::env::set_var("BELLOWS_HOME", "/tmp/bellows-test-home");
        assert_eq!(bellows_home(), PathBuf::from("/tmp/bellows-test-home"));
        assert_eq!(logs_dir(), PathBuf::from("/tmp/bellows-test-home/logs"));
        assert_eq!(data_dir(), PathBuf::from("/tmp/bellows-test-home/data"));
        std::env::remove_var("BELLOWS_HOME");
    }
}
