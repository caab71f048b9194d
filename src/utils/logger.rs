//! Logging initialization and configuration.
//!
//! Logs are written to a file per run in a `logs/` directory so they never
//! interleave with REPL output.
//!
//! # Configuration
//!
//! The log level can be controlled via the `RUST_LOG` environment variable:
//! - `RUST_LOG=debug` - Show debug and higher level logs
//! - `RUST_LOG=info` - Show info and higher level logs (default)
//! - `RUST_LOG=warn` - Show warnings and errors only
//! - `RUST_LOG=error` - Show errors only

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `logs/` next to the executable, or under the current directory if the
/// executable path is unknown.
pub fn default_log_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Log file name for a run started now, e.g.
/// `terminal-forge.2026-01-01-14-30-25.log`.
pub fn log_file_name() -> String {
    let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    format!("terminal-forge.{timestamp}.log")
}

/// Initialize file logging.
///
/// The returned guard flushes the non-blocking writer when dropped; `main`
/// must keep it alive for the whole run.
pub fn init_logging(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;

    let log_path = log_dir.join(log_file_name());
    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!("Logging initialized - writing to {}", log_path.display());
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_shape() {
        let name = log_file_name();
        assert!(name.starts_with("terminal-forge."));
        assert!(name.ends_with(".log"));
        // terminal-forge. + YYYY-MM-DD-HH-MM-SS + .log
        assert_eq!(name.len(), "terminal-forge.".len() + 19 + ".log".len());
    }

    #[test]
    fn test_default_log_dir_ends_with_logs() {
        assert!(default_log_dir().ends_with("logs"));
    }
}
