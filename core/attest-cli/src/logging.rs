//! File logging for the CLI.
//!
//! Output goes to a daily-rotated file under `~/.attest/logs` so stdout stays
//! reserved for command results. Set `ATTEST_DEBUG_LOG=1` for debug output.

use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "attest.log";

/// Install the subscriber. Hold the returned guard until exit so buffered
/// lines are flushed.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    if fs_err::create_dir_all(&dir).is_err() {
        return None;
    }

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init();

    result.ok().map(|_| guard)
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var("ATTEST_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    }
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".attest").join("logs"))
}
