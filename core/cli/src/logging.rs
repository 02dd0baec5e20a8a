//! File logging for the CLI.
//!
//! Stdout carries command output, so logs go to a daily rolling file under
//! `~/.chronicle/logs`. The returned guard flushes the non-blocking writer on
//! drop and must live until the process exits.

use chronicle_core::config::{chronicle_home, debug_log_enabled};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "chronicle.log";

/// Returns `None` when the log directory can't be prepared; the CLI then
/// runs without logging.
pub fn init() -> Option<WorkerGuard> {
    let dir = chronicle_home().ok()?.join(LOG_DIR);
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = if debug_log_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
