//! Logging infrastructure for clusterdiag
//!
//! Every process (operator commands and instance agents alike) appends to
//! `$XDG_STATE_HOME/clusterdiag/clusterdiag.log.<date>`. The file is local to
//! the host; nothing is logged to the shared store.
//!
//! Verbose CLI runs can mirror events to stderr as well. The file keeps its
//! own filter (`RUST_LOG` or `logging.level`), the mirror uses a fixed level.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Flushes buffered file output when dropped; hold it for the process lifetime.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Stderr level for a CLI verbosity count (`-v` repeated).
///
/// A single `-v` only widens command output; logs reach the terminal from `-vv`.
pub fn console_level(verbosity: u8) -> Option<LevelFilter> {
    match verbosity {
        0 | 1 => None,
        2 => Some(LevelFilter::INFO),
        _ => Some(LevelFilter::DEBUG),
    }
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig, console: Option<LevelFilter>) -> Result<LoggingGuard> {
    let (log_dir, file_prefix) = log_location();
    std::fs::create_dir_all(&log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&file_prefix)
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(file_filter);

    let console_layer = console.map(|level| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_filter(level)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install logger: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        console = ?console,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Test logging to the captured test writer; safe to call repeatedly.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Directory and rolling-file prefix, split from [`Config::log_path`].
fn log_location() -> (PathBuf, String) {
    let path = Config::log_path();
    let dir = path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(Config::state_dir);
    let prefix = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("clusterdiag.log")
        .to_string();
    (dir, prefix)
}
