//! Tracing subscriber setup.
//!
//! Logs always go to stderr (stdout carries the JSON host protocol). With
//! `logging.file` enabled they are also written to daily-rotated files
//! `recurra.YYYY-MM-DD.log` under [`crate::recurra_dirs::logs_dir`].

use crate::config::LoggingConfig;
use crate::error::{Result, SchedulerError};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Maximum number of daily log files kept.
pub const MAX_LOG_FILES: usize = 7;

/// Filter from `RUST_LOG`, falling back to the configured level.
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Daily appender in `dir`, pruning beyond [`MAX_LOG_FILES`].
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("recurra")
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .map_err(|e| SchedulerError::Config(format!("cannot open log file: {e}")))
}

/// Install the global subscriber.
///
/// Returns the file writer guard, which must be kept alive for buffered
/// file output to be flushed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if config.file {
        let appender = file_appender(&crate::recurra_dirs::logs_dir())?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SchedulerError::Config(format!("tracing already initialised: {e}")))?;
    Ok(guard)
}
