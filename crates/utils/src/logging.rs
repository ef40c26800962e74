//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "podgrid.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Build a daily rolling appender in `log_dir`, keeping the last three files.
pub fn rolling_appender(
    log_dir: &Path,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(3)
        .build(log_dir)
}

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. When `log_dir` is given, they are also written to
/// a daily rolling file there; the returned guard must be kept alive for the
/// file writer to flush.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let mut appender_error = None;
    let (file_layer, guard) = match log_dir.map(rolling_appender) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(file_layer), Some(guard))
        }
        Some(Err(e)) => {
            appender_error = Some(e);
            (None, None)
        }
        None => (None, None),
    };

    registry().with(fmt_layer).with(file_layer).init();

    if let Some(e) = appender_error {
        tracing::warn!("Failed to create rolling log file, logging to stderr only: {e}");
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_appender_creates_files_in_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let appender = rolling_appender(dir.path());
        assert!(appender.is_ok());
    }
}
