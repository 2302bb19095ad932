//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const DEFAULT_LOG_FILE: &str = "pcie-device-plugin.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Logs go to stderr unless `log_path` is given, in which case they go to a
/// daily-rotated file next to it. The returned guard flushes the file writer
/// on drop and must be held for the lifetime of the process.
pub fn init(log_path: Option<&Path>) -> Option<WorkerGuard> {
    let Some(log_path) = log_path else {
        let fmt_layer = layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(env_filter());
        registry().with(fmt_layer).init();
        return None;
    };

    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file = log_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);

    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(fmt_layer).init();
            tracing::warn!(
                "cannot write logs to {}, logging to stderr: {e}",
                log_path.display()
            );
            return None;
        }
    };

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let fmt_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
    Some(file_guard)
}
