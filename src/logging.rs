use std::fs;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Installs the global subscriber: human-readable lines on stderr and, when
/// enabled, JSON lines in a daily-rotated file. Hold the returned guard until
/// exit so buffered file output is flushed.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.default_filter)));

    let mut dir_error = None;
    let (file_layer, guard) = if config.to_file {
        match fs::create_dir_all(&config.directory) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&config.directory, &config.file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (Some(fmt::layer().json().with_writer(writer)), Some(guard))
            }
            Err(e) => {
                dir_error = Some(e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    // A subscriber may already be set (tests, embedding); keep it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    if let Some(e) = dir_error {
        warn!(directory = %config.directory.display(), "File logging disabled: {}", e);
    }
    guard
}
