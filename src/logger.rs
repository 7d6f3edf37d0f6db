use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub(crate) log_level: String,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) file_prefix: String,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            file_prefix: "chatpipe.log".to_string(),
        }
    }

    pub fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            file_prefix: "chatpipe.log".to_string(),
        }
    }

    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }
}

/// Install the global tracing subscriber: env-filtered fmt output, plus a
/// daily-rolling file layer when a log directory is configured. Returns
/// the appender guard which must stay alive for file output to flush.
/// `RUST_LOG` overrides the configured level. Calling twice is harmless;
/// the first subscriber wins.
pub fn init_tracing(config: LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let stdout_layer = fmt::layer().with_target(true);

    match config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_ansi(false).with_writer(writer);
            Registry::default()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init()
                .ok();
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(filter)
                .with(stdout_layer)
                .try_init()
                .ok();
            Ok(None)
        }
    }
}
