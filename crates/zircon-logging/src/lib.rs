//! Logging setup shared by the zircon daemons.
//!
//! Daemons always log to stdout; a rolled file mirror is optional. The
//! filter takes full tracing directives, so a deployment can turn single
//! subsystems up without drowning in chunk traffic, e.g.
//! `"info,zircon_lease=debug,zircon_chunkserver=warn"`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Shape of emitted log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines for operators at a terminal.
    #[default]
    Text,
    /// One JSON object per line, for shipping to a collector.
    Json,
}

/// Optional file mirror: daily-rolled files next to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLog {
    /// Directory the rolled files land in.
    pub dir: PathBuf,
    /// File name prefix; the daemon name by convention
    /// (`zircon-chunkserver.<date>`).
    pub prefix: String,
}

impl FileLog {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Tracing filter directives. `RUST_LOG` wins when set, so an
    /// operator can override a deployed config without touching it.
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Mirror log lines into rolled files as well as stdout.
    #[serde(default)]
    pub file: Option<FileLog>,
}

fn default_filter() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Initialize the logging system. Call once at program startup.
///
/// Returns a guard that must stay alive for the duration of the program
/// when file logging is on (it owns the non-blocking writer).
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let stdout_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = match config.format {
        LogFormat::Text => Box::new(fmt::layer()),
        LogFormat::Json => Box::new(fmt::layer().json()),
    };

    let (file_layer, guard) = match &config.file {
        Some(file) => {
            let appender = rolling::daily(&file.dir, &file.prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = match config.format {
                LogFormat::Text => Box::new(fmt::layer().with_ansi(false).with_writer(writer)),
                LogFormat::Json => Box::new(fmt::layer().json().with_writer(writer)),
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}
