//! Logging sink.
//!
//! Installs the global `tracing` subscriber once at startup. `RUST_LOG`
//! overrides the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use cont_core::error::{ContError, Result};
use cont_core::log::{LogConfig, LogFormat};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber described by `config`.
///
/// Logs go to stderr, or are appended to `config.file` when set. Fails if a
/// global subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let default_level = LevelFilter::from_level(config.level.into());
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let writer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
                ContError::ConfigError(format!("Failed to open log file {}: {}", path.display(), e))
            })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(config.file.is_none())
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| ContError::ConfigError(format!("Logging already initialized: {}", e)))
}
