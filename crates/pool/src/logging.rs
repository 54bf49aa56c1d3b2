//! Process-wide log sink: installed once at startup.
//!
//! With a directory configured, records go to a daily-rotated
//! `<dir>/YYYY-MM-DD.log`, append-only; otherwise to stdout.

use tracing_appender::rolling::{InitError, Rotation};

use crate::config::{LogFormat, LogLevel, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("opening log directory: {0}")]
    Init(#[from] InitError),
}

pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let level = match config.level {
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };

    match &config.directory {
        Some(directory) => {
            let file = tracing_appender::rolling::Builder::new()
                .rotation(Rotation::DAILY)
                .filename_suffix("log")
                .build(directory)?;
            let builder = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false);
            match config.format {
                LogFormat::Text => builder.init(),
                LogFormat::Json => builder.json().init(),
            }
        }
        None => {
            let builder = tracing_subscriber::fmt().with_max_level(level);
            match config.format {
                LogFormat::Text => builder.init(),
                LogFormat::Json => builder.json().init(),
            }
        }
    }
    Ok(())
}
