use thiserror::Error;
use tracing::Level;

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
#[error("could not install tracing subscriber: {0}")]
pub struct LoggingInitError(String);

/// Installs the global tracing subscriber described by `config`. Embedders
/// that bring their own subscriber simply skip this; a second call reports
/// the conflict instead of panicking.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);

    let result = match config.format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().try_init()
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().try_init()
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().try_init()
        }
    };
    result.map_err(|err| LoggingInitError(err.to_string()))
}
