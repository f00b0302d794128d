//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Configure log level from config and environment
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Build the filter: `RUST_LOG` if set and valid, the configured level otherwise.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ParseError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config)?;

    let (json, pretty) = match config.format {
        LogFormat::Json => (Some(fmt::layer().json().with_current_span(true)), None),
        LogFormat::Pretty => (None, Some(fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()?;

    Ok(())
}
