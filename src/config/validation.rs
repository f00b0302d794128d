//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, backlog > 0, port valid)
//! - Check the log filter parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Addresses are checked for shape only; name resolution happens at bind time

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::ServerConfig;

/// A single semantic problem in the config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.name must not be empty")]
    EmptyListenerName,

    #[error("listener.address '{address}' is invalid: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("listener.backlog must be positive, got {0}")]
    InvalidBacklog(i32),

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("logging.level '{level}' is not a valid filter: {reason}")]
    InvalidLogLevel { level: String, reason: String },
}

/// Check every semantic rule and collect all violations.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.name.trim().is_empty() {
        errors.push(ValidationError::EmptyListenerName);
    }
    if let Err(reason) = check_address(&config.listener.address) {
        errors.push(ValidationError::InvalidAddress {
            address: config.listener.address.clone(),
            reason,
        });
    }
    if config.listener.backlog <= 0 {
        errors.push(ValidationError::InvalidBacklog(config.listener.backlog));
    }

    for (field, secs) in [
        ("http.request_timeout_secs", config.http.request_timeout_secs),
        ("upgrade.drain_timeout_secs", config.upgrade.drain_timeout_secs),
        ("upgrade.ready_timeout_secs", config.upgrade.ready_timeout_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::ZeroTimeout(field));
        }
    }

    if let Err(e) = EnvFilter::try_new(&config.logging.level) {
        errors.push(ValidationError::InvalidLogLevel {
            level: config.logging.level.clone(),
            reason: e.to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(address: &str) -> Result<(), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    port.parse::<u16>()
        .map(|_| ())
        .map_err(|e| format!("bad port '{port}': {e}"))
}
