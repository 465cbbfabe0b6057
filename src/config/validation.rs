//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check property keys are known and values parse as the key's type
//! - Validate server addresses and value ranges
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::client_config::ConfigKey;
use crate::config::schema::{property_text, RibbonConfig};

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyClientName,
    UnknownProperty(String),
    InvalidPropertyValue { key: String, value: String },
    InvalidServer(String),
    ZeroPingInterval,
    InvalidMetricsAddress(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyClientName => write!(f, "client.name must not be empty"),
            ValidationError::UnknownProperty(k) => write!(f, "unknown property '{}'", k),
            ValidationError::InvalidPropertyValue { key, value } => {
                write!(f, "invalid value '{}' for property '{}'", value, key)
            }
            ValidationError::InvalidServer(a) => write!(f, "invalid server address '{}'", a),
            ValidationError::ZeroPingInterval => write!(f, "ping_interval_secs must be > 0"),
            ValidationError::InvalidMetricsAddress(a) => {
                write!(f, "invalid metrics address '{}'", a)
            }
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &RibbonConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.client.name.trim().is_empty() {
        errors.push(ValidationError::EmptyClientName);
    }

    for (key, value) in &config.client.properties {
        let text = property_text(value);
        match key.parse::<ConfigKey>() {
            Ok(k) if !k.validate(&text) => errors.push(ValidationError::InvalidPropertyValue {
                key: key.clone(),
                value: text,
            }),
            Ok(ConfigKey::PingIntervalSecs) if text == "0" => {
                errors.push(ValidationError::ZeroPingInterval)
            }
            Ok(_) => {}
            Err(_) => errors.push(ValidationError::UnknownProperty(key.clone())),
        }
    }

    for entry in &config.client.servers {
        if entry.to_server().is_err() {
            errors.push(ValidationError::InvalidServer(entry.address().to_string()));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
