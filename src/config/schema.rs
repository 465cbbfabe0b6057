//! Configuration schema definitions.
//!
//! This module defines the on-disk configuration structure.
//! All types derive Serde traits for deserialization from TOML files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::client_config::{ClientConfig, ConfigKey};
use crate::load_balancer::server::{Server, UNKNOWN_ZONE};
use crate::error::LbError;

/// Root configuration file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RibbonConfig {
    /// Load balanced client definition.
    pub client: ClientSection,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// The load balanced client: its servers and tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSection {
    /// Client name, used as the load balancer name in logs and metrics.
    pub name: String,

    /// Initial server list.
    pub servers: Vec<ServerEntry>,

    /// Free-form properties keyed by [`ConfigKey`] names.
    pub properties: BTreeMap<String, toml::Value>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            servers: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

/// A server as written in the config file.
///
/// Either a bare `"host:port"` string or a table with an explicit zone.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ServerEntry {
    Address(String),
    Detailed {
        address: String,
        #[serde(default)]
        zone: Option<String>,
    },
}

impl ServerEntry {
    pub fn address(&self) -> &str {
        match self {
            ServerEntry::Address(a) => a,
            ServerEntry::Detailed { address, .. } => address,
        }
    }

    pub fn zone(&self) -> &str {
        match self {
            ServerEntry::Detailed { zone: Some(z), .. } => z,
            _ => UNKNOWN_ZONE,
        }
    }

    /// Build the runtime server.
    pub fn to_server(&self) -> Result<Server, LbError> {
        Server::parse(self.address()).map(|s| s.in_zone(self.zone()))
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Render a TOML scalar as the text stored in [`ClientConfig`].
pub(crate) fn property_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ClientSection {
    /// Convert the properties table into a [`ClientConfig`].
    ///
    /// Unknown keys are skipped here; validation reports them.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.name.clone());
        for (key, value) in &self.properties {
            if let Ok(k) = key.parse::<ConfigKey>() {
                config.set(k, property_text(value));
            }
        }
        config
    }

    /// Parse every configured server, skipping (and logging) invalid ones.
    pub fn parsed_servers(&self) -> Vec<Server> {
        self.servers
            .iter()
            .filter_map(|entry| match entry.to_server() {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping invalid server entry");
                    None
                }
            })
            .collect()
    }
}
