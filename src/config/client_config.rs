//! Flat, string-keyed client configuration.
//!
//! Every tunable of the load balancer is a [`ConfigKey`] with a canonical
//! name and a default. A [`ClientConfig`] only stores explicitly set values,
//! so a per-request config can override a handful of keys and defer the rest
//! to the client-wide config.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::LbError;

/// Known configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    PingIntervalSecs,
    MaxTotalPingTimeSecs,
    Rule,
    Ping,
    PingStrategy,
    Stats,
    EnablePrimingConnections,
    PrimingTimeoutMs,
    Zone,
    EnableZoneAffinity,
    EnableZoneExclusivity,
    ConnectionFailureCountThreshold,
    CircuitTrippedTimeoutFactorSecs,
    MaxCircuitTrippedTimeoutSecs,
    ActiveConnectionsLimit,
    ActiveRequestsCountTimeoutSecs,
    WeightRefreshIntervalSecs,
    ServerListRefreshIntervalSecs,
    MaxAutoRetries,
    MaxAutoRetriesNextServer,
    OkToRetryOnAllOperations,
    PingTimeoutMs,
    PingPath,
    ZoneTriggeringLoad,
    ZoneTriggeringBlackoutPercentage,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 25] = [
        ConfigKey::PingIntervalSecs,
        ConfigKey::MaxTotalPingTimeSecs,
        ConfigKey::Rule,
        ConfigKey::Ping,
        ConfigKey::PingStrategy,
        ConfigKey::Stats,
        ConfigKey::EnablePrimingConnections,
        ConfigKey::PrimingTimeoutMs,
        ConfigKey::Zone,
        ConfigKey::EnableZoneAffinity,
        ConfigKey::EnableZoneExclusivity,
        ConfigKey::ConnectionFailureCountThreshold,
        ConfigKey::CircuitTrippedTimeoutFactorSecs,
        ConfigKey::MaxCircuitTrippedTimeoutSecs,
        ConfigKey::ActiveConnectionsLimit,
        ConfigKey::ActiveRequestsCountTimeoutSecs,
        ConfigKey::WeightRefreshIntervalSecs,
        ConfigKey::ServerListRefreshIntervalSecs,
        ConfigKey::MaxAutoRetries,
        ConfigKey::MaxAutoRetriesNextServer,
        ConfigKey::OkToRetryOnAllOperations,
        ConfigKey::PingTimeoutMs,
        ConfigKey::PingPath,
        ConfigKey::ZoneTriggeringLoad,
        ConfigKey::ZoneTriggeringBlackoutPercentage,
    ];

    /// Canonical property name.
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::PingIntervalSecs => "ping_interval_secs",
            ConfigKey::MaxTotalPingTimeSecs => "max_total_ping_time_secs",
            ConfigKey::Rule => "rule",
            ConfigKey::Ping => "ping",
            ConfigKey::PingStrategy => "ping_strategy",
            ConfigKey::Stats => "stats",
            ConfigKey::EnablePrimingConnections => "enable_priming_connections",
            ConfigKey::PrimingTimeoutMs => "priming_timeout_ms",
            ConfigKey::Zone => "zone",
            ConfigKey::EnableZoneAffinity => "enable_zone_affinity",
            ConfigKey::EnableZoneExclusivity => "enable_zone_exclusivity",
            ConfigKey::ConnectionFailureCountThreshold => "connection_failure_count_threshold",
            ConfigKey::CircuitTrippedTimeoutFactorSecs => "circuit_tripped_timeout_factor_secs",
            ConfigKey::MaxCircuitTrippedTimeoutSecs => "max_circuit_tripped_timeout_secs",
            ConfigKey::ActiveConnectionsLimit => "active_connections_limit",
            ConfigKey::ActiveRequestsCountTimeoutSecs => "active_requests_count_timeout_secs",
            ConfigKey::WeightRefreshIntervalSecs => "weight_refresh_interval_secs",
            ConfigKey::ServerListRefreshIntervalSecs => "server_list_refresh_interval_secs",
            ConfigKey::MaxAutoRetries => "max_auto_retries",
            ConfigKey::MaxAutoRetriesNextServer => "max_auto_retries_next_server",
            ConfigKey::OkToRetryOnAllOperations => "ok_to_retry_on_all_operations",
            ConfigKey::PingTimeoutMs => "ping_timeout_ms",
            ConfigKey::PingPath => "ping_path",
            ConfigKey::ZoneTriggeringLoad => "zone_triggering_load",
            ConfigKey::ZoneTriggeringBlackoutPercentage => "zone_triggering_blackout_percentage",
        }
    }

    /// Default value as text; `None` means "unset".
    pub fn default_value(self) -> Option<&'static str> {
        let v = match self {
            ConfigKey::PingIntervalSecs => "30",
            ConfigKey::MaxTotalPingTimeSecs => "2",
            ConfigKey::Rule => "round_robin",
            ConfigKey::Ping => "dummy",
            ConfigKey::PingStrategy => "serial",
            ConfigKey::Stats => "default",
            ConfigKey::EnablePrimingConnections => "false",
            ConfigKey::PrimingTimeoutMs => "2000",
            ConfigKey::Zone => return None,
            ConfigKey::EnableZoneAffinity => "false",
            ConfigKey::EnableZoneExclusivity => "false",
            ConfigKey::ConnectionFailureCountThreshold => "3",
            ConfigKey::CircuitTrippedTimeoutFactorSecs => "10",
            ConfigKey::MaxCircuitTrippedTimeoutSecs => "30",
            ConfigKey::ActiveConnectionsLimit => "4294967295",
            ConfigKey::ActiveRequestsCountTimeoutSecs => "600",
            ConfigKey::WeightRefreshIntervalSecs => "30",
            ConfigKey::ServerListRefreshIntervalSecs => "30",
            ConfigKey::MaxAutoRetries => "0",
            ConfigKey::MaxAutoRetriesNextServer => "1",
            ConfigKey::OkToRetryOnAllOperations => "false",
            ConfigKey::PingTimeoutMs => "2000",
            ConfigKey::PingPath => "/health",
            ConfigKey::ZoneTriggeringLoad => "0.2",
            ConfigKey::ZoneTriggeringBlackoutPercentage => "0.99999",
        };
        Some(v)
    }

    /// Check that `value` parses as this key's type.
    pub fn validate(self, value: &str) -> bool {
        match self {
            ConfigKey::Rule
            | ConfigKey::Ping
            | ConfigKey::PingStrategy
            | ConfigKey::Stats
            | ConfigKey::Zone
            | ConfigKey::PingPath => !value.is_empty(),
            ConfigKey::EnablePrimingConnections
            | ConfigKey::EnableZoneAffinity
            | ConfigKey::EnableZoneExclusivity
            | ConfigKey::OkToRetryOnAllOperations => value.parse::<bool>().is_ok(),
            ConfigKey::ZoneTriggeringLoad | ConfigKey::ZoneTriggeringBlackoutPercentage => {
                value.parse::<f64>().is_ok()
            }
            _ => value.parse::<u64>().is_ok(),
        }
    }
}

impl FromStr for ConfigKey {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| LbError::UnknownComponent {
                kind: "config key",
                name: s.to_string(),
            })
    }
}

/// A set of explicitly configured properties for one client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    name: String,
    properties: HashMap<ConfigKey, String>,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: HashMap::new(),
        }
    }

    /// Client (and load balancer) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set a property, builder style.
    pub fn with(mut self, key: ConfigKey, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: ConfigKey, value: impl ToString) {
        self.properties.insert(key, value.to_string());
    }

    pub fn contains(&self, key: ConfigKey) -> bool {
        self.properties.contains_key(&key)
    }

    /// Explicitly configured value, parsed. `None` when unset or unparsable.
    pub fn get<V: FromStr>(&self, key: ConfigKey) -> Option<V> {
        let raw = self.properties.get(&key)?;
        match raw.parse::<V>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key = key.name(), value = %raw, "Ignoring unparsable property");
                None
            }
        }
    }

    /// Configured value, falling back to the key's default.
    pub fn get_or_default<V: FromStr + Default>(&self, key: ConfigKey) -> V {
        self.get(key)
            .or_else(|| key.default_value().and_then(|d| d.parse().ok()))
            .unwrap_or_default()
    }

    /// Raw text of a configured value or its default.
    pub fn get_str(&self, key: ConfigKey) -> Option<String> {
        self.properties
            .get(&key)
            .cloned()
            .or_else(|| key.default_value().map(str::to_string))
    }

    pub fn duration_secs(&self, key: ConfigKey) -> Duration {
        Duration::from_secs(self.get_or_default::<u64>(key))
    }

    pub fn duration_millis(&self, key: ConfigKey) -> Duration {
        Duration::from_millis(self.get_or_default::<u64>(key))
    }
}
