//! Named component factories.
//!
//! Rules, pings, ping strategies and stats are configured by name (the
//! `rule`, `ping`, `ping_strategy` and `stats` properties). The registry
//! maps each name to a constructor closure; an unknown name is a
//! construction error.
//!
//! # Builtins
//! ```text
//! rule:          round_robin | random | best_available | availability_filtering
//!                | zone_avoidance | weighted_response_time
//! ping:          dummy | tcp | http | always_up | always_down
//! ping_strategy: serial | parallel
//! stats:         default
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ClientConfig, ConfigKey};
use crate::error::LbError;
use crate::load_balancer::ping::{
    ConstantPing, HttpPing, NoOpPing, ParallelPingStrategy, Ping, PingStrategy, SerialPingStrategy, TcpPing,
};
use crate::load_balancer::stats::{LoadBalancerStats, StatsSettings};
use crate::rule::{
    AvailabilityFilteringRule, BestAvailableRule, RandomRule, RoundRobinRule, Rule, WeightedResponseTimeRule,
    ZoneAvoidanceRule,
};

type Factory<T> = Arc<dyn Fn(&ClientConfig) -> Arc<T> + Send + Sync>;

/// Maps component names to constructors.
#[derive(Clone)]
pub struct Registry {
    rules: HashMap<String, Factory<dyn Rule>>,
    pings: HashMap<String, Factory<dyn Ping>>,
    ping_strategies: HashMap<String, Factory<dyn PingStrategy>>,
    stats: HashMap<String, Factory<LoadBalancerStats>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("rules", &sorted_names(&self.rules))
            .field("pings", &sorted_names(&self.pings))
            .field("ping_strategies", &sorted_names(&self.ping_strategies))
            .field("stats", &sorted_names(&self.stats))
            .finish()
    }
}

fn sorted_names<V>(map: &HashMap<String, V>) -> Vec<&str> {
    let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Registry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            pings: HashMap::new(),
            ping_strategies: HashMap::new(),
            stats: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        registry.register_rule("round_robin", |_| Arc::new(RoundRobinRule::new()));
        registry.register_rule("random", |_| Arc::new(RandomRule::new()));
        registry.register_rule("best_available", |_| Arc::new(BestAvailableRule::new()));
        registry.register_rule("availability_filtering", |_| Arc::new(AvailabilityFilteringRule::new()));
        registry.register_rule("zone_avoidance", |_| Arc::new(ZoneAvoidanceRule::new()));
        registry.register_rule("weighted_response_time", |_| Arc::new(WeightedResponseTimeRule::new()));

        registry.register_ping("dummy", |_| Arc::new(NoOpPing));
        registry.register_ping("always_up", |_| Arc::new(ConstantPing(true)));
        registry.register_ping("always_down", |_| Arc::new(ConstantPing(false)));
        registry.register_ping("tcp", |config| {
            Arc::new(TcpPing::new(config.duration_millis(ConfigKey::PingTimeoutMs)))
        });
        registry.register_ping("http", |config| {
            let path = config.get_str(ConfigKey::PingPath).unwrap_or_else(|| "/".to_string());
            Arc::new(HttpPing::new(path, config.duration_millis(ConfigKey::PingTimeoutMs)))
        });

        registry.register_ping_strategy("serial", |_| Arc::new(SerialPingStrategy));
        registry.register_ping_strategy("parallel", |_| Arc::new(ParallelPingStrategy));

        registry.register_stats("default", |config| {
            Arc::new(LoadBalancerStats::new(config.name(), StatsSettings::from_config(config)))
        });

        registry
    }

    pub fn register_rule<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ClientConfig) -> Arc<dyn Rule> + Send + Sync + 'static,
    {
        self.rules.insert(name.into(), Arc::new(factory));
    }

    pub fn register_ping<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ClientConfig) -> Arc<dyn Ping> + Send + Sync + 'static,
    {
        self.pings.insert(name.into(), Arc::new(factory));
    }

    pub fn register_ping_strategy<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ClientConfig) -> Arc<dyn PingStrategy> + Send + Sync + 'static,
    {
        self.ping_strategies.insert(name.into(), Arc::new(factory));
    }

    pub fn register_stats<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ClientConfig) -> Arc<LoadBalancerStats> + Send + Sync + 'static,
    {
        self.stats.insert(name.into(), Arc::new(factory));
    }

    fn create<T: ?Sized>(
        factories: &HashMap<String, Factory<T>>,
        kind: &'static str,
        key: ConfigKey,
        config: &ClientConfig,
    ) -> Result<Arc<T>, LbError> {
        let name = config.get_str(key).unwrap_or_default();
        match factories.get(&name) {
            Some(factory) => {
                tracing::debug!(client = %config.name(), kind, name = %name, "Creating component");
                Ok(factory(config))
            }
            None => {
                tracing::error!(client = %config.name(), kind, name = %name, "Unknown component");
                Err(LbError::UnknownComponent { kind, name })
            }
        }
    }

    pub fn create_rule(&self, config: &ClientConfig) -> Result<Arc<dyn Rule>, LbError> {
        Self::create(&self.rules, "rule", ConfigKey::Rule, config)
    }

    pub fn create_ping(&self, config: &ClientConfig) -> Result<Arc<dyn Ping>, LbError> {
        Self::create(&self.pings, "ping", ConfigKey::Ping, config)
    }

    pub fn create_ping_strategy(&self, config: &ClientConfig) -> Result<Arc<dyn PingStrategy>, LbError> {
        Self::create(&self.ping_strategies, "ping strategy", ConfigKey::PingStrategy, config)
    }

    pub fn create_stats(&self, config: &ClientConfig) -> Result<Arc<LoadBalancerStats>, LbError> {
        Self::create(&self.stats, "stats", ConfigKey::Stats, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{BaseLoadBalancer, LoadBalancer};
    use crate::observability::NoopMetrics;

    #[test]
    fn test_defaults_resolve() {
        let registry = Registry::default();
        let config = ClientConfig::new("reg");
        assert_eq!(registry.create_rule(&config).unwrap().name(), "round_robin");
        assert!(registry.create_ping(&config).unwrap().is_dummy());
        assert_eq!(registry.create_stats(&config).unwrap().name(), "reg");
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let registry = Registry::default();
        let config = ClientConfig::new("reg").with(ConfigKey::Rule, "fastest_please");
        let err = registry.create_rule(&config).unwrap_err();
        assert!(matches!(err, LbError::UnknownComponent { kind: "rule", ref name } if name == "fastest_please"));

        let result = BaseLoadBalancer::from_config(config, &registry, Arc::new(NoopMetrics));
        assert!(result.is_err());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = Registry::empty();
        registry.register_rule("mine", |_| Arc::new(RandomRule::new()));
        registry.register_ping("dummy", |_| Arc::new(NoOpPing));
        registry.register_ping_strategy("serial", |_| Arc::new(SerialPingStrategy));
        registry.register_stats("default", |c| {
            Arc::new(LoadBalancerStats::new(c.name(), StatsSettings::default()))
        });

        let config = ClientConfig::new("custom").with(ConfigKey::Rule, "mine");
        let lb = BaseLoadBalancer::from_config(config, &registry, Arc::new(NoopMetrics)).unwrap();
        assert_eq!(lb.rule_name(), Some("random"));
        lb.set_servers_list(vec!["a:1"]);
        assert_eq!(lb.choose_server(None).unwrap().id(), "a:1");
    }
}
