//! Server predicates used by filtering rules.
//!
//! A predicate narrows a candidate list in one pass, which lets predicates
//! like zone avoidance compute their per-selection state once.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::ConfigKey;
use crate::load_balancer::server::{normalize_zone, Server};
use crate::load_balancer::LoadBalancer;
use crate::rule::zone_avoidance::available_zones;

/// Narrows a candidate list.
pub trait ServerPredicate: Send + Sync + std::fmt::Debug {
    fn eligible(&self, lb: &dyn LoadBalancer, servers: &[Arc<Server>], key: Option<&str>) -> Vec<Arc<Server>>;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysTrue;

impl ServerPredicate for AlwaysTrue {
    fn eligible(&self, _lb: &dyn LoadBalancer, servers: &[Arc<Server>], _key: Option<&str>) -> Vec<Arc<Server>> {
        servers.to_vec()
    }
}

/// Rejects servers with a tripped circuit breaker or too many active
/// requests. Servers without stats pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct AvailabilityPredicate;

impl AvailabilityPredicate {
    pub fn should_skip(lb: &dyn LoadBalancer, server: &Server) -> bool {
        let limit: u64 = lb.client_config().get_or_default(ConfigKey::ActiveConnectionsLimit);
        match lb.stats().peek(server.id()) {
            Some(stat) => stat.is_circuit_breaker_tripped() || stat.active_requests_count() >= limit,
            None => false,
        }
    }
}

impl ServerPredicate for AvailabilityPredicate {
    fn eligible(&self, lb: &dyn LoadBalancer, servers: &[Arc<Server>], _key: Option<&str>) -> Vec<Arc<Server>> {
        servers
            .iter()
            .filter(|s| !Self::should_skip(lb, s))
            .cloned()
            .collect()
    }
}

/// Drops servers in zones that are currently avoided.
///
/// Does nothing while at most one zone is known.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZoneAvoidancePredicate;

impl ServerPredicate for ZoneAvoidancePredicate {
    fn eligible(&self, lb: &dyn LoadBalancer, servers: &[Arc<Server>], _key: Option<&str>) -> Vec<Arc<Server>> {
        let stats = lb.stats();
        let snapshot = stats.zone_snapshots();
        if snapshot.len() <= 1 {
            return servers.to_vec();
        }

        let config = lb.client_config();
        let triggering_load: f64 = config.get_or_default(ConfigKey::ZoneTriggeringLoad);
        let triggering_blackout: f64 = config.get_or_default(ConfigKey::ZoneTriggeringBlackoutPercentage);
        let available: HashSet<String> = available_zones(&snapshot, triggering_load, triggering_blackout);

        servers
            .iter()
            .filter(|s| {
                let zone = normalize_zone(s.zone());
                !snapshot.contains_key(&zone) || available.contains(&zone)
            })
            .cloned()
            .collect()
    }
}

/// All `primary` predicates combined, with fallbacks tried in order while
/// the result stays too small.
#[derive(Debug)]
pub struct CompositePredicate {
    primary: Vec<Arc<dyn ServerPredicate>>,
    fallbacks: Vec<Arc<dyn ServerPredicate>>,
    min_filtered_servers: usize,
    min_filtered_ratio: f64,
}

impl CompositePredicate {
    pub fn new(primary: Vec<Arc<dyn ServerPredicate>>) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            min_filtered_servers: 1,
            min_filtered_ratio: 0.0,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ServerPredicate>) -> Self {
        self.fallbacks.push(fallback);
        self
    }

    pub fn with_minimums(mut self, servers: usize, ratio: f64) -> Self {
        self.min_filtered_servers = servers;
        self.min_filtered_ratio = ratio;
        self
    }

    fn too_small(&self, filtered: usize, total: usize) -> bool {
        filtered < self.min_filtered_servers || (filtered as f64) <= total as f64 * self.min_filtered_ratio
    }
}

impl ServerPredicate for CompositePredicate {
    fn eligible(&self, lb: &dyn LoadBalancer, servers: &[Arc<Server>], key: Option<&str>) -> Vec<Arc<Server>> {
        let mut result = servers.to_vec();
        for p in &self.primary {
            result = p.eligible(lb, &result, key);
        }

        let mut fallbacks = self.fallbacks.iter();
        while self.too_small(result.len(), servers.len()) {
            match fallbacks.next() {
                Some(p) => result = p.eligible(lb, servers, key),
                None => break,
            }
        }
        result
    }
}
