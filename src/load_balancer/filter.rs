//! Server list filters applied before a list reaches the load balancer.
//!
//! # Data Flow
//! ```text
//! ServerList::updated_servers()
//!     → ZoneAffinityServerListFilter (same zone, unless that zone is unhealthy)
//!     → ZonePreferenceServerListFilter (local zone, unless nothing matches)
//!     → BaseLoadBalancer::set_servers_list
//! ```

use std::sync::Arc;

use crate::config::{ClientConfig, ConfigKey};
use crate::load_balancer::server::{normalize_zone, Server};
use crate::load_balancer::stats::LoadBalancerStats;

const MAX_BLACKOUT_PERCENTAGE: f64 = 0.8;
const MAX_LOAD_PER_SERVER: f64 = 0.6;
const MIN_AVAILABLE_SERVERS: usize = 2;

/// Narrows a candidate server list.
pub trait ServerListFilter: Send + Sync + std::fmt::Debug {
    fn filtered(&self, servers: &[Arc<Server>]) -> Vec<Arc<Server>>;
}

fn same_zone(server: &Server, zone: &str) -> bool {
    normalize_zone(server.zone()) == normalize_zone(zone)
}

/// Keeps servers in the local zone when zone affinity or exclusivity is on.
///
/// With affinity only, the narrowed list is dropped in favour of the full one
/// when the local zone looks unhealthy. Exclusivity never falls back.
#[derive(Debug)]
pub struct ZoneAffinityServerListFilter {
    zone: Option<String>,
    affinity: bool,
    exclusivity: bool,
    stats: Arc<LoadBalancerStats>,
}

impl ZoneAffinityServerListFilter {
    pub fn new(config: &ClientConfig, stats: Arc<LoadBalancerStats>) -> Self {
        Self {
            zone: config.get_str(ConfigKey::Zone).filter(|z| !z.is_empty()),
            affinity: config.get_or_default(ConfigKey::EnableZoneAffinity),
            exclusivity: config.get_or_default(ConfigKey::EnableZoneExclusivity),
            stats,
        }
    }

    pub fn local_zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    fn zone_is_healthy(&self, zone_servers: &[Arc<Server>]) -> bool {
        let snapshot = self.stats.snapshot_for(zone_servers);
        if snapshot.instance_count == 0 {
            return false;
        }
        let blackout = snapshot.circuit_tripped_count as f64 / snapshot.instance_count as f64;
        let available = snapshot.instance_count - snapshot.circuit_tripped_count;
        let healthy = blackout < MAX_BLACKOUT_PERCENTAGE
            && snapshot.load_per_server < MAX_LOAD_PER_SERVER
            && available >= MIN_AVAILABLE_SERVERS;
        if !healthy {
            tracing::debug!(
                zone = ?self.zone,
                blackout,
                load_per_server = snapshot.load_per_server,
                available,
                "Local zone unhealthy, zone affinity disabled for this list"
            );
        }
        healthy
    }
}

impl ServerListFilter for ZoneAffinityServerListFilter {
    fn filtered(&self, servers: &[Arc<Server>]) -> Vec<Arc<Server>> {
        let Some(zone) = self.zone.as_deref() else {
            return servers.to_vec();
        };
        if !self.affinity && !self.exclusivity {
            return servers.to_vec();
        }

        let local: Vec<Arc<Server>> = servers.iter().filter(|s| same_zone(s, zone)).cloned().collect();
        if self.exclusivity || self.zone_is_healthy(&local) {
            local
        } else {
            servers.to_vec()
        }
    }
}

/// Prefers the local zone on top of [`ZoneAffinityServerListFilter`].
///
/// Only narrows when the parent left the list untouched, and returns the
/// parent output unchanged when no server is in the local zone.
#[derive(Debug)]
pub struct ZonePreferenceServerListFilter {
    parent: ZoneAffinityServerListFilter,
}

impl ZonePreferenceServerListFilter {
    pub fn new(config: &ClientConfig, stats: Arc<LoadBalancerStats>) -> Self {
        Self {
            parent: ZoneAffinityServerListFilter::new(config, stats),
        }
    }
}

impl ServerListFilter for ZonePreferenceServerListFilter {
    fn filtered(&self, servers: &[Arc<Server>]) -> Vec<Arc<Server>> {
        let parent_output = self.parent.filtered(servers);
        let Some(zone) = self.parent.local_zone() else {
            return parent_output;
        };
        if parent_output.len() != servers.len() {
            return parent_output;
        }

        let local: Vec<Arc<Server>> = parent_output
            .iter()
            .filter(|s| same_zone(s, zone))
            .cloned()
            .collect();
        if local.is_empty() {
            parent_output
        } else {
            local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::stats::StatsSettings;

    fn stats() -> Arc<LoadBalancerStats> {
        Arc::new(LoadBalancerStats::new("filter", StatsSettings::default()))
    }

    fn servers(zones: &[(&str, &str)]) -> Vec<Arc<Server>> {
        zones
            .iter()
            .map(|(host, zone)| Arc::new(Server::with_zone(*host, 80, *zone)))
            .collect()
    }

    fn ids(list: &[Arc<Server>]) -> Vec<&str> {
        list.iter().map(|s| s.id()).collect()
    }

    #[test]
    fn test_preference_falls_back_when_no_local_server() {
        let list = servers(&[("a", "zoneA"), ("b", "zoneB")]);
        let filter = ZonePreferenceServerListFilter::new(
            &ClientConfig::new("f").with(ConfigKey::Zone, "zoneC"),
            stats(),
        );
        assert_eq!(ids(&filter.filtered(&list)), vec!["a:80", "b:80"]);
    }

    #[test]
    fn test_preference_narrows_case_insensitively() {
        let list = servers(&[("a", "zoneA"), ("b", "ZONEB"), ("c", "zoneb")]);
        let filter = ZonePreferenceServerListFilter::new(
            &ClientConfig::new("f").with(ConfigKey::Zone, "zoneB"),
            stats(),
        );
        assert_eq!(ids(&filter.filtered(&list)), vec!["b:80", "c:80"]);
    }

    #[test]
    fn test_zone_folding_matches_stats() {
        let list = servers(&[("a", "ZÜRICH-1"), ("b", "Genf-1")]);
        let stats = stats();
        stats.update_zone_server_mapping(&list);
        let filter = ZonePreferenceServerListFilter::new(
            &ClientConfig::new("f").with(ConfigKey::Zone, "zürich-1"),
            stats.clone(),
        );
        assert_eq!(ids(&filter.filtered(&list)), vec!["a:80"]);
        assert_eq!(stats.zone_snapshot("zürich-1").instance_count, 1);
    }

    #[test]
    fn test_preference_without_zone_is_noop() {
        let list = servers(&[("a", "zoneA"), ("b", "zoneB")]);
        let filter = ZonePreferenceServerListFilter::new(&ClientConfig::new("f"), stats());
        assert_eq!(filter.filtered(&list).len(), 2);
    }

    #[test]
    fn test_affinity_respects_zone_health() {
        let list = servers(&[("a1", "zoneA"), ("a2", "zoneA"), ("b1", "zoneB")]);
        let stats = stats();
        let config = ClientConfig::new("f")
            .with(ConfigKey::Zone, "zoneA")
            .with(ConfigKey::EnableZoneAffinity, true);
        let filter = ZoneAffinityServerListFilter::new(&config, stats.clone());
        assert_eq!(ids(&filter.filtered(&list)), vec!["a1:80", "a2:80"]);

        // Trip one of the two local servers: fewer than two available.
        for _ in 0..3 {
            stats.increment_successive_connection_failure(&list[0]);
        }
        assert_eq!(filter.filtered(&list).len(), 3);
    }

    #[test]
    fn test_exclusivity_always_restricts() {
        let list = servers(&[("a1", "zoneA"), ("b1", "zoneB")]);
        let config = ClientConfig::new("f")
            .with(ConfigKey::Zone, "zoneA")
            .with(ConfigKey::EnableZoneExclusivity, true);
        let filter = ZoneAffinityServerListFilter::new(&config, stats());
        assert_eq!(ids(&filter.filtered(&list)), vec!["a1:80"]);
    }

    #[test]
    fn test_preference_keeps_parent_narrowing() {
        let list = servers(&[("a1", "zoneA"), ("a2", "zoneA"), ("b1", "zoneB")]);
        let config = ClientConfig::new("f")
            .with(ConfigKey::Zone, "zoneA")
            .with(ConfigKey::EnableZoneAffinity, true);
        let filter = ZonePreferenceServerListFilter::new(&config, stats());
        assert_eq!(ids(&filter.filtered(&list)), vec!["a1:80", "a2:80"]);
    }
}
