//! Weighted response time selection.
//!
//! Each server's weight is the sum of all mean response times minus its
//! own, so faster servers take a larger share. Weights are recomputed
//! lazily once they are older than `weight_refresh_interval_secs` or the
//! server list changed. Without response time data the rule behaves like
//! round robin.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use rand::Rng;

use crate::config::ConfigKey;
use crate::load_balancer::server::Server;
use crate::load_balancer::LoadBalancer;
use crate::rule::{is_usable, Rule, RoundRobinRule};

#[derive(Debug)]
struct Weights {
    computed_at: Option<Instant>,
    ids: Vec<String>,
    /// Running sums; `accumulated[i]` covers servers `0..=i`.
    accumulated: Vec<f64>,
}

impl Weights {
    fn empty() -> Self {
        Self {
            computed_at: None,
            ids: Vec::new(),
            accumulated: Vec::new(),
        }
    }

    fn total(&self) -> f64 {
        self.accumulated.last().copied().unwrap_or(0.0)
    }
}

#[derive(Debug)]
pub struct WeightedResponseTimeRule {
    weights: ArcSwap<Weights>,
    fallback: RoundRobinRule,
}

impl Default for WeightedResponseTimeRule {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedResponseTimeRule {
    pub fn new() -> Self {
        Self {
            weights: ArcSwap::from_pointee(Weights::empty()),
            fallback: RoundRobinRule::new(),
        }
    }

    /// Recompute weights from the current response time stats.
    pub fn maintain_weights(&self, lb: &dyn LoadBalancer) {
        let all = lb.all_servers();
        let stats = lb.stats();
        let means: Vec<f64> = all
            .iter()
            .map(|s| stats.peek(s.id()).map(|st| st.response_time_avg()).unwrap_or(0.0))
            .collect();
        let total: f64 = means.iter().sum();

        let mut running = 0.0;
        let accumulated = means
            .iter()
            .map(|m| {
                running += total - m;
                running
            })
            .collect();

        self.weights.store(Arc::new(Weights {
            computed_at: Some(Instant::now()),
            ids: all.iter().map(|s| s.id().to_string()).collect(),
            accumulated,
        }));
        tracing::debug!(lb = %lb.name(), servers = all.len(), total_response_ms = total, "Weights recomputed");
    }

    /// Current accumulated weights, for inspection.
    pub fn accumulated_weights(&self) -> Vec<f64> {
        self.weights.load().accumulated.clone()
    }

    fn is_stale(&self, lb: &dyn LoadBalancer, all: &[Arc<Server>]) -> bool {
        let weights = self.weights.load();
        let interval = lb.client_config().duration_secs(ConfigKey::WeightRefreshIntervalSecs);
        let expired = weights
            .computed_at
            .map(|t| t.elapsed() >= interval)
            .unwrap_or(true);
        expired
            || weights.ids.len() != all.len()
            || weights.ids.iter().zip(all.iter()).any(|(id, s)| id != s.id())
    }
}

impl Rule for WeightedResponseTimeRule {
    fn name(&self) -> &'static str {
        "weighted_response_time"
    }

    fn choose(&self, lb: &dyn LoadBalancer, key: Option<&str>) -> Option<Arc<Server>> {
        let all = lb.all_servers();
        if all.is_empty() {
            return None;
        }
        if self.is_stale(lb, &all) {
            self.maintain_weights(lb);
        }

        let weights = self.weights.load();
        let total = weights.total();
        if total < 0.001 || weights.accumulated.len() != all.len() {
            return self.fallback.choose(lb, key);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..all.len() {
            let pick = rng.gen_range(0.0..total);
            let index = weights
                .accumulated
                .iter()
                .position(|w| *w >= pick)
                .unwrap_or(all.len() - 1);
            let server = &all[index];
            if is_usable(server) {
                return Some(server.clone());
            }
        }
        self.fallback.choose(lb, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::load_balancer::BaseLoadBalancer;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_without_data_behaves_like_round_robin() {
        let lb = BaseLoadBalancer::builder(ClientConfig::new("w")).build();
        lb.set_servers_list(vec!["a:1", "b:1"]);
        let rule = WeightedResponseTimeRule::new();
        assert_eq!(rule.choose(lb.as_ref(), None).unwrap().id(), "a:1");
        assert_eq!(rule.choose(lb.as_ref(), None).unwrap().id(), "b:1");
    }

    #[test]
    fn test_faster_server_gets_more_traffic() {
        let lb = BaseLoadBalancer::builder(ClientConfig::new("w")).build();
        lb.set_servers_list(vec!["fast:1", "slow:1"]);
        let all = lb.all_servers();
        for _ in 0..5 {
            lb.stats().note_open_connection(&all[0]);
            lb.stats().note_request_completion(&all[0], Duration::from_millis(10));
            lb.stats().note_open_connection(&all[1]);
            lb.stats().note_request_completion(&all[1], Duration::from_millis(90));
        }

        let rule = WeightedResponseTimeRule::new();
        rule.maintain_weights(lb.as_ref());
        let w = rule.accumulated_weights();
        assert!((w[0] - 90.0).abs() < 1e-6);
        assert!((w[1] - 100.0).abs() < 1e-6);

        let mut hits: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            let s = rule.choose(lb.as_ref(), None).unwrap();
            *hits.entry(s.id().to_string()).or_default() += 1;
        }
        assert!(hits["fast:1"] > hits["slow:1"] * 3);
    }

    #[test]
    fn test_never_picks_dead_server() {
        let lb = BaseLoadBalancer::builder(ClientConfig::new("w")).build();
        lb.set_servers_list(vec!["a:1", "b:1"]);
        let all = lb.all_servers();
        lb.stats().note_request_completion(&all[0], Duration::from_millis(5));
        lb.stats().note_request_completion(&all[1], Duration::from_millis(50));
        lb.mark_server_down(&all[0]);

        let rule = WeightedResponseTimeRule::new();
        for _ in 0..50 {
            assert_eq!(rule.choose(lb.as_ref(), None).unwrap().id(), "b:1");
        }
    }
}
