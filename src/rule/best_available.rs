//! Best available selection.

use std::sync::Arc;

use crate::load_balancer::server::Server;
use crate::load_balancer::LoadBalancer;
use crate::rule::{is_usable, Rule, RoundRobinRule};

/// Selects the server with the fewest active requests, skipping servers
/// whose circuit breaker is tripped. Falls back to round robin when every
/// live server is tripped.
#[derive(Debug, Default)]
pub struct BestAvailableRule {
    fallback: RoundRobinRule,
}

impl BestAvailableRule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rule for BestAvailableRule {
    fn name(&self) -> &'static str {
        "best_available"
    }

    fn choose(&self, lb: &dyn LoadBalancer, key: Option<&str>) -> Option<Arc<Server>> {
        let stats = lb.stats();
        // In case of tie, the first one is selected (stability)
        let best = lb
            .all_servers()
            .iter()
            .filter(|s| is_usable(s) && !stats.is_circuit_breaker_tripped(s))
            .min_by_key(|s| stats.active_requests_count(s))
            .cloned();

        best.or_else(|| self.fallback.choose(lb, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::load_balancer::BaseLoadBalancer;

    #[test]
    fn test_best_available() {
        let lb = BaseLoadBalancer::builder(ClientConfig::new("best")).build();
        lb.set_servers_list(vec!["127.0.0.1:8080", "127.0.0.1:8081"]);
        let all = lb.all_servers();
        let (b1, b2) = (&all[0], &all[1]);
        let rule = BestAvailableRule::new();

        // artificially increase requests on b1
        lb.stats().note_open_connection(b1);

        // Should pick b2 (0 requests)
        assert_eq!(rule.choose(lb.as_ref(), None).unwrap().id(), b2.id());

        // increase b2
        lb.stats().note_open_connection(b2);
        lb.stats().note_open_connection(b2); // now b2 has 2, b1 has 1

        // Should pick b1 (1 request)
        assert_eq!(rule.choose(lb.as_ref(), None).unwrap().id(), b1.id());
    }

    #[test]
    fn test_skips_tripped_then_falls_back() {
        let lb = BaseLoadBalancer::builder(ClientConfig::new("best")).build();
        lb.set_servers_list(vec!["a:1", "b:1"]);
        let all = lb.all_servers();
        for _ in 0..3 {
            lb.stats().increment_successive_connection_failure(&all[0]);
        }
        let rule = BestAvailableRule::new();
        assert_eq!(rule.choose(lb.as_ref(), None).unwrap().id(), "b:1");

        for _ in 0..3 {
            lb.stats().increment_successive_connection_failure(&all[1]);
        }
        // Everything tripped: still serve something alive.
        assert!(rule.choose(lb.as_ref(), None).is_some());
    }
}
