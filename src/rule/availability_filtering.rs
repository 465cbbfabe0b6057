//! Availability filtering selection.

use std::sync::Arc;

use crate::load_balancer::server::Server;
use crate::load_balancer::LoadBalancer;
use crate::rule::predicate::{AlwaysTrue, AvailabilityPredicate, CompositePredicate, ServerPredicate};
use crate::rule::{is_usable, Rotation, Rule, RoundRobinRule};

const MAX_ROUND_ROBIN_ATTEMPTS: usize = 11;

/// Round robin that skips servers with a tripped circuit breaker or too many
/// active requests.
///
/// Tries a handful of round robin picks first, which is cheap when most
/// servers are healthy; then filters the full list and rotates over the
/// survivors, finally over any live server.
#[derive(Debug)]
pub struct AvailabilityFilteringRule {
    round_robin: RoundRobinRule,
    predicate: CompositePredicate,
    rotation: Rotation,
}

impl Default for AvailabilityFilteringRule {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityFilteringRule {
    pub fn new() -> Self {
        Self {
            round_robin: RoundRobinRule::new(),
            predicate: CompositePredicate::new(vec![Arc::new(AvailabilityPredicate)])
                .with_fallback(Arc::new(AlwaysTrue)),
            rotation: Rotation::default(),
        }
    }
}

impl Rule for AvailabilityFilteringRule {
    fn name(&self) -> &'static str {
        "availability_filtering"
    }

    fn choose(&self, lb: &dyn LoadBalancer, key: Option<&str>) -> Option<Arc<Server>> {
        for _ in 0..MAX_ROUND_ROBIN_ATTEMPTS {
            match self.round_robin.choose(lb, key) {
                Some(server) if !AvailabilityPredicate::should_skip(lb, &server) => return Some(server),
                Some(_) => continue,
                None => return None,
            }
        }

        let live: Vec<Arc<Server>> = lb.all_servers().iter().filter(|s| is_usable(s)).cloned().collect();
        let eligible = self.predicate.eligible(lb, &live, key);
        self.rotation.pick(&eligible)
    }
}
