//! Round-robin selection.

use std::sync::Arc;

use crate::load_balancer::server::Server;
use crate::load_balancer::LoadBalancer;
use crate::rule::{is_usable, Rotation, Rule};

/// Round-robin selector.
/// Rotates through the full server list, skipping servers that are down or
/// still priming.
#[derive(Debug, Default)]
pub struct RoundRobinRule {
    rotation: Rotation,
}

impl RoundRobinRule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rule for RoundRobinRule {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn choose(&self, lb: &dyn LoadBalancer, _key: Option<&str>) -> Option<Arc<Server>> {
        let all = lb.all_servers();
        if all.is_empty() || lb.reachable_servers().is_empty() {
            tracing::warn!(lb = %lb.name(), "No up servers available");
            return None;
        }

        // One full lap at most, so the loop ends even if everything is down.
        let len = all.len();
        let start = self.rotation.next_index(len);
        for i in 0..len {
            let server = &all[(start + i) % len];
            if is_usable(server) {
                return Some(server.clone());
            }
        }
        tracing::warn!(lb = %lb.name(), servers = len, "No alive servers after a full rotation");
        None
    }
}
