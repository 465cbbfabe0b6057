//! Server selection rules.
//!
//! # Data Flow
//! ```text
//! BaseLoadBalancer::choose_server(key)
//!     → Rule::choose(lb, key)
//!         - round_robin.rs (rotate through all servers, skip dead ones)
//!         - random.rs (uniform pick among live servers)
//!         - best_available.rs (fewest active requests, skip tripped)
//!         - availability_filtering.rs (round robin + availability check)
//!         - zone_avoidance.rs (drop the worst zone, then availability)
//!         - weighted_response_time.rs (faster servers get more traffic)
//! ```
//!
//! # Design Decisions
//! - A rule never returns a server whose alive flag is down
//! - No eligible server is `None`, not an error
//! - Each rule instance is owned by one load balancer; per-rule state such
//!   as round robin counters is therefore per load balancer

pub mod availability_filtering;
pub mod best_available;
pub mod predicate;
pub mod random;
pub mod round_robin;
pub mod weighted_response_time;
pub mod zone_avoidance;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::server::Server;
use crate::load_balancer::LoadBalancer;

pub use availability_filtering::AvailabilityFilteringRule;
pub use best_available::BestAvailableRule;
pub use random::RandomRule;
pub use round_robin::RoundRobinRule;
pub use weighted_response_time::WeightedResponseTimeRule;
pub use zone_avoidance::ZoneAvoidanceRule;

/// A server selection policy.
pub trait Rule: Send + Sync + std::fmt::Debug {
    /// Short name used in logs and the component registry.
    fn name(&self) -> &'static str;

    /// Pick a server from `lb`, or `None` when nothing is eligible.
    fn choose(&self, lb: &dyn LoadBalancer, key: Option<&str>) -> Option<Arc<Server>>;
}

/// Whether a server may receive traffic at all.
pub(crate) fn is_usable(server: &Server) -> bool {
    server.is_alive() && server.is_ready_to_serve()
}

/// Monotonic counter used to rotate through candidate lists.
#[derive(Debug, Default)]
pub(crate) struct Rotation {
    counter: AtomicUsize,
}

impl Rotation {
    pub(crate) fn next_index(&self, modulo: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % modulo
    }

    /// Round robin over an already filtered list.
    pub(crate) fn pick(&self, servers: &[Arc<Server>]) -> Option<Arc<Server>> {
        if servers.is_empty() {
            return None;
        }
        Some(servers[self.next_index(servers.len())].clone())
    }
}
