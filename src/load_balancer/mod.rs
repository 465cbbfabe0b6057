//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! caller → BaseLoadBalancer::choose_server(key)
//!     → Rule::choose(lb, key)
//!         → reads the up / all server lists and LoadBalancerStats
//!     → Some(server) or None ("no server available")
//!
//! background pinger (tokio task)
//!     → snapshot all servers
//!     → PingStrategy runs Ping over the snapshot
//!     → flip alive flags, swap the up list, notify status listeners
//!
//! DynamicServerListLoadBalancer
//!     → ServerList (source) → ServerListFilter → set_servers_list
//! ```
//!
//! # Design Decisions
//! - Server lists are replaced wholesale, never patched in place
//! - Selection and health-check failures are logged and isolated
//! - Rules are strategies owned by exactly one load balancer

pub mod base;
pub mod dynamic;
pub mod filter;
pub mod listener;
pub mod ping;
pub mod server;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::load_balancer::server::Server;
use crate::load_balancer::stats::LoadBalancerStats;

pub use base::{BaseLoadBalancer, LoadBalancerBuilder};

/// Shared snapshot of a server list.
pub type Servers = Arc<Vec<Arc<Server>>>;

/// The view of a load balancer that selection rules work against.
pub trait LoadBalancer: Send + Sync {
    /// Load balancer (client) name.
    fn name(&self) -> &str;

    /// Append servers to the pool.
    fn add_servers(&self, servers: Vec<Arc<Server>>);

    /// Pick a server; `None` means no server is available.
    fn choose_server(&self, key: Option<&str>) -> Option<Arc<Server>>;

    /// Mark a server as down outside the ping cycle.
    fn mark_server_down(&self, server: &Arc<Server>);

    /// Servers that passed the last health check.
    fn reachable_servers(&self) -> Servers;

    /// Every known server.
    fn all_servers(&self) -> Servers;

    fn stats(&self) -> &LoadBalancerStats;

    fn client_config(&self) -> &ClientConfig;
}

/// Holds a busy flag for one run and clears it on drop, panics included.
pub(crate) struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    /// `None` when another run already holds the flag.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
