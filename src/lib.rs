//! Client-side load balancer with a health checked server pool.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller
//!     │  LoadBalancerCommand::submit(op)          (resilience)
//!     │     ExecutionContext + listeners + retry   (context)
//!     ▼
//!   BaseLoadBalancer::choose_server(key)          (load_balancer)
//!     │  Rule::choose ── reads ──▶ all / up lists, LoadBalancerStats
//!     ▼                                            (rule)
//!   Server
//!
//!   background:
//!     pinger task ── Ping / PingStrategy ──▶ up list, status listeners
//!     list updater ── ServerList → ServerListFilter ──▶ set_servers_list
//!     config watcher ── RibbonConfig ──▶ set_servers_list
//! ```
//!
//! Components are picked by name through the [`registry::Registry`];
//! events go to an injected [`observability::MetricsSink`].

pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod rule;

pub use config::{ClientConfig, ConfigKey, RibbonConfig};
pub use context::{ExecutionContext, RetryHandler};
pub use error::{ClientError, CommandError, LbError};
pub use lifecycle::Shutdown;
pub use load_balancer::dynamic::DynamicServerListLoadBalancer;
pub use load_balancer::server::Server;
pub use load_balancer::{BaseLoadBalancer, LoadBalancer};
pub use registry::Registry;
pub use resilience::LoadBalancerCommand;
pub use rule::Rule;
