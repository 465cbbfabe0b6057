//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! LoadBalancerCommand::submit(op):
//!     → choose_server, run op
//!     → On failure: RetryHandler decides same server / next server / give up
//!     → backoff.rs (exponential delay with jitter between attempts)
//!     → connection errors feed the per-server circuit breaker in stats
//! ```
//!
//! # Design Decisions
//! - The circuit breaker lives in `LoadBalancerStats`, so rules see it too
//! - Non-retriable errors fail the command on the first attempt

pub mod backoff;
pub mod command;

pub use backoff::Backoff;
pub use command::LoadBalancerCommand;
