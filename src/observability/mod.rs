//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Load balancer, pinger, commands produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (MetricsSink: counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Prometheus scrape endpoint
//! ```

pub mod logging;
pub mod metrics;

pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
