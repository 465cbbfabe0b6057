//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define the `MetricsSink` the load balancer reports into
//! - Bridge the sink onto the `metrics` facade for Prometheus scraping
//!
//! # Metrics
//! - `ribbon_choose_total` (counter): selections by load balancer, outcome
//! - `ribbon_servers` (gauge): known / up servers per load balancer
//! - `ribbon_ping_cycle_seconds` (histogram): duration of a ping cycle
//! - `ribbon_server_alive` (gauge): 1=alive, 0=dead per server
//! - `ribbon_requests_total` (counter): command attempts by server, outcome
//! - `ribbon_request_duration_seconds` (histogram): command attempt latency
//!
//! # Design Decisions
//! - Sinks are injected per load balancer; there is no global registry
//! - Registration happens on build, unregistration on shutdown

use std::net::SocketAddr;
use std::time::Duration;

use crate::load_balancer::server::Server;

/// Receiver of load balancer events.
///
/// Every method defaults to a no-op so sinks only implement what they need.
pub trait MetricsSink: Send + Sync {
    fn register(&self, _lb: &str) {}

    fn unregister(&self, _lb: &str) {}

    fn record_choice(&self, _lb: &str, _server: Option<&Server>) {}

    fn record_server_counts(&self, _lb: &str, _total: usize, _up: usize) {}

    fn record_ping_cycle(&self, _lb: &str, _elapsed: Duration) {}

    fn record_server_status(&self, _lb: &str, _server: &Server, _alive: bool) {}

    fn record_request(&self, _lb: &str, _server: &Server, _success: bool, _elapsed: Duration) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Reports through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn register(&self, lb: &str) {
        metrics::gauge!("ribbon_load_balancers", "lb" => lb.to_string()).set(1.0);
    }

    fn unregister(&self, lb: &str) {
        metrics::gauge!("ribbon_load_balancers", "lb" => lb.to_string()).set(0.0);
    }

    fn record_choice(&self, lb: &str, server: Option<&Server>) {
        let outcome = if server.is_some() { "chosen" } else { "none" };
        metrics::counter!("ribbon_choose_total", "lb" => lb.to_string(), "outcome" => outcome)
            .increment(1);
    }

    fn record_server_counts(&self, lb: &str, total: usize, up: usize) {
        metrics::gauge!("ribbon_servers", "lb" => lb.to_string(), "state" => "all").set(total as f64);
        metrics::gauge!("ribbon_servers", "lb" => lb.to_string(), "state" => "up").set(up as f64);
    }

    fn record_ping_cycle(&self, lb: &str, elapsed: Duration) {
        metrics::histogram!("ribbon_ping_cycle_seconds", "lb" => lb.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn record_server_status(&self, lb: &str, server: &Server, alive: bool) {
        metrics::gauge!(
            "ribbon_server_alive",
            "lb" => lb.to_string(),
            "server" => server.id().to_string()
        )
        .set(if alive { 1.0 } else { 0.0 });
    }

    fn record_request(&self, lb: &str, server: &Server, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!(
            "ribbon_requests_total",
            "lb" => lb.to_string(),
            "server" => server.id().to_string(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(
            "ribbon_request_duration_seconds",
            "lb" => lb.to_string(),
            "server" => server.id().to_string()
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}
