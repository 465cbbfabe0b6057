//! Health checks and the strategies that run them.
//!
//! # Responsibilities
//! - `Ping`: decide whether one server is alive
//! - `PingStrategy`: run a `Ping` over a snapshot of servers
//!
//! # Design Decisions
//! - A whole cycle is bounded by one deadline; a slow server cannot stall it
//! - A ping that times out or panics counts as dead for that server only
//! - Results are index-aligned with the input snapshot

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::FutureExt;
use http_body_util::Empty;
use hyper::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpStream;
use tokio::time;

use crate::load_balancer::server::Server;

/// A per-server health check.
#[async_trait]
pub trait Ping: Send + Sync + std::fmt::Debug {
    async fn is_alive(&self, server: &Server) -> bool;

    /// True for the no-op ping. The load balancer then treats every server
    /// as alive without running a cycle.
    fn is_dummy(&self) -> bool {
        false
    }
}

/// No health check at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPing;

#[async_trait]
impl Ping for NoOpPing {
    async fn is_alive(&self, _server: &Server) -> bool {
        true
    }

    fn is_dummy(&self) -> bool {
        true
    }
}

/// Always answers the same.
#[derive(Debug, Clone, Copy)]
pub struct ConstantPing(pub bool);

#[async_trait]
impl Ping for ConstantPing {
    async fn is_alive(&self, _server: &Server) -> bool {
        self.0
    }
}

/// Alive when a TCP connection can be opened within the timeout.
#[derive(Debug, Clone)]
pub struct TcpPing {
    timeout: Duration,
}

impl TcpPing {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Ping for TcpPing {
    async fn is_alive(&self, server: &Server) -> bool {
        match time::timeout(self.timeout, TcpStream::connect((server.host(), server.port()))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(server = %server, error = %e, "TCP ping failed");
                false
            }
            Err(_) => {
                tracing::debug!(server = %server, "TCP ping timed out");
                false
            }
        }
    }
}

/// Alive when `GET http://host:port{path}` answers with a 2xx status.
pub struct HttpPing {
    path: String,
    timeout: Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl std::fmt::Debug for HttpPing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPing")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpPing {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            path: path.into(),
            timeout,
            client,
        }
    }
}

#[async_trait]
impl Ping for HttpPing {
    async fn is_alive(&self, server: &Server) -> bool {
        let uri = format!("http://{}{}", server.id(), self.path);
        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "ribbon-health-check")
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(server = %server, "Failed to build health check request: {}", e);
                return false;
            }
        };

        match time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let success = response.status().is_success();
                if !success {
                    tracing::warn!(server = %server, status = %response.status(), "Health check failed: non-success status");
                }
                success
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %server, error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(server = %server, "Health check failed: timeout");
                false
            }
        }
    }
}

/// Ping one server under a deadline, mapping timeouts and panics to dead.
pub async fn ping_with_deadline(ping: &dyn Ping, server: &Server, deadline: Duration) -> bool {
    let check = AssertUnwindSafe(ping.is_alive(server)).catch_unwind();
    match time::timeout(deadline, check).await {
        Ok(Ok(alive)) => alive,
        Ok(Err(_)) => {
            tracing::warn!(server = %server, "Ping panicked, counting server as dead");
            false
        }
        Err(_) => {
            tracing::warn!(server = %server, timeout_ms = deadline.as_millis() as u64, "Ping timed out, counting server as dead");
            false
        }
    }
}

/// How a ping cycle walks the server snapshot.
#[async_trait]
pub trait PingStrategy: Send + Sync + std::fmt::Debug {
    /// Ping every server within `deadline` for the whole cycle;
    /// `result[i]` is the verdict for `servers[i]`.
    async fn ping_servers(&self, ping: &dyn Ping, servers: &[Arc<Server>], deadline: Duration) -> Vec<bool>;
}

/// One server after another, each ping getting what is left of the cycle's
/// deadline. Servers not reached in time count as dead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPingStrategy;

#[async_trait]
impl PingStrategy for SerialPingStrategy {
    async fn ping_servers(&self, ping: &dyn Ping, servers: &[Arc<Server>], deadline: Duration) -> Vec<bool> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(servers.len());
        for (i, server) in servers.iter().enumerate() {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                tracing::warn!(
                    skipped = servers.len() - i,
                    deadline_ms = deadline.as_millis() as u64,
                    "Ping cycle deadline reached, counting remaining servers as dead"
                );
                results.resize(servers.len(), false);
                break;
            }
            results.push(ping_with_deadline(ping, server, remaining).await);
        }
        results
    }
}

/// All servers concurrently.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelPingStrategy;

#[async_trait]
impl PingStrategy for ParallelPingStrategy {
    async fn ping_servers(&self, ping: &dyn Ping, servers: &[Arc<Server>], deadline: Duration) -> Vec<bool> {
        join_all(servers.iter().map(|s| ping_with_deadline(ping, s, deadline))).await
    }
}
