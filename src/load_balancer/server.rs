//! Server abstraction.
//!
//! # Responsibilities
//! - Represent a single backend endpoint (`host:port`)
//! - Carry the deployment zone used for locality-aware routing
//! - Track liveness (written by the pinger) and readiness (written by priming)

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

use crate::error::LbError;

/// Zone assigned to servers that were not given one.
pub const UNKNOWN_ZONE: &str = "UNKNOWN";

/// A single backend server.
///
/// The identity (`host`, `port`, `id`, `zone`) never changes after
/// construction; only the `alive` and `ready_to_serve` flags are mutated.
#[derive(Debug)]
pub struct Server {
    host: String,
    port: u16,
    id: String,
    zone: String,
    alive: AtomicBool,
    ready_to_serve: AtomicBool,
}

impl Server {
    /// Create a new server in the unknown zone.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_zone(host, port, UNKNOWN_ZONE)
    }

    /// Create a new server pinned to a zone.
    pub fn with_zone(host: impl Into<String>, port: u16, zone: impl Into<String>) -> Self {
        let host = host.into();
        let id = format!("{}:{}", host, port);
        Self {
            host,
            port,
            id,
            zone: zone.into(),
            alive: AtomicBool::new(false),
            ready_to_serve: AtomicBool::new(true),
        }
    }

    /// Parse `host:port` or `scheme://host[:port][/path]`.
    ///
    /// A missing port defaults to 443 for `https` and 80 otherwise.
    pub fn parse(input: &str) -> Result<Self, LbError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(LbError::InvalidServer(input.to_string()));
        }

        if trimmed.contains("://") {
            let url = Url::parse(trimmed).map_err(|_| LbError::InvalidServer(input.to_string()))?;
            let host = url
                .host_str()
                .ok_or_else(|| LbError::InvalidServer(input.to_string()))?;
            let port = url.port_or_known_default().unwrap_or(80);
            return Ok(Self::new(host, port));
        }

        match trimmed.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| LbError::InvalidServer(input.to_string()))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(LbError::InvalidServer(input.to_string())),
            None => Ok(Self::new(trimmed, 80)),
        }
    }

    /// Return a copy of this server placed in `zone`.
    pub fn in_zone(self, zone: impl Into<String>) -> Self {
        Self::with_zone(self.host, self.port, zone)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `host:port` identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Set the alive flag, returning the previous value.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }

    pub fn is_ready_to_serve(&self) -> bool {
        self.ready_to_serve.load(Ordering::Acquire)
    }

    pub fn set_ready_to_serve(&self, ready: bool) {
        self.ready_to_serve.store(ready, Ordering::Release);
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Server {}

impl Hash for Server {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Anything that can be normalized into a shared [`Server`].
///
/// Lets `set_servers_list` accept raw `host:port` strings and server values
/// in the same call site.
pub trait IntoServer {
    fn into_server(self) -> Result<Arc<Server>, LbError>;
}

impl IntoServer for Arc<Server> {
    fn into_server(self) -> Result<Arc<Server>, LbError> {
        Ok(self)
    }
}

impl IntoServer for &Arc<Server> {
    fn into_server(self) -> Result<Arc<Server>, LbError> {
        Ok(self.clone())
    }
}

impl IntoServer for Server {
    fn into_server(self) -> Result<Arc<Server>, LbError> {
        Ok(Arc::new(self))
    }
}

impl IntoServer for &str {
    fn into_server(self) -> Result<Arc<Server>, LbError> {
        Server::parse(self).map(Arc::new)
    }
}

impl IntoServer for String {
    fn into_server(self) -> Result<Arc<Server>, LbError> {
        self.as_str().into_server()
    }
}

/// Compare two server lists by id and zone, order included.
pub(crate) fn same_servers(a: &[Arc<Server>], b: &[Arc<Server>]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|(x, y)| x.id() == y.id() && x.zone() == y.zone())
}

/// Canonical form of a zone name for lookups and comparisons.
pub fn normalize_zone(zone: &str) -> String {
    zone.to_lowercase()
}
