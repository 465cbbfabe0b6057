//! Retry decisions for load balanced calls.

use crate::config::{ClientConfig, ConfigKey};
use crate::error::{ClientError, ErrorKind};

/// Decides whether a failed attempt may be retried and whether it counts
/// against the server's circuit breaker.
pub trait RetryHandler: Send + Sync + std::fmt::Debug {
    /// Whether `error` may be retried, on the same server when `same_server`
    /// is set, otherwise on the next one.
    fn is_retriable(&self, error: &ClientError, same_server: bool) -> bool;

    /// Whether `error` should count as a connection failure.
    fn is_circuit_tripping(&self, error: &ClientError) -> bool;

    fn max_retries_on_same_server(&self) -> u32;

    fn max_retries_on_next_server(&self) -> u32;
}

/// Retries connection failures and read timeouts anywhere, and throttling
/// on a different server only.
#[derive(Debug, Clone)]
pub struct DefaultRetryHandler {
    same_server: u32,
    next_server: u32,
    retry_all: bool,
}

impl Default for DefaultRetryHandler {
    fn default() -> Self {
        Self::new(0, 0, false)
    }
}

impl DefaultRetryHandler {
    pub fn new(same_server: u32, next_server: u32, retry_all: bool) -> Self {
        Self {
            same_server,
            next_server,
            retry_all,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.get_or_default(ConfigKey::MaxAutoRetries),
            config.get_or_default(ConfigKey::MaxAutoRetriesNextServer),
            config.get_or_default(ConfigKey::OkToRetryOnAllOperations),
        )
    }
}

impl RetryHandler for DefaultRetryHandler {
    fn is_retriable(&self, error: &ClientError, same_server: bool) -> bool {
        if self.retry_all {
            return true;
        }
        match error.kind {
            ErrorKind::Connect | ErrorKind::ReadTimeout => true,
            ErrorKind::ServerThrottled => !same_server,
            ErrorKind::General => false,
        }
    }

    fn is_circuit_tripping(&self, error: &ClientError) -> bool {
        matches!(
            error.kind,
            ErrorKind::Connect | ErrorKind::ReadTimeout | ErrorKind::ServerThrottled
        )
    }

    fn max_retries_on_same_server(&self) -> u32 {
        self.same_server
    }

    fn max_retries_on_next_server(&self) -> u32 {
        self.next_server
    }
}
