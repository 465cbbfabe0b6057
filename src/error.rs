//! Error types shared across the load balancer.

use thiserror::Error;

/// Errors raised while building or mutating a load balancer.
#[derive(Debug, Error)]
pub enum LbError {
    /// A server address could not be parsed.
    #[error("Invalid server address: {0}")]
    InvalidServer(String),

    /// A configured component name has no registered factory.
    #[error("Unknown {kind} implementation: {name}")]
    UnknownComponent { kind: &'static str, name: String },

    /// A configuration property holds a value of the wrong type.
    #[error("Invalid value for {key}: {value}")]
    InvalidProperty { key: String, value: String },

    /// A server list source could not produce a list.
    #[error("Server list unavailable: {0}")]
    ServerList(String),

    /// The load balancer could not reach a usable initialized state.
    #[error("Initialization failed: {0}")]
    Initialization(String),
}

/// Classification used by retry handlers and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection could not be established.
    Connect,
    /// The server accepted the connection but did not answer in time.
    ReadTimeout,
    /// The server asked the client to back off.
    ServerThrottled,
    /// Any other failure.
    General,
}

/// A failure reported by an operation executed against a server.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connect, message)
    }

    pub fn read_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadTimeout, message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerThrottled, message)
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::General, message)
    }
}

/// Outcome of a load balanced command that did not succeed.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No server could be selected.
    #[error("No server available for load balancer {0}")]
    NoServerAvailable(String),

    /// The retry budget was used up.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ClientError },

    /// An execution listener refused to let the command start.
    #[error("Execution aborted by listener {listener}: {reason}")]
    Aborted { listener: String, reason: String },

    /// A non-retriable failure.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// A listener callback failed.
#[derive(Debug, Error)]
#[error("Listener failed: {0}")]
pub struct ListenerError(pub String);
