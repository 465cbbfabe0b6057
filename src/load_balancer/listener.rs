//! Change notification for server lists and server status.
//!
//! Listener lists are copy-on-write: registration swaps in a new vector, so
//! a notification pass always iterates a stable snapshot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::ListenerError;
use crate::load_balancer::server::Server;

/// Called after the full server list was replaced.
pub trait ServerListChangeListener: Send + Sync {
    fn server_list_changed(&self, old: &[Arc<Server>], new: &[Arc<Server>]) -> Result<(), ListenerError>;
}

impl<F> ServerListChangeListener for F
where
    F: Fn(&[Arc<Server>], &[Arc<Server>]) -> Result<(), ListenerError> + Send + Sync,
{
    fn server_list_changed(&self, old: &[Arc<Server>], new: &[Arc<Server>]) -> Result<(), ListenerError> {
        self(old, new)
    }
}

/// Called with the servers whose alive flag flipped.
pub trait ServerStatusChangeListener: Send + Sync {
    fn server_status_changed(&self, changed: &[Arc<Server>]) -> Result<(), ListenerError>;
}

impl<F> ServerStatusChangeListener for F
where
    F: Fn(&[Arc<Server>]) -> Result<(), ListenerError> + Send + Sync,
{
    fn server_status_changed(&self, changed: &[Arc<Server>]) -> Result<(), ListenerError> {
        self(changed)
    }
}

/// Copy-on-write set of listeners.
pub struct Listeners<L: ?Sized> {
    inner: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub fn add(&self, listener: Arc<L>) {
        self.inner.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(listener.clone());
            next
        });
    }

    /// Remove by pointer identity. Returns whether anything was removed.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let prev = self.inner.rcu(|current| {
            current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
        prev.iter().any(|l| Arc::ptr_eq(l, listener))
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke `f` on every listener, logging failures and panics.
    pub fn notify<F>(&self, lb_name: &str, kind: &'static str, f: F)
    where
        F: Fn(&L) -> Result<(), ListenerError>,
    {
        let snapshot = self.inner.load_full();
        for listener in snapshot.iter() {
            match catch_unwind(AssertUnwindSafe(|| f(listener))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(lb = %lb_name, listener = kind, error = %e, "Listener failed");
                }
                Err(_) => {
                    tracing::warn!(lb = %lb_name, listener = kind, "Listener panicked");
                }
            }
        }
    }
}
