//! Per-request execution context.
//!
//! # Layout
//! ```text
//! ExecutionContext (global)
//!     request, request config, client config, retry handler   (shared)
//!     properties                                               (own)
//!     children: key → ExecutionContext (child)
//!                         properties                           (own)
//! ```
//!
//! A context is a cheap handle; clones refer to the same context. A child
//! reads the shared fields of its parent and keeps its own property map.
//! The tree is two levels deep: asking a child for a child context returns
//! a sibling registered on the global context.

pub mod listener;
pub mod retry;

use std::any::Any;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;

use crate::config::{ClientConfig, ConfigKey};

pub use listener::{ExecutionInfo, ExecutionListener, ListenerInvoker};
pub use retry::{DefaultRetryHandler, RetryHandler};

type Properties = DashMap<String, Arc<dyn Any + Send + Sync>>;

struct Shared<T> {
    request: Arc<T>,
    request_config: Option<Arc<ClientConfig>>,
    client_config: Arc<ClientConfig>,
    retry_handler: RwLock<Arc<dyn RetryHandler>>,
    global_properties: Arc<Properties>,
    children: DashMap<String, Arc<Properties>>,
}

pub struct ExecutionContext<T> {
    shared: Arc<Shared<T>>,
    properties: Arc<Properties>,
}

impl<T> Clone for ExecutionContext<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            properties: self.properties.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ExecutionContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("client", &self.shared.client_config.name())
            .field("global", &self.is_global())
            .field("properties", &self.properties.len())
            .finish()
    }
}

impl<T> ExecutionContext<T> {
    pub fn new(
        request: T,
        request_config: Option<ClientConfig>,
        client_config: Arc<ClientConfig>,
        retry_handler: Arc<dyn RetryHandler>,
    ) -> Self {
        let global_properties = Arc::new(Properties::new());
        Self {
            shared: Arc::new(Shared {
                request: Arc::new(request),
                request_config: request_config.map(Arc::new),
                client_config,
                retry_handler: RwLock::new(retry_handler),
                global_properties: global_properties.clone(),
                children: DashMap::new(),
            }),
            properties: global_properties,
        }
    }

    pub fn request(&self) -> &T {
        &self.shared.request
    }

    pub fn request_config(&self) -> Option<&ClientConfig> {
        self.shared.request_config.as_deref()
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.shared.client_config
    }

    pub fn retry_handler(&self) -> Arc<dyn RetryHandler> {
        self.shared
            .retry_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the retry handler for every context of this request.
    pub fn set_retry_handler(&self, handler: Arc<dyn RetryHandler>) {
        *self
            .shared
            .retry_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// The context registered under `key`, created on first use.
    ///
    /// Concurrent callers with the same key all get the same context.
    pub fn child_context(&self, key: &str) -> ExecutionContext<T> {
        let properties = self
            .shared
            .children
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Properties::new()))
            .clone();
        Self {
            shared: self.shared.clone(),
            properties,
        }
    }

    /// The root context; itself for the root.
    pub fn global_context(&self) -> ExecutionContext<T> {
        Self {
            shared: self.shared.clone(),
            properties: self.shared.global_properties.clone(),
        }
    }

    pub fn is_global(&self) -> bool {
        Arc::ptr_eq(&self.properties, &self.shared.global_properties)
    }

    /// Whether both handles refer to the same context.
    pub fn same_context(&self, other: &ExecutionContext<T>) -> bool {
        Arc::ptr_eq(&self.properties, &other.properties)
    }

    pub fn put<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        self.properties.insert(key.into(), Arc::new(value));
    }

    /// A property of this context, if present with type `V`.
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let value = self.properties.get(key)?.value().clone();
        value.downcast::<V>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.properties.remove(key).is_some()
    }

    /// A client property: the per-request config wins, then the client
    /// config, then the key's default.
    pub fn client_property<V: FromStr>(&self, key: ConfigKey) -> Option<V> {
        self.request_config()
            .and_then(|c| c.get(key))
            .or_else(|| self.client_config().get(key))
            .or_else(|| key.default_value().and_then(|d| d.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn context(request_config: Option<ClientConfig>) -> ExecutionContext<String> {
        ExecutionContext::new(
            "GET /".to_string(),
            request_config,
            Arc::new(ClientConfig::new("ctx").with(ConfigKey::MaxAutoRetries, 1)),
            Arc::new(DefaultRetryHandler::default()),
        )
    }

    #[test]
    fn test_child_context_memoized_across_threads() {
        let ctx = context(None);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || ctx.child_context("listener"))
            })
            .collect();
        let children: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for child in &children {
            assert!(child.same_context(&children[0]));
            assert!(child.global_context().same_context(&ctx));
            assert!(!child.is_global());
        }
        assert!(ctx.global_context().same_context(&ctx));
        assert!(!ctx.child_context("other").same_context(&children[0]));
    }

    #[test]
    fn test_properties_are_per_context() {
        let ctx = context(None);
        let child = ctx.child_context("a");
        ctx.put("attempt", 1u32);
        child.put("attempt", 7u32);

        assert_eq!(*ctx.get::<u32>("attempt").unwrap(), 1);
        assert_eq!(*child.get::<u32>("attempt").unwrap(), 7);
        assert!(ctx.get::<String>("attempt").is_none());
        assert!(ctx.remove("attempt"));
        assert!(ctx.get::<u32>("attempt").is_none());
        assert_eq!(child.request(), "GET /");
    }

    #[test]
    fn test_request_config_overrides_client_config() {
        let ctx = context(Some(ClientConfig::new("req").with(ConfigKey::MaxAutoRetries, 5)));
        assert_eq!(ctx.client_property::<u32>(ConfigKey::MaxAutoRetries), Some(5));
        assert_eq!(ctx.client_property::<u32>(ConfigKey::MaxAutoRetriesNextServer), Some(1));
        assert_eq!(ctx.client_property::<String>(ConfigKey::Zone), None);

        let plain = context(None);
        assert_eq!(plain.client_property::<u32>(ConfigKey::MaxAutoRetries), Some(1));
    }

    #[test]
    fn test_retry_handler_shared_with_children() {
        let ctx = context(None);
        let child = ctx.child_context("a");
        ctx.set_retry_handler(Arc::new(DefaultRetryHandler::new(3, 0, false)));
        assert_eq!(child.retry_handler().max_retries_on_same_server(), 3);
    }
}
