//! Execution listeners: hooks around each load balanced call.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{ClientError, CommandError, ListenerError};
use crate::load_balancer::server::Server;

/// Where a command currently is.
#[derive(Debug, Clone, Default)]
pub struct ExecutionInfo {
    pub server: Option<Arc<Server>>,
    /// Attempts on the current server, the first one included.
    pub attempts_on_same_server: u32,
    /// Distinct servers tried so far.
    pub servers_tried: u32,
}

impl ExecutionInfo {
    pub fn on_server(server: Arc<Server>, attempts_on_same_server: u32, servers_tried: u32) -> Self {
        Self {
            server: Some(server),
            attempts_on_same_server,
            servers_tried,
        }
    }
}

/// Hooks invoked while a command runs.
///
/// Each listener sees its own child context, keyed by [`name`](Self::name).
/// Only [`on_execution_start`](Self::on_execution_start) can influence the
/// command: an error there aborts it. Errors from the other hooks are logged.
pub trait ExecutionListener<T>: Send + Sync {
    fn name(&self) -> &str;

    fn on_execution_start(&self, _ctx: &ExecutionContext<T>) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_start_with_server(&self, _ctx: &ExecutionContext<T>, _info: &ExecutionInfo) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_exception_with_server(
        &self,
        _ctx: &ExecutionContext<T>,
        _error: &ClientError,
        _info: &ExecutionInfo,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_execution_success(&self, _ctx: &ExecutionContext<T>, _info: &ExecutionInfo) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_execution_failed(
        &self,
        _ctx: &ExecutionContext<T>,
        _error: &CommandError,
        _info: &ExecutionInfo,
    ) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Calls every listener with its child context.
pub struct ListenerInvoker<T> {
    listeners: Vec<Arc<dyn ExecutionListener<T>>>,
    context: ExecutionContext<T>,
}

impl<T> ListenerInvoker<T> {
    pub fn new(listeners: Vec<Arc<dyn ExecutionListener<T>>>, context: ExecutionContext<T>) -> Self {
        Self { listeners, context }
    }

    pub fn context(&self) -> &ExecutionContext<T> {
        &self.context
    }

    fn each<F>(&self, hook: &'static str, f: F)
    where
        F: Fn(&dyn ExecutionListener<T>, &ExecutionContext<T>) -> Result<(), ListenerError>,
    {
        for listener in &self.listeners {
            let ctx = self.context.child_context(listener.name());
            match catch_unwind(AssertUnwindSafe(|| f(listener.as_ref(), &ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = listener.name(), hook, error = %e, "Execution listener failed");
                }
                Err(_) => {
                    tracing::warn!(listener = listener.name(), hook, "Execution listener panicked");
                }
            }
        }
    }

    /// Stops at the first listener that refuses.
    pub fn on_execution_start(&self) -> Result<(), CommandError> {
        for listener in &self.listeners {
            let ctx = self.context.child_context(listener.name());
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_execution_start(&ctx)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::info!(listener = listener.name(), reason = %e.0, "Execution aborted by listener");
                    return Err(CommandError::Aborted {
                        listener: listener.name().to_string(),
                        reason: e.0,
                    });
                }
                Err(_) => {
                    tracing::warn!(listener = listener.name(), hook = "on_execution_start", "Execution listener panicked");
                }
            }
        }
        Ok(())
    }

    pub fn on_start_with_server(&self, info: &ExecutionInfo) {
        self.each("on_start_with_server", |l, ctx| l.on_start_with_server(ctx, info));
    }

    pub fn on_exception_with_server(&self, error: &ClientError, info: &ExecutionInfo) {
        self.each("on_exception_with_server", |l, ctx| {
            l.on_exception_with_server(ctx, error, info)
        });
    }

    pub fn on_execution_success(&self, info: &ExecutionInfo) {
        self.each("on_execution_success", |l, ctx| l.on_execution_success(ctx, info));
    }

    pub fn on_execution_failed(&self, error: &CommandError, info: &ExecutionInfo) {
        self.each("on_execution_failed", |l, ctx| l.on_execution_failed(ctx, error, info));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::context::DefaultRetryHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        starts: AtomicUsize,
    }

    impl ExecutionListener<()> for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn on_start_with_server(&self, ctx: &ExecutionContext<()>, _info: &ExecutionInfo) -> Result<(), ListenerError> {
            let seen = ctx.get::<usize>("seen").map(|v| *v).unwrap_or(0);
            ctx.put("seen", seen + 1);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Refusing;

    impl ExecutionListener<()> for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn on_execution_start(&self, _ctx: &ExecutionContext<()>) -> Result<(), ListenerError> {
            Err(ListenerError("quota exceeded".into()))
        }

        fn on_start_with_server(&self, _ctx: &ExecutionContext<()>, _info: &ExecutionInfo) -> Result<(), ListenerError> {
            panic!("listener bug")
        }
    }

    fn context() -> ExecutionContext<()> {
        ExecutionContext::new(
            (),
            None,
            Arc::new(ClientConfig::new("l")),
            Arc::new(DefaultRetryHandler::default()),
        )
    }

    #[test]
    fn test_each_listener_gets_own_child_context() {
        let ctx = context();
        let a = Arc::new(Counting { name: "a", starts: AtomicUsize::new(0) });
        let b = Arc::new(Counting { name: "b", starts: AtomicUsize::new(0) });
        let listeners: Vec<Arc<dyn ExecutionListener<()>>> = vec![a.clone(), b.clone()];
        let invoker = ListenerInvoker::new(listeners, ctx.clone());

        let info = ExecutionInfo::on_server(Arc::new(Server::new("h", 1)), 1, 1);
        invoker.on_start_with_server(&info);
        invoker.on_start_with_server(&info);

        assert_eq!(*ctx.child_context("a").get::<usize>("seen").unwrap(), 2);
        assert_eq!(*ctx.child_context("b").get::<usize>("seen").unwrap(), 2);
        assert!(ctx.get::<usize>("seen").is_none());
        assert_eq!(a.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_refusal_aborts_and_panics_are_isolated() {
        let counting = Arc::new(Counting { name: "a", starts: AtomicUsize::new(0) });
        let listeners: Vec<Arc<dyn ExecutionListener<()>>> = vec![Arc::new(Refusing), counting.clone()];
        let invoker = ListenerInvoker::new(listeners, context());

        let err = invoker.on_execution_start().unwrap_err();
        assert!(matches!(err, CommandError::Aborted { ref listener, .. } if listener == "refusing"));

        invoker.on_start_with_server(&ExecutionInfo::default());
        assert_eq!(counting.starts.load(Ordering::SeqCst), 1);
    }
}
