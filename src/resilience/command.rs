//! Load balanced execution of an async operation.
//!
//! # Flow
//! ```text
//! submit(op)
//!     → listeners: on_execution_start (may abort)
//!     → choose_server ── none ──→ NoServerAvailable
//!     → op(server)
//!         ok  → record stats, clear connection failures, on_execution_success
//!         err → record stats, count circuit tripping errors,
//!               retry same server (max_retries_on_same_server)
//!               then next server (max_retries_on_next_server)
//!     → on_execution_failed when nothing succeeded
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::context::{ExecutionContext, ExecutionInfo, ExecutionListener, ListenerInvoker};
use crate::error::{ClientError, CommandError};
use crate::load_balancer::server::Server;
use crate::load_balancer::{BaseLoadBalancer, LoadBalancer};
use crate::resilience::backoff::Backoff;

/// Runs an operation against servers picked by a load balancer.
pub struct LoadBalancerCommand<T> {
    lb: Arc<BaseLoadBalancer>,
    invoker: ListenerInvoker<T>,
    key: Option<String>,
    backoff: Backoff,
}

impl<T> LoadBalancerCommand<T> {
    pub fn new(lb: Arc<BaseLoadBalancer>, context: ExecutionContext<T>) -> Self {
        Self {
            lb,
            invoker: ListenerInvoker::new(Vec::new(), context),
            key: None,
            backoff: Backoff::default(),
        }
    }

    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn ExecutionListener<T>>>) -> Self {
        let context = self.invoker.context().clone();
        self.invoker = ListenerInvoker::new(listeners, context);
        self
    }

    /// Key handed to the rule on every selection.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn context(&self) -> &ExecutionContext<T> {
        self.invoker.context()
    }

    fn fail(&self, error: CommandError, info: &ExecutionInfo) -> CommandError {
        tracing::debug!(lb = %self.lb.name(), error = %error, "Command failed");
        self.invoker.on_execution_failed(&error, info);
        error
    }

    /// Run `op` until it succeeds or the retry budget is spent.
    pub async fn submit<F, Fut, R>(&self, op: F) -> Result<R, CommandError>
    where
        F: Fn(Arc<Server>) -> Fut,
        Fut: Future<Output = Result<R, ClientError>>,
    {
        self.invoker.on_execution_start()?;

        let handler = self.context().retry_handler();
        let same_server_retries = handler.max_retries_on_same_server();
        let next_server_retries = handler.max_retries_on_next_server();
        let stats = self.lb.stats_handle();
        let metrics = self.lb.metrics().clone();
        let lb_name = self.lb.name().to_string();

        let mut attempts = 0u32;
        let mut servers_tried = 0u32;
        let mut last_error: Option<ClientError> = None;
        let mut info = ExecutionInfo::default();

        while servers_tried <= next_server_retries {
            let Some(server) = self.lb.choose_server(self.key.as_deref()) else {
                break;
            };
            servers_tried += 1;

            for same_server_attempt in 1..=same_server_retries + 1 {
                if attempts > 0 {
                    tokio::time::sleep(self.backoff.delay(attempts)).await;
                }
                attempts += 1;

                info = ExecutionInfo::on_server(server.clone(), same_server_attempt, servers_tried);
                self.invoker.on_start_with_server(&info);

                stats.note_open_connection(&server);
                let started = Instant::now();
                let outcome = op(server.clone()).await;
                let elapsed = started.elapsed();
                stats.note_request_completion(&server, elapsed);

                match outcome {
                    Ok(value) => {
                        stats.clear_successive_connection_failure(&server);
                        metrics.record_request(&lb_name, &server, true, elapsed);
                        self.invoker.on_execution_success(&info);
                        return Ok(value);
                    }
                    Err(error) => {
                        if handler.is_circuit_tripping(&error) {
                            stats.increment_successive_connection_failure(&server);
                        }
                        metrics.record_request(&lb_name, &server, false, elapsed);
                        self.invoker.on_exception_with_server(&error, &info);
                        tracing::debug!(
                            lb = %lb_name,
                            server = %server,
                            attempt = attempts,
                            error = %error,
                            "Attempt failed"
                        );

                        let may_retry_here =
                            same_server_attempt <= same_server_retries && handler.is_retriable(&error, true);
                        if may_retry_here {
                            last_error = Some(error);
                            continue;
                        }
                        if !handler.is_retriable(&error, false) {
                            return Err(self.fail(CommandError::Client(error), &info));
                        }
                        last_error = Some(error);
                        break;
                    }
                }
            }
        }

        let error = match last_error {
            Some(last) => CommandError::RetriesExhausted { attempts, last },
            None => CommandError::NoServerAvailable(lb_name),
        };
        Err(self.fail(error, &info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::context::DefaultRetryHandler;
    use std::sync::Mutex;

    fn command(same: u32, next: u32, servers: &[&str]) -> LoadBalancerCommand<()> {
        let lb = BaseLoadBalancer::builder(ClientConfig::new("cmd")).build();
        lb.set_servers_list(servers.to_vec());
        let ctx = ExecutionContext::new(
            (),
            None,
            Arc::new(ClientConfig::new("cmd")),
            Arc::new(DefaultRetryHandler::new(same, next, false)),
        );
        LoadBalancerCommand::new(lb, ctx).with_backoff(Backoff::none())
    }

    #[tokio::test]
    async fn test_connect_error_moves_to_next_server() {
        let cmd = command(0, 1, &["a:1", "b:1"]);
        let tried = Mutex::new(Vec::new());

        let result = cmd
            .submit(|server| {
                tried.lock().unwrap().push(server.id().to_string());
                let id = server.id().to_string();
                async move {
                    if id == "a:1" {
                        Err(ClientError::connect("refused"))
                    } else {
                        Ok(id)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "b:1");
        assert_eq!(*tried.lock().unwrap(), vec!["a:1", "b:1"]);
        let stats = cmd.lb.stats();
        assert_eq!(stats.peek("a:1").unwrap().successive_connection_failures(), 1);
        assert_eq!(stats.peek("b:1").unwrap().total_requests(), 1);
        assert_eq!(stats.peek("b:1").unwrap().active_requests_count(), 0);
    }

    #[tokio::test]
    async fn test_same_server_retries_then_exhausted() {
        let cmd = command(2, 0, &["a:1"]);
        let calls = Mutex::new(0u32);

        let result: Result<(), _> = cmd
            .submit(|_| {
                *calls.lock().unwrap() += 1;
                async { Err(ClientError::read_timeout("slow")) }
            })
            .await;

        assert!(matches!(result, Err(CommandError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_general_error_not_retried() {
        let cmd = command(3, 3, &["a:1", "b:1"]);
        let calls = Mutex::new(0u32);

        let result: Result<(), _> = cmd
            .submit(|_| {
                *calls.lock().unwrap() += 1;
                async { Err(ClientError::general("bad request")) }
            })
            .await;

        assert!(matches!(result, Err(CommandError::Client(_))));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(cmd.lb.stats().peek("a:1").unwrap().successive_connection_failures(), 0);
    }

    #[tokio::test]
    async fn test_no_server_available() {
        let cmd = command(0, 1, &[]);
        let result: Result<(), _> = cmd.submit(|_| async { Ok(()) }).await;
        assert!(matches!(result, Err(CommandError::NoServerAvailable(ref name)) if name == "cmd"));
    }

    #[tokio::test]
    async fn test_success_clears_connection_failures() {
        let cmd = command(0, 0, &["a:1"]);
        let a = cmd.lb.all_servers()[0].clone();
        cmd.lb.stats().increment_successive_connection_failure(&a);

        cmd.submit(|_| async { Ok::<_, ClientError>(()) }).await.unwrap();
        assert_eq!(cmd.lb.stats().peek("a:1").unwrap().successive_connection_failures(), 0);
    }
}
