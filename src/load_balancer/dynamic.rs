//! Load balancer fed by a refreshable server list.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::loader::load_config;
use crate::config::{ClientConfig, ConfigKey};
use crate::error::LbError;
use crate::load_balancer::base::BaseLoadBalancer;
use crate::load_balancer::filter::ServerListFilter;
use crate::load_balancer::server::Server;
use crate::load_balancer::stats::LoadBalancerStats;
use crate::load_balancer::{InProgress, LoadBalancer, Servers};

/// A source of servers.
pub trait ServerList: Send + Sync + std::fmt::Debug {
    /// Servers used when the load balancer starts.
    fn initial_servers(&self) -> Result<Vec<Arc<Server>>, LbError>;

    /// Servers as of now.
    fn updated_servers(&self) -> Result<Vec<Arc<Server>>, LbError>;
}

/// A fixed list.
#[derive(Debug, Clone)]
pub struct StaticServerList {
    servers: Vec<Arc<Server>>,
}

impl StaticServerList {
    pub fn new<I>(servers: I) -> Self
    where
        I: IntoIterator<Item = Server>,
    {
        Self {
            servers: servers.into_iter().map(Arc::new).collect(),
        }
    }
}

impl ServerList for StaticServerList {
    fn initial_servers(&self) -> Result<Vec<Arc<Server>>, LbError> {
        Ok(self.servers.clone())
    }

    fn updated_servers(&self) -> Result<Vec<Arc<Server>>, LbError> {
        Ok(self.servers.clone())
    }
}

/// Servers listed in the `[client]` section of a config file, re-read on
/// every update.
#[derive(Debug, Clone)]
pub struct ConfigServerList {
    path: PathBuf,
}

impl ConfigServerList {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ServerList for ConfigServerList {
    fn initial_servers(&self) -> Result<Vec<Arc<Server>>, LbError> {
        self.updated_servers()
    }

    fn updated_servers(&self) -> Result<Vec<Arc<Server>>, LbError> {
        let config = load_config(&self.path).map_err(|e| LbError::ServerList(e.to_string()))?;
        Ok(config
            .client
            .parsed_servers()
            .into_iter()
            .map(Arc::new)
            .collect())
    }
}

/// A [`BaseLoadBalancer`] whose server list comes from a [`ServerList`],
/// optionally narrowed by a [`ServerListFilter`], and refreshed by a
/// background task.
pub struct DynamicServerListLoadBalancer {
    base: Arc<BaseLoadBalancer>,
    source: Arc<dyn ServerList>,
    filter: Option<Arc<dyn ServerListFilter>>,
    refresh_interval: Duration,
    update_in_progress: AtomicBool,
    last_update: Mutex<Option<Instant>>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DynamicServerListLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicServerListLoadBalancer")
            .field("base", &self.base)
            .field("source", &self.source)
            .field("filter", &self.filter)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl DynamicServerListLoadBalancer {
    pub fn new(
        base: Arc<BaseLoadBalancer>,
        source: Arc<dyn ServerList>,
        filter: Option<Arc<dyn ServerListFilter>>,
    ) -> Arc<Self> {
        let refresh_interval = base
            .client_config()
            .duration_secs(ConfigKey::ServerListRefreshIntervalSecs)
            .max(Duration::from_secs(1));
        Arc::new(Self {
            base,
            source,
            filter,
            refresh_interval,
            update_in_progress: AtomicBool::new(false),
            last_update: Mutex::new(None),
            updater: Mutex::new(None),
        })
    }

    pub fn base(&self) -> &Arc<BaseLoadBalancer> {
        &self.base
    }

    /// Load the initial list. Returns the number of servers applied.
    pub fn initialize(&self) -> Result<usize, LbError> {
        let servers = self.source.initial_servers()?;
        Ok(self.apply(servers))
    }

    /// Fetch, filter and apply the current list.
    ///
    /// Concurrent calls are dropped: `Ok(None)` means another update was
    /// already running.
    pub fn update_list_of_servers(&self) -> Result<Option<usize>, LbError> {
        let Some(_guard) = InProgress::acquire(&self.update_in_progress) else {
            return Ok(None);
        };
        let servers = self.source.updated_servers()?;
        Ok(Some(self.apply(servers)))
    }

    /// Filter `servers` and hand them to the base load balancer.
    pub fn apply(&self, servers: Vec<Arc<Server>>) -> usize {
        let servers = match &self.filter {
            Some(filter) => filter.filtered(&servers),
            None => servers,
        };
        let count = servers.len();
        self.base.set_servers_list(servers);
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        tracing::debug!(lb = %self.base.name(), servers = count, "Server list applied");
        count
    }

    pub fn last_update(&self) -> Option<Instant> {
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start polling the server list source, replacing any running poller.
    pub fn start_updater(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        self.stop_updater();

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.refresh_interval;
        let name = self.base.name().to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; the list was loaded at startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => {
                        tracing::info!(lb = %name, "Server list updater received shutdown signal, exiting loop");
                        break;
                    }
                }
                let Some(lb) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = lb.update_list_of_servers() {
                    tracing::warn!(lb = %name, error = %e, "Server list update failed, keeping current list");
                }
            }
        });

        tracing::info!(lb = %self.base.name(), interval_secs = interval.as_secs(), "Server list updater started");
        *self.updater.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn stop_updater(&self) {
        if let Some(handle) = self.updater.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            tracing::info!(lb = %self.base.name(), "Server list updater stopped");
        }
    }

    pub fn is_updater_running(&self) -> bool {
        self.updater
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl LoadBalancer for DynamicServerListLoadBalancer {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn add_servers(&self, servers: Vec<Arc<Server>>) {
        self.base.add_servers(servers);
    }

    fn choose_server(&self, key: Option<&str>) -> Option<Arc<Server>> {
        self.base.choose_server(key)
    }

    fn mark_server_down(&self, server: &Arc<Server>) {
        self.base.mark_server_down(server);
    }

    fn reachable_servers(&self) -> Servers {
        self.base.reachable_servers()
    }

    fn all_servers(&self) -> Servers {
        self.base.all_servers()
    }

    fn stats(&self) -> &LoadBalancerStats {
        self.base.stats()
    }

    fn client_config(&self) -> &ClientConfig {
        self.base.client_config()
    }
}

impl Drop for DynamicServerListLoadBalancer {
    fn drop(&mut self) {
        self.stop_updater();
    }
}
