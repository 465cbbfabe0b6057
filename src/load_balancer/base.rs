//! The base load balancer.
//!
//! # Responsibilities
//! - Own the full and the up server lists
//! - Run health check cycles, periodically and on demand
//! - Delegate selection to the configured rule
//! - Notify listeners of list and status changes
//!
//! # Locking
//! The full list and the up list each sit behind their own `RwLock` holding
//! an `Arc<Vec<_>>`. Writers build a new vector and swap the `Arc`; readers
//! clone the `Arc` and release the lock before iterating. The two lists are
//! never locked together, so the up list may briefly lag the full list.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::{ClientConfig, ConfigKey};
use crate::error::LbError;
use crate::load_balancer::listener::{Listeners, ServerListChangeListener, ServerStatusChangeListener};
use crate::load_balancer::ping::{ping_with_deadline, NoOpPing, Ping, PingStrategy, SerialPingStrategy, TcpPing};
use crate::load_balancer::server::{same_servers, IntoServer, Server};
use crate::load_balancer::stats::{LoadBalancerStats, ServerStatsSnapshot, StatsSettings};
use crate::load_balancer::{InProgress, LoadBalancer, Servers};
use crate::observability::metrics::{MetricsSink, NoopMetrics};
use crate::registry::Registry;
use crate::rule::{RoundRobinRule, Rule};

/// Serializable summary for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerSnapshot {
    pub name: String,
    pub rule: String,
    pub choose_calls: u64,
    pub all_servers: usize,
    pub up_servers: usize,
    pub servers: Vec<ServerStatsSnapshot>,
}

/// Owns a server pool, keeps it health checked and picks servers from it.
pub struct BaseLoadBalancer {
    name: String,
    config: ClientConfig,
    rule: RwLock<Option<Arc<dyn Rule>>>,
    ping: Arc<dyn Ping>,
    ping_strategy: Arc<dyn PingStrategy>,
    primer: Option<Arc<dyn Ping>>,
    stats: Arc<LoadBalancerStats>,
    metrics: Arc<dyn MetricsSink>,

    all_servers: RwLock<Servers>,
    up_servers: RwLock<Servers>,

    ping_interval: Duration,
    max_total_ping_time: Duration,
    priming_timeout: Duration,
    ping_in_progress: AtomicBool,
    quick_ping: Arc<Notify>,
    ping_task: Mutex<Option<JoinHandle<()>>>,

    choose_calls: AtomicU64,
    list_listeners: Listeners<dyn ServerListChangeListener>,
    status_listeners: Listeners<dyn ServerStatusChangeListener>,
}

impl std::fmt::Debug for BaseLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseLoadBalancer")
            .field("name", &self.name)
            .field("ping", &self.ping)
            .field("ping_strategy", &self.ping_strategy)
            .field("all_servers", &self.all_servers().len())
            .field("up_servers", &self.reachable_servers().len())
            .finish()
    }
}

/// Builder for [`BaseLoadBalancer`].
pub struct LoadBalancerBuilder {
    config: ClientConfig,
    rule: Option<Arc<dyn Rule>>,
    ping: Option<Arc<dyn Ping>>,
    ping_strategy: Option<Arc<dyn PingStrategy>>,
    primer: Option<Arc<dyn Ping>>,
    stats: Option<Arc<LoadBalancerStats>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl LoadBalancerBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            rule: None,
            ping: None,
            ping_strategy: None,
            primer: None,
            stats: None,
            metrics: None,
        }
    }

    pub fn rule(mut self, rule: impl Rule + 'static) -> Self {
        self.rule = Some(Arc::new(rule));
        self
    }

    pub fn shared_rule(mut self, rule: Arc<dyn Rule>) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn ping(mut self, ping: Arc<dyn Ping>) -> Self {
        self.ping = Some(ping);
        self
    }

    pub fn ping_strategy(mut self, strategy: Arc<dyn PingStrategy>) -> Self {
        self.ping_strategy = Some(strategy);
        self
    }

    /// Health check used to prime new servers when priming is enabled.
    pub fn primer(mut self, primer: Arc<dyn Ping>) -> Self {
        self.primer = Some(primer);
        self
    }

    pub fn stats(mut self, stats: Arc<LoadBalancerStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Arc<BaseLoadBalancer> {
        let config = self.config;
        let name = config.name().to_string();

        let priming_timeout = config.duration_millis(ConfigKey::PrimingTimeoutMs);
        let primer = if config.get_or_default::<bool>(ConfigKey::EnablePrimingConnections) {
            Some(
                self.primer
                    .unwrap_or_else(|| Arc::new(TcpPing::new(priming_timeout)) as Arc<dyn Ping>),
            )
        } else {
            None
        };

        let stats = self
            .stats
            .unwrap_or_else(|| Arc::new(LoadBalancerStats::new(name.clone(), StatsSettings::from_config(&config))));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        metrics.register(&name);

        let rule = self
            .rule
            .unwrap_or_else(|| Arc::new(RoundRobinRule::new()) as Arc<dyn Rule>);

        let lb = BaseLoadBalancer {
            ping_interval: config.duration_secs(ConfigKey::PingIntervalSecs).max(Duration::from_secs(1)),
            max_total_ping_time: config.duration_secs(ConfigKey::MaxTotalPingTimeSecs),
            priming_timeout,
            name,
            rule: RwLock::new(Some(rule)),
            ping: self.ping.unwrap_or_else(|| Arc::new(NoOpPing)),
            ping_strategy: self
                .ping_strategy
                .unwrap_or_else(|| Arc::new(SerialPingStrategy)),
            primer,
            stats,
            metrics,
            all_servers: RwLock::new(Arc::new(Vec::new())),
            up_servers: RwLock::new(Arc::new(Vec::new())),
            ping_in_progress: AtomicBool::new(false),
            quick_ping: Arc::new(Notify::new()),
            ping_task: Mutex::new(None),
            choose_calls: AtomicU64::new(0),
            list_listeners: Listeners::default(),
            status_listeners: Listeners::default(),
            config,
        };

        tracing::info!(
            lb = %lb.name,
            ping = ?lb.ping,
            ping_interval_secs = lb.ping_interval.as_secs(),
            priming = lb.primer.is_some(),
            "Load balancer created"
        );
        Arc::new(lb)
    }
}

impl BaseLoadBalancer {
    pub fn builder(config: ClientConfig) -> LoadBalancerBuilder {
        LoadBalancerBuilder::new(config)
    }

    /// Build from configuration, resolving rule, ping, ping strategy and
    /// stats by name through `registry`.
    ///
    /// Any unknown component name is fatal.
    pub fn from_config(
        config: ClientConfig,
        registry: &Registry,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Arc<Self>, LbError> {
        let rule = registry.create_rule(&config)?;
        let ping = registry.create_ping(&config)?;
        let strategy = registry.create_ping_strategy(&config)?;
        let stats = registry.create_stats(&config)?;

        Ok(Self::builder(config)
            .shared_rule(rule)
            .ping(ping)
            .ping_strategy(strategy)
            .stats(stats)
            .metrics(metrics)
            .build())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_rule(&self, rule: Arc<dyn Rule>) {
        tracing::info!(lb = %self.name, rule = rule.name(), "Rule replaced");
        *self.rule.write().unwrap_or_else(PoisonError::into_inner) = Some(rule);
    }

    pub fn clear_rule(&self) {
        *self.rule.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn rule_name(&self) -> Option<&'static str> {
        self.rule
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.name())
    }

    pub fn ping(&self) -> &Arc<dyn Ping> {
        &self.ping
    }

    pub fn stats_handle(&self) -> Arc<LoadBalancerStats> {
        self.stats.clone()
    }

    /// Whether health checking is skipped altogether.
    fn can_skip_ping(&self) -> bool {
        self.ping.is_dummy()
    }

    pub fn is_ping_in_progress(&self) -> bool {
        self.ping_in_progress.load(Ordering::Acquire)
    }

    pub fn choose_calls(&self) -> u64 {
        self.choose_calls.load(Ordering::Relaxed)
    }

    pub fn add_server_list_change_listener(&self, listener: Arc<dyn ServerListChangeListener>) {
        self.list_listeners.add(listener);
    }

    pub fn remove_server_list_change_listener(&self, listener: &Arc<dyn ServerListChangeListener>) -> bool {
        self.list_listeners.remove(listener)
    }

    pub fn add_server_status_change_listener(&self, listener: Arc<dyn ServerStatusChangeListener>) {
        self.status_listeners.add(listener);
    }

    pub fn remove_server_status_change_listener(&self, listener: &Arc<dyn ServerStatusChangeListener>) -> bool {
        self.status_listeners.remove(listener)
    }

    fn load(list: &RwLock<Servers>) -> Servers {
        list.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn store(list: &RwLock<Servers>, servers: Vec<Arc<Server>>) {
        *list.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(servers);
    }

    /// Replace the full server list.
    ///
    /// Entries that fail to parse are skipped. A server whose id and zone
    /// match one already known keeps the existing instance. A known id under
    /// a new zone gets a new instance carrying the old alive and ready flags.
    /// Duplicate ids keep the first. A change of ids, order or zones counts
    /// as a list change.
    pub fn set_servers_list<I, S>(&self, servers: I)
    where
        I: IntoIterator<Item = S>,
        S: IntoServer,
    {
        let (old, new) = {
            let mut guard = self.all_servers.write().unwrap_or_else(PoisonError::into_inner);
            let old = guard.clone();
            let known: HashMap<&str, &Arc<Server>> = old.iter().map(|s| (s.id(), s)).collect();

            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for entry in servers {
                let server = match entry.into_server() {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(lb = %self.name, error = %e, "Ignoring server");
                        continue;
                    }
                };
                if !seen.insert(server.id().to_string()) {
                    continue;
                }
                let server = match known.get(server.id()) {
                    Some(existing) if existing.zone() == server.zone() => Arc::clone(existing),
                    Some(existing) => {
                        server.set_alive(existing.is_alive());
                        server.set_ready_to_serve(existing.is_ready_to_serve());
                        server
                    }
                    None => server,
                };
                next.push(server);
            }

            let new = Arc::new(next);
            *guard = new.clone();
            (old, new)
        };

        let list_changed = !same_servers(&old, &new);

        let old_ids: HashSet<&str> = old.iter().map(|s| s.id()).collect();
        let added: Vec<Arc<Server>> = new
            .iter()
            .filter(|s| !old_ids.contains(s.id()))
            .cloned()
            .collect();
        for server in new.iter() {
            self.stats.single_server_stat(server);
        }
        self.stats.update_zone_server_mapping(&new);

        if !added.is_empty() {
            self.prime_connections(added);
        }

        if self.can_skip_ping() {
            for server in new.iter() {
                server.set_alive(true);
            }
            Self::store(&self.up_servers, new.as_ref().clone());
        } else if list_changed {
            // Up list follows the new instances until the next cycle confirms them.
            let up: Vec<Arc<Server>> = new.iter().filter(|s| s.is_alive()).cloned().collect();
            Self::store(&self.up_servers, up);
            self.quick_ping.notify_one();
        }

        self.metrics
            .record_server_counts(&self.name, new.len(), self.reachable_servers().len());

        if list_changed {
            tracing::info!(lb = %self.name, old = old.len(), new = new.len(), "Server list changed");
            self.list_listeners.notify(&self.name, "server_list", |l| {
                l.server_list_changed(&old, &new)
            });
        }
    }

    /// Append one server.
    pub fn add_server<S: IntoServer>(&self, server: S) {
        match server.into_server() {
            Ok(server) => self.add_servers(vec![server]),
            Err(e) => tracing::warn!(lb = %self.name, error = %e, "Ignoring server"),
        }
    }

    fn prime_connections(&self, servers: Vec<Arc<Server>>) {
        let Some(primer) = self.primer.clone() else {
            return;
        };
        let handle = match Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                tracing::warn!(lb = %self.name, "No async runtime, skipping connection priming");
                return;
            }
        };
        let timeout = self.priming_timeout;
        let lb = self.name.clone();
        for server in servers {
            server.set_ready_to_serve(false);
            let primer = primer.clone();
            let lb = lb.clone();
            handle.spawn(async move {
                let primed = ping_with_deadline(primer.as_ref(), &server, timeout).await;
                // Serve regardless of the priming outcome.
                server.set_ready_to_serve(true);
                tracing::debug!(lb = %lb, server = %server, primed, "Connection priming finished");
            });
        }
    }

    /// Mark a server down by id. Unknown ids are ignored.
    pub fn mark_server_down_by_id(&self, id: &str) {
        let all = self.all_servers();
        if let Some(server) = all.iter().find(|s| s.id() == id) {
            self.mark_server_down(server);
        }
    }

    /// Request an out-of-cycle ping from the running ping task.
    pub fn request_quick_ping(&self) {
        if !self.can_skip_ping() {
            self.quick_ping.notify_one();
        }
    }

    /// Run one ping cycle now.
    pub async fn force_quick_ping(&self) {
        if self.can_skip_ping() {
            return;
        }
        tracing::debug!(lb = %self.name, "Forcing quick ping");
        self.run_pinger().await;
    }

    /// Run a single health check cycle.
    ///
    /// Returns `false` without doing anything when another cycle is already
    /// running: overlapping cycles are dropped, not queued.
    pub async fn run_pinger(&self) -> bool {
        let Some(_guard) = InProgress::acquire(&self.ping_in_progress) else {
            tracing::debug!(lb = %self.name, "Ping cycle already in progress, skipping");
            return false;
        };
        let started = Instant::now();

        let snapshot = self.all_servers();
        let cycle = AssertUnwindSafe(self.ping_strategy.ping_servers(
            self.ping.as_ref(),
            &snapshot,
            self.max_total_ping_time,
        ))
        .catch_unwind()
        .await;
        let results = match cycle {
            Ok(results) if results.len() == snapshot.len() => results,
            Ok(results) => {
                tracing::error!(
                    lb = %self.name,
                    expected = snapshot.len(),
                    got = results.len(),
                    "Ping strategy returned misaligned results, discarding cycle"
                );
                return true;
            }
            Err(_) => {
                tracing::error!(lb = %self.name, "Ping strategy panicked, discarding cycle");
                return true;
            }
        };

        let mut changed = Vec::new();
        let mut up = Vec::with_capacity(snapshot.len());
        for (server, alive) in snapshot.iter().zip(results) {
            let was_alive = server.set_alive(alive);
            if was_alive != alive {
                tracing::info!(lb = %self.name, server = %server, alive, "Server status changed");
                self.metrics.record_server_status(&self.name, server, alive);
                changed.push(server.clone());
            }
            if alive {
                up.push(server.clone());
            }
        }

        let up_count = up.len();
        Self::store(&self.up_servers, up);

        self.metrics.record_ping_cycle(&self.name, started.elapsed());
        self.metrics
            .record_server_counts(&self.name, snapshot.len(), up_count);
        tracing::debug!(
            lb = %self.name,
            total = snapshot.len(),
            up = up_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ping cycle finished"
        );

        if !changed.is_empty() {
            self.status_listeners
                .notify(&self.name, "server_status", |l| l.server_status_changed(&changed));
        }
        true
    }

    /// Start the periodic ping task, replacing any running one.
    ///
    /// The task runs a cycle on every tick and on every quick ping request,
    /// until `shutdown` fires, the task is cancelled, or the load balancer
    /// is dropped. Nothing is started for the no-op ping.
    pub fn start_ping_task(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.can_skip_ping() {
            tracing::debug!(lb = %self.name, "No-op ping configured, ping task not started");
            return;
        }
        self.cancel_ping_task();

        let weak: Weak<Self> = Arc::downgrade(self);
        let quick_ping = self.quick_ping.clone();
        let interval = self.ping_interval;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = quick_ping.notified() => {}
                    _ = shutdown.recv() => {
                        tracing::info!(lb = %name, "Ping task received shutdown signal, exiting loop");
                        break;
                    }
                }
                let Some(lb) = weak.upgrade() else {
                    break;
                };
                lb.run_pinger().await;
            }
        });

        tracing::info!(lb = %self.name, interval_secs = interval.as_secs(), "Ping task started");
        *self.ping_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Cancel the periodic ping task. An in-flight cycle is dropped at its
    /// next await point.
    pub fn cancel_ping_task(&self) {
        if let Some(handle) = self.ping_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            tracing::info!(lb = %self.name, "Ping task cancelled");
        }
    }

    pub fn is_ping_task_running(&self) -> bool {
        self.ping_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Drop stats of servers that are no longer in the full list.
    pub fn prune_stats(&self) -> usize {
        let all = self.all_servers();
        self.stats.prune(all.iter().map(|s| s.id()))
    }

    /// Stop background work and unregister from the metrics sink.
    pub fn shutdown(&self) {
        self.cancel_ping_task();
        self.metrics.unregister(&self.name);
    }

    pub fn snapshot(&self) -> LoadBalancerSnapshot {
        let all = self.all_servers();
        LoadBalancerSnapshot {
            name: self.name.clone(),
            rule: self.rule_name().unwrap_or("none").to_string(),
            choose_calls: self.choose_calls(),
            all_servers: all.len(),
            up_servers: self.reachable_servers().len(),
            servers: self.stats.snapshot(&all),
        }
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }
}

impl LoadBalancer for BaseLoadBalancer {
    fn name(&self) -> &str {
        &self.name
    }

    /// Appends by replacing the whole list.
    fn add_servers(&self, servers: Vec<Arc<Server>>) {
        if servers.is_empty() {
            return;
        }
        let current = self.all_servers();
        let merged: Vec<Arc<Server>> = current.iter().cloned().chain(servers).collect();
        self.set_servers_list(merged);
    }

    fn choose_server(&self, key: Option<&str>) -> Option<Arc<Server>> {
        self.choose_calls.fetch_add(1, Ordering::Relaxed);

        let rule = self.rule.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(rule) = rule else {
            tracing::debug!(lb = %self.name, "No rule configured");
            self.metrics.record_choice(&self.name, None);
            return None;
        };

        let chosen = match catch_unwind(AssertUnwindSafe(|| rule.choose(self, key))) {
            Ok(chosen) => chosen,
            Err(_) => {
                tracing::warn!(lb = %self.name, rule = rule.name(), key = ?key, "Rule panicked while choosing a server");
                None
            }
        };

        if chosen.is_none() {
            tracing::debug!(lb = %self.name, key = ?key, "No server available");
        }
        self.metrics.record_choice(&self.name, chosen.as_deref());
        chosen
    }

    fn mark_server_down(&self, server: &Arc<Server>) {
        if !server.set_alive(false) {
            return;
        }
        tracing::warn!(lb = %self.name, server = %server, "Server marked down");
        self.metrics.record_server_status(&self.name, server, false);
        let changed = [server.clone()];
        self.status_listeners
            .notify(&self.name, "server_status", |l| l.server_status_changed(&changed));
    }

    fn reachable_servers(&self) -> Servers {
        Self::load(&self.up_servers)
    }

    fn all_servers(&self) -> Servers {
        Self::load(&self.all_servers)
    }

    fn stats(&self) -> &LoadBalancerStats {
        &self.stats
    }

    fn client_config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for BaseLoadBalancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListenerError;
    use crate::load_balancer::ping::ConstantPing;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ClientConfig {
        ClientConfig::new("test")
    }

    #[test]
    fn test_dummy_ping_marks_everything_up() {
        let lb = BaseLoadBalancer::builder(config()).build();
        lb.set_servers_list(vec!["a:1", "b:2", "c:3"]);

        let all: Vec<_> = lb.all_servers().iter().map(|s| s.id().to_string()).collect();
        let up: Vec<_> = lb.reachable_servers().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(all, vec!["a:1", "b:2", "c:3"]);
        assert_eq!(all, up);
        assert!(lb.all_servers().iter().all(|s| s.is_alive()));
    }

    #[test]
    fn test_heterogeneous_input_and_add() {
        let lb = BaseLoadBalancer::builder(config()).build();
        lb.set_servers_list(vec!["a:1".to_string(), "bad:port".to_string()]);
        lb.add_server(Server::with_zone("b", 2, "z1"));
        lb.add_servers(vec![Arc::new(Server::new("c", 3)), Arc::new(Server::new("a", 1))]);

        let ids: Vec<_> = lb.all_servers().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn test_list_change_listener_fires_only_on_change() {
        let lb = BaseLoadBalancer::builder(config()).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        lb.add_server_list_change_listener(Arc::new(
            move |old: &[Arc<Server>], new: &[Arc<Server>]| -> Result<(), ListenerError> {
                assert_ne!(old.len(), new.len());
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));

        lb.set_servers_list(vec!["a:1"]);
        lb.set_servers_list(vec!["a:1"]);
        lb.set_servers_list(vec!["a:1", "b:1"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_existing_instances_survive_replacement() {
        let lb = BaseLoadBalancer::builder(config()).build();
        lb.set_servers_list(vec!["a:1"]);
        let before = lb.all_servers()[0].clone();
        lb.set_servers_list(vec!["a:1", "b:1"]);
        assert!(Arc::ptr_eq(&before, &lb.all_servers()[0]));
    }

    #[test]
    fn test_mark_server_down_is_idempotent() {
        let lb = BaseLoadBalancer::builder(config()).build();
        lb.set_servers_list(vec!["a:1", "b:1"]);
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        lb.add_server_status_change_listener(Arc::new(
            move |changed: &[Arc<Server>]| -> Result<(), ListenerError> {
                n.fetch_add(changed.len(), Ordering::SeqCst);
                Ok(())
            },
        ));

        lb.mark_server_down_by_id("a:1");
        lb.mark_server_down_by_id("a:1");
        let a = lb.all_servers()[0].clone();
        lb.mark_server_down(&a);
        lb.mark_server_down_by_id("missing:1");

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(!a.is_alive());
    }

    #[test]
    fn test_choose_without_rule_returns_none() {
        let lb = BaseLoadBalancer::builder(config()).build();
        lb.set_servers_list(vec!["a:1"]);
        lb.clear_rule();
        assert!(lb.choose_server(None).is_none());
        assert_eq!(lb.choose_calls(), 1);
    }

    #[derive(Debug)]
    struct PanickingRule;

    impl Rule for PanickingRule {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn choose(&self, _lb: &dyn LoadBalancer, _key: Option<&str>) -> Option<Arc<Server>> {
            panic!("rule exploded")
        }
    }

    #[test]
    fn test_rule_panic_is_contained() {
        let lb = BaseLoadBalancer::builder(config()).rule(PanickingRule).build();
        lb.set_servers_list(vec!["a:1"]);
        assert!(lb.choose_server(Some("k")).is_none());
        // Still serviceable afterwards.
        lb.set_rule(Arc::new(RoundRobinRule::new()));
        assert_eq!(lb.choose_server(None).unwrap().id(), "a:1");
    }

    #[tokio::test]
    async fn test_ping_cycle_builds_up_list() {
        let lb = BaseLoadBalancer::builder(config())
            .ping(Arc::new(ConstantPing(true)))
            .build();
        lb.set_servers_list(vec!["a:1", "b:1"]);
        assert!(lb.reachable_servers().is_empty());

        assert!(lb.run_pinger().await);
        assert_eq!(lb.reachable_servers().len(), 2);
        assert!(!lb.is_ping_in_progress());

        lb.set_servers_list(vec!["b:1"]);
        lb.force_quick_ping().await;
        let all = lb.all_servers();
        let up = lb.reachable_servers();
        assert!(up.iter().all(|u| all.iter().any(|a| a.id() == u.id())));
        assert_eq!(up.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_dropped() {
        let lb = BaseLoadBalancer::builder(config())
            .ping(Arc::new(ConstantPing(true)))
            .build();
        lb.ping_in_progress.store(true, Ordering::SeqCst);
        assert!(!lb.run_pinger().await);
        lb.ping_in_progress.store(false, Ordering::SeqCst);
        assert!(lb.run_pinger().await);
    }

    #[tokio::test]
    async fn test_priming_sets_ready_regardless_of_outcome() {
        let lb = BaseLoadBalancer::builder(config().with(ConfigKey::EnablePrimingConnections, true))
            .primer(Arc::new(ConstantPing(false)))
            .build();
        lb.set_servers_list(vec!["a:1"]);
        let a = lb.all_servers()[0].clone();

        for _ in 0..50 {
            if a.is_ready_to_serve() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.is_ready_to_serve());
    }
}
