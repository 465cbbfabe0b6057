//! Runtime statistics consumed by selection rules.
//!
//! # Responsibilities
//! - Per-server counters: active and total requests, response times,
//!   successive connection failures
//! - Circuit breaker state derived from connection failures
//! - Per-zone snapshots aggregated from the zone → servers mapping
//!
//! # Design Decisions
//! - Entries are created lazily and keyed by server id
//! - Entries outlive their server until [`LoadBalancerStats::prune`] runs
//! - Readers that only want to look use [`LoadBalancerStats::peek`], where a
//!   missing entry means "no data yet"

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::{ClientConfig, ConfigKey};
use crate::load_balancer::server::{normalize_zone, Server};

/// Thresholds shared by every [`ServerStats`] of one load balancer.
#[derive(Debug, Clone)]
pub struct StatsSettings {
    pub connection_failure_threshold: u32,
    pub circuit_tripped_timeout_factor: Duration,
    pub max_circuit_tripped_timeout: Duration,
    pub active_requests_count_timeout: Duration,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl StatsSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            connection_failure_threshold: config
                .get_or_default(ConfigKey::ConnectionFailureCountThreshold),
            circuit_tripped_timeout_factor: config
                .duration_secs(ConfigKey::CircuitTrippedTimeoutFactorSecs),
            max_circuit_tripped_timeout: config
                .duration_secs(ConfigKey::MaxCircuitTrippedTimeoutSecs),
            active_requests_count_timeout: config
                .duration_secs(ConfigKey::ActiveRequestsCountTimeoutSecs),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ResponseTimes {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

/// Response time summary in milliseconds.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq)]
pub struct ResponseTimeSummary {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

/// Counters for a single server.
#[derive(Debug)]
pub struct ServerStats {
    settings: Arc<StatsSettings>,
    total_requests: AtomicU64,
    active_requests: AtomicI64,
    last_active_change: Mutex<Option<Instant>>,
    successive_connection_failures: AtomicU32,
    last_connection_failure: Mutex<Option<Instant>>,
    response_times: Mutex<ResponseTimes>,
}

impl ServerStats {
    pub fn new(settings: Arc<StatsSettings>) -> Self {
        Self {
            settings,
            total_requests: AtomicU64::new(0),
            active_requests: AtomicI64::new(0),
            last_active_change: Mutex::new(None),
            successive_connection_failures: AtomicU32::new(0),
            last_connection_failure: Mutex::new(None),
            response_times: Mutex::new(ResponseTimes::default()),
        }
    }

    /// A request to this server started.
    pub fn note_open_connection(&self) {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.touch_active();
    }

    /// A request to this server finished after `response_time`.
    pub fn note_request_completion(&self, response_time: Duration) {
        let prev = self.active_requests.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            // Reset by timeout in the meantime; never go negative.
            self.active_requests.store(0, Ordering::Release);
        }
        self.touch_active();

        let ms = response_time.as_secs_f64() * 1000.0;
        let mut rt = self.response_times.lock().unwrap_or_else(PoisonError::into_inner);
        if rt.count == 0 {
            rt.min = ms;
            rt.max = ms;
        } else {
            rt.min = rt.min.min(ms);
            rt.max = rt.max.max(ms);
        }
        rt.count += 1;
        rt.sum += ms;
        rt.sum_sq += ms * ms;
    }

    fn touch_active(&self) {
        *self.last_active_change.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Active requests, treating a count untouched for longer than the
    /// configured timeout as stale (zero).
    pub fn active_requests_count(&self) -> u64 {
        self.active_requests_count_at(Instant::now())
    }

    pub fn active_requests_count_at(&self, now: Instant) -> u64 {
        let count = self.active_requests.load(Ordering::Acquire);
        if count <= 0 {
            return 0;
        }
        let last = *self.last_active_change.lock().unwrap_or_else(PoisonError::into_inner);
        match last {
            Some(t) if now.saturating_duration_since(t) > self.settings.active_requests_count_timeout => {
                self.active_requests.store(0, Ordering::Release);
                0
            }
            _ => count as u64,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn increment_successive_connection_failure(&self) {
        *self.last_connection_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.successive_connection_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn clear_successive_connection_failure(&self) {
        self.successive_connection_failures.store(0, Ordering::Release);
    }

    pub fn successive_connection_failures(&self) -> u32 {
        self.successive_connection_failures.load(Ordering::Acquire)
    }

    /// Length of the blackout once the failure threshold is reached.
    ///
    /// Doubles with each failure past the threshold, capped at the
    /// configured maximum. Saturates at the maximum on overflow.
    fn blackout_period(&self) -> Duration {
        let failures = self.successive_connection_failures();
        let threshold = self.settings.connection_failure_threshold;
        if failures < threshold {
            return Duration::ZERO;
        }
        let diff = (failures - threshold).min(16);
        let max = self.settings.max_circuit_tripped_timeout;
        self.settings
            .circuit_tripped_timeout_factor
            .checked_mul(1u32 << diff)
            .map_or(max, |blackout| blackout.min(max))
    }

    pub fn is_circuit_breaker_tripped(&self) -> bool {
        self.is_circuit_breaker_tripped_at(Instant::now())
    }

    pub fn is_circuit_breaker_tripped_at(&self, now: Instant) -> bool {
        let blackout = self.blackout_period();
        if blackout.is_zero() {
            return false;
        }
        let last = *self.last_connection_failure.lock().unwrap_or_else(PoisonError::into_inner);
        match last {
            // A blackout ending past the representable future never ends.
            Some(t) => t.checked_add(blackout).map_or(true, |end| now < end),
            None => false,
        }
    }

    pub fn response_time(&self) -> ResponseTimeSummary {
        let rt = *self.response_times.lock().unwrap_or_else(PoisonError::into_inner);
        if rt.count == 0 {
            return ResponseTimeSummary::default();
        }
        let n = rt.count as f64;
        let mean = rt.sum / n;
        let variance = (rt.sum_sq / n - mean * mean).max(0.0);
        ResponseTimeSummary {
            count: rt.count,
            mean,
            min: rt.min,
            max: rt.max,
            std_dev: variance.sqrt(),
        }
    }

    /// Mean response time in milliseconds; zero without data.
    pub fn response_time_avg(&self) -> f64 {
        self.response_time().mean
    }
}

/// Aggregate load of one zone.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq)]
pub struct ZoneSnapshot {
    pub instance_count: usize,
    pub circuit_tripped_count: usize,
    pub active_requests_count: u64,
    /// Active requests per non-tripped server; `-1.0` when every server in
    /// the zone is tripped.
    pub load_per_server: f64,
}

/// Serializable view of one server for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsSnapshot {
    pub id: String,
    pub zone: String,
    pub alive: bool,
    pub total_requests: u64,
    pub active_requests: u64,
    pub successive_connection_failures: u32,
    pub circuit_tripped: bool,
    pub response_time: ResponseTimeSummary,
}

/// Statistics repository for one load balancer.
#[derive(Debug)]
pub struct LoadBalancerStats {
    name: String,
    settings: Arc<StatsSettings>,
    servers: DashMap<String, Arc<ServerStats>>,
    zone_servers: DashMap<String, Vec<Arc<Server>>>,
}

impl LoadBalancerStats {
    pub fn new(name: impl Into<String>, settings: StatsSettings) -> Self {
        Self {
            name: name.into(),
            settings: Arc::new(settings),
            servers: DashMap::new(),
            zone_servers: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stats for `server`, created on first access.
    pub fn single_server_stat(&self, server: &Server) -> Arc<ServerStats> {
        self.servers
            .entry(server.id().to_string())
            .or_insert_with(|| Arc::new(ServerStats::new(self.settings.clone())))
            .clone()
    }

    /// Stats for `id` if any were recorded.
    pub fn peek(&self, id: &str) -> Option<Arc<ServerStats>> {
        self.servers.get(id).map(|r| r.value().clone())
    }

    pub fn note_open_connection(&self, server: &Server) {
        self.single_server_stat(server).note_open_connection();
    }

    pub fn note_request_completion(&self, server: &Server, response_time: Duration) {
        self.single_server_stat(server).note_request_completion(response_time);
    }

    pub fn increment_successive_connection_failure(&self, server: &Server) {
        self.single_server_stat(server).increment_successive_connection_failure();
    }

    pub fn clear_successive_connection_failure(&self, server: &Server) {
        self.single_server_stat(server).clear_successive_connection_failure();
    }

    pub fn is_circuit_breaker_tripped(&self, server: &Server) -> bool {
        self.peek(server.id())
            .map(|s| s.is_circuit_breaker_tripped())
            .unwrap_or(false)
    }

    pub fn active_requests_count(&self, server: &Server) -> u64 {
        self.peek(server.id())
            .map(|s| s.active_requests_count())
            .unwrap_or(0)
    }

    /// Replace the zone → servers mapping. Zone names are case-insensitive.
    pub fn update_zone_server_mapping(&self, servers: &[Arc<Server>]) {
        let mut grouped: HashMap<String, Vec<Arc<Server>>> = HashMap::new();
        for server in servers {
            grouped
                .entry(normalize_zone(server.zone()))
                .or_default()
                .push(server.clone());
        }
        self.zone_servers.retain(|zone, _| grouped.contains_key(zone));
        for (zone, list) in grouped {
            self.zone_servers.insert(zone, list);
        }
    }

    /// Zones currently known, lowercased.
    pub fn available_zones(&self) -> Vec<String> {
        self.zone_servers.iter().map(|r| r.key().clone()).collect()
    }

    pub fn zone_snapshot(&self, zone: &str) -> ZoneSnapshot {
        let servers = self
            .zone_servers
            .get(&normalize_zone(zone))
            .map(|r| r.value().clone())
            .unwrap_or_default();
        self.snapshot_of(&servers, Instant::now())
    }

    /// Snapshot of every known zone.
    pub fn zone_snapshots(&self) -> HashMap<String, ZoneSnapshot> {
        let now = Instant::now();
        self.zone_servers
            .iter()
            .map(|r| (r.key().clone(), self.snapshot_of(r.value(), now)))
            .collect()
    }

    /// Aggregate over an arbitrary server set, as if it were one zone.
    pub fn snapshot_for(&self, servers: &[Arc<Server>]) -> ZoneSnapshot {
        self.snapshot_of(servers, Instant::now())
    }

    fn snapshot_of(&self, servers: &[Arc<Server>], now: Instant) -> ZoneSnapshot {
        if servers.is_empty() {
            return ZoneSnapshot::default();
        }
        let instance_count = servers.len();
        let mut tripped = 0usize;
        let mut active_total = 0u64;
        let mut active_available = 0u64;
        for server in servers {
            let Some(stat) = self.peek(server.id()) else {
                continue;
            };
            let active = stat.active_requests_count_at(now);
            if stat.is_circuit_breaker_tripped_at(now) {
                tripped += 1;
            } else {
                active_available += active;
            }
            active_total += active;
        }
        let load_per_server = if tripped == instance_count {
            -1.0
        } else {
            active_available as f64 / (instance_count - tripped) as f64
        };
        ZoneSnapshot {
            instance_count,
            circuit_tripped_count: tripped,
            active_requests_count: active_total,
            load_per_server,
        }
    }

    /// Drop stats for servers not in `keep_ids`. Returns how many were removed.
    pub fn prune<'a, I>(&self, keep_ids: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keep: std::collections::HashSet<&str> = keep_ids.into_iter().collect();
        let before = self.servers.len();
        self.servers.retain(|id, _| keep.contains(id.as_str()));
        before - self.servers.len()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Report on the given servers.
    pub fn snapshot(&self, servers: &[Arc<Server>]) -> Vec<ServerStatsSnapshot> {
        servers
            .iter()
            .map(|server| {
                let stat = self.peek(server.id());
                ServerStatsSnapshot {
                    id: server.id().to_string(),
                    zone: server.zone().to_string(),
                    alive: server.is_alive(),
                    total_requests: stat.as_ref().map(|s| s.total_requests()).unwrap_or(0),
                    active_requests: stat.as_ref().map(|s| s.active_requests_count()).unwrap_or(0),
                    successive_connection_failures: stat
                        .as_ref()
                        .map(|s| s.successive_connection_failures())
                        .unwrap_or(0),
                    circuit_tripped: stat
                        .as_ref()
                        .map(|s| s.is_circuit_breaker_tripped())
                        .unwrap_or(false),
                    response_time: stat.as_ref().map(|s| s.response_time()).unwrap_or_default(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Arc<StatsSettings> {
        Arc::new(StatsSettings {
            connection_failure_threshold: 3,
            circuit_tripped_timeout_factor: Duration::from_secs(10),
            max_circuit_tripped_timeout: Duration::from_secs(30),
            active_requests_count_timeout: Duration::from_secs(600),
        })
    }

    #[test]
    fn test_circuit_breaker_trips_and_recovers() {
        let stats = ServerStats::new(settings());
        let now = Instant::now();

        stats.increment_successive_connection_failure();
        stats.increment_successive_connection_failure();
        assert!(!stats.is_circuit_breaker_tripped_at(now));

        stats.increment_successive_connection_failure();
        assert!(stats.is_circuit_breaker_tripped());
        // 3 failures at threshold 3: 10s blackout.
        assert!(!stats.is_circuit_breaker_tripped_at(Instant::now() + Duration::from_secs(11)));

        stats.increment_successive_connection_failure();
        stats.increment_successive_connection_failure();
        // 2^2 * 10s capped at 30s.
        let later = Instant::now() + Duration::from_secs(25);
        assert!(stats.is_circuit_breaker_tripped_at(later));
        assert!(!stats.is_circuit_breaker_tripped_at(Instant::now() + Duration::from_secs(31)));

        stats.clear_successive_connection_failure();
        assert!(!stats.is_circuit_breaker_tripped());
    }

    #[test]
    fn test_active_requests_and_response_times() {
        let stats = ServerStats::new(settings());
        stats.note_open_connection();
        stats.note_open_connection();
        assert_eq!(stats.active_requests_count(), 2);
        assert_eq!(stats.total_requests(), 2);

        stats.note_request_completion(Duration::from_millis(10));
        stats.note_request_completion(Duration::from_millis(30));
        assert_eq!(stats.active_requests_count(), 0);

        let rt = stats.response_time();
        assert_eq!(rt.count, 2);
        assert!((rt.mean - 20.0).abs() < 1e-6);
        assert!((rt.min - 10.0).abs() < 1e-6);
        assert!((rt.max - 30.0).abs() < 1e-6);
        assert!((rt.std_dev - 10.0).abs() < 1e-6);

        // Extra completion never drives the count negative.
        stats.note_request_completion(Duration::from_millis(1));
        assert_eq!(stats.active_requests_count(), 0);
    }

    #[test]
    fn test_huge_blackout_saturates() {
        let stats = ServerStats::new(Arc::new(StatsSettings {
            connection_failure_threshold: 3,
            circuit_tripped_timeout_factor: Duration::from_secs(u64::MAX / 2),
            max_circuit_tripped_timeout: Duration::from_secs(u64::MAX),
            active_requests_count_timeout: Duration::from_secs(600),
        }));
        for _ in 0..4 {
            stats.increment_successive_connection_failure();
        }
        assert!(stats.is_circuit_breaker_tripped());
        assert_eq!(stats.blackout_period(), Duration::from_secs(u64::MAX));

        let lb_stats = LoadBalancerStats::new("huge", StatsSettings {
            connection_failure_threshold: 1,
            circuit_tripped_timeout_factor: Duration::from_secs(u64::MAX),
            max_circuit_tripped_timeout: Duration::from_secs(u64::MAX),
            active_requests_count_timeout: Duration::from_secs(600),
        });
        let a = Arc::new(Server::new("a", 1));
        for _ in 0..5 {
            lb_stats.increment_successive_connection_failure(&a);
        }
        assert_eq!(lb_stats.snapshot_for(&[a]).circuit_tripped_count, 1);

        stats.clear_successive_connection_failure();
        assert!(!stats.is_circuit_breaker_tripped());
    }

    #[test]
    fn test_stale_active_count_resets() {
        let stats = ServerStats::new(settings());
        stats.note_open_connection();
        let future = Instant::now() + Duration::from_secs(601);
        assert_eq!(stats.active_requests_count_at(future), 0);
        assert_eq!(stats.active_requests_count(), 0);
    }

    #[test]
    fn test_zone_snapshot() {
        let lb_stats = LoadBalancerStats::new("test", StatsSettings::default());
        let a = Arc::new(Server::with_zone("a", 1, "Zone-A"));
        let b = Arc::new(Server::with_zone("b", 1, "zone-a"));
        let c = Arc::new(Server::with_zone("c", 1, "zone-b"));
        lb_stats.update_zone_server_mapping(&[a.clone(), b.clone(), c.clone()]);

        lb_stats.note_open_connection(&a);
        lb_stats.note_open_connection(&a);
        for _ in 0..3 {
            lb_stats.increment_successive_connection_failure(&c);
        }

        let za = lb_stats.zone_snapshot("ZONE-A");
        assert_eq!(za.instance_count, 2);
        assert_eq!(za.active_requests_count, 2);
        assert!((za.load_per_server - 1.0).abs() < 1e-9);

        let zb = lb_stats.zone_snapshot("zone-b");
        assert_eq!(zb.circuit_tripped_count, 1);
        assert_eq!(zb.load_per_server, -1.0);

        assert_eq!(lb_stats.zone_snapshot("nowhere"), ZoneSnapshot::default());
        assert_eq!(lb_stats.zone_snapshots().len(), 2);
    }

    #[test]
    fn test_missing_entry_is_no_data_and_prune() {
        let lb_stats = LoadBalancerStats::new("test", StatsSettings::default());
        let ghost = Server::new("ghost", 1);
        assert!(lb_stats.peek(ghost.id()).is_none());
        assert!(!lb_stats.is_circuit_breaker_tripped(&ghost));
        assert_eq!(lb_stats.active_requests_count(&ghost), 0);

        let a = Server::new("a", 1);
        lb_stats.single_server_stat(&a);
        lb_stats.single_server_stat(&ghost);
        assert_eq!(lb_stats.prune(["a:1"]), 1);
        assert!(lb_stats.peek("a:1").is_some());
        assert!(lb_stats.peek("ghost:1").is_none());
    }
}
