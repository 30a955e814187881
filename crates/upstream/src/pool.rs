//! Connection pool: lifecycle for every upstream session plus the health
//! monitor that restarts unhealthy ones with backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::counter;
use tracing::{error, info, warn};

use common::{ConnectionConfig, InstrumentCatalogue, QuoteSink};

use crate::connection::{ConnectionStatus, UpstreamConnection};
use crate::driver::DriverFactory;
use crate::events::DispatcherEvents;

/// Minimum spacing between restart attempts of one connection.
const RESTART_BACKOFF: Duration = Duration::from_secs(10);
/// A logged-in connection silent for this long is treated as failed.
const HEARTBEAT_TIMEOUT_MS: i64 = 60_000;
/// Disconnected connections with more errors than this are restarted.
const RESTART_ERROR_THRESHOLD: i32 = 5;

pub struct ConnectionPool {
    connections: Mutex<Vec<Arc<UpstreamConnection>>>,
    factory: Arc<dyn DriverFactory>,
    events: Weak<dyn DispatcherEvents>,
    catalogue: Arc<InstrumentCatalogue>,
    sink: Option<Arc<dyn QuoteSink>>,
    health_check_interval: Duration,
    monitor_running: AtomicBool,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    next_restart_allowed: Mutex<HashMap<String, Instant>>,
}

impl ConnectionPool {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        events: Weak<dyn DispatcherEvents>,
        catalogue: Arc<InstrumentCatalogue>,
        sink: Option<Arc<dyn QuoteSink>>,
        health_check_interval: Duration,
    ) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            factory,
            events,
            catalogue,
            sink,
            health_check_interval,
            monitor_running: AtomicBool::new(false),
            monitor_thread: Mutex::new(None),
            next_restart_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection. Fails if the id is already taken.
    pub fn add_connection(&self, config: ConnectionConfig) -> bool {
        let mut connections = self.connections.lock().unwrap();
        if connections
            .iter()
            .any(|c| c.connection_id() == config.connection_id)
        {
            error!("connection {} already exists", config.connection_id);
            return false;
        }

        info!(
            "added connection {} -> {}",
            config.connection_id, config.front_addr
        );
        connections.push(Arc::new(UpstreamConnection::new(
            config,
            Arc::clone(&self.factory),
            self.events.clone(),
            Arc::clone(&self.catalogue),
            self.sink.clone(),
        )));
        true
    }

    /// Stop and forget a connection.
    pub fn remove_connection(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.lock().unwrap();
        let Some(index) = connections
            .iter()
            .position(|c| c.connection_id() == connection_id)
        else {
            return false;
        };

        let connection = connections.remove(index);
        drop(connections);
        connection.stop();
        info!("removed connection {connection_id}");
        true
    }

    /// Start every `DISCONNECTED` connection. Returns false when any of
    /// them refused to start; the others keep going.
    pub fn start_all(&self) -> bool {
        let connections = self.snapshot();
        let mut all_started = true;
        for connection in &connections {
            if connection.status() == ConnectionStatus::Disconnected && !connection.start() {
                error!("failed to start connection {}", connection.connection_id());
                all_started = false;
            }
        }
        info!("started {} connections", connections.len());
        all_started
    }

    pub fn stop_all(&self) {
        self.stop_health_monitor();
        for connection in self.snapshot() {
            connection.stop();
        }
        info!("stopped all connections");
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<UpstreamConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.connection_id() == connection_id)
            .cloned()
    }

    /// Every connection, in insertion order.
    pub fn all(&self) -> Vec<Arc<UpstreamConnection>> {
        self.snapshot()
    }

    /// Logged-in connections with subscription headroom, in insertion
    /// order (selection ties break on that order).
    pub fn available(&self) -> Vec<Arc<UpstreamConnection>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.status() == ConnectionStatus::LoggedIn && c.can_accept_more())
            .collect()
    }

    /// Highest-quality available connection; first added wins ties.
    pub fn best_for_subscription(&self) -> Option<Arc<UpstreamConnection>> {
        let mut best: Option<Arc<UpstreamConnection>> = None;
        for connection in self.available() {
            match &best {
                Some(current) if connection.quality() <= current.quality() => {}
                _ => best = Some(connection),
            }
        }
        best
    }

    pub fn total_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn active_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| c.status() == ConnectionStatus::LoggedIn)
            .count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.snapshot().iter().map(|c| c.subscription_count()).sum()
    }

    /// Status lines for every connection, for health reporting.
    pub fn status_lines(&self) -> Vec<String> {
        self.snapshot().iter().map(|c| c.status_line()).collect()
    }

    pub fn start_health_monitor(self: &Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("health-monitor".to_string())
            .spawn(move || pool.health_loop())
            .expect("failed to spawn health monitor thread");

        *self.monitor_thread.lock().unwrap() = Some(handle);
        info!("started connection health monitor");
    }

    pub fn stop_health_monitor(&self) {
        if !self.monitor_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.monitor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("stopped connection health monitor");
    }

    fn snapshot(&self) -> Vec<Arc<UpstreamConnection>> {
        self.connections.lock().unwrap().clone()
    }

    fn health_loop(self: Arc<Self>) {
        while self.monitor_running.load(Ordering::SeqCst) {
            self.health_pass();

            // Sleep in one-second slices so shutdown stays prompt.
            let seconds = self.health_check_interval.as_secs().max(1);
            for _ in 0..seconds {
                if !self.monitor_running.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn health_pass(&self) {
        let now_ms = Utc::now().timestamp_millis();

        for connection in self.snapshot() {
            let status = connection.status();
            let id = connection.connection_id().to_string();

            if status == ConnectionStatus::Error
                || (status == ConnectionStatus::Disconnected
                    && connection.error_count() > RESTART_ERROR_THRESHOLD)
            {
                if self.restart_permitted(&id) {
                    warn!("connection {id} is unhealthy, attempting restart");
                    counter!("upstream_restarts_total").increment(1);
                    connection.restart();
                }
            }

            if status == ConnectionStatus::LoggedIn
                && now_ms - connection.last_heartbeat_ms() > HEARTBEAT_TIMEOUT_MS
            {
                warn!("connection {id} heartbeat timeout");
                if let Some(events) = self.events.upgrade() {
                    events.handle_connection_failure(&id);
                }
            }
        }
    }

    /// Restart gate: at most one attempt per connection per backoff
    /// window. Granting an attempt arms the next window.
    fn restart_permitted(&self, connection_id: &str) -> bool {
        let mut allowed = self.next_restart_allowed.lock().unwrap();
        let now = Instant::now();
        match allowed.get(connection_id) {
            Some(next) if now < *next => false,
            _ => {
                allowed.insert(connection_id.to_string(), now + RESTART_BACKOFF);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::Value;

    use super::*;
    use crate::driver::sim::RecordingFactory;
    use crate::driver::DriverCallbacks;

    #[derive(Default)]
    struct RecordingEvents {
        failures: Mutex<Vec<String>>,
    }

    impl DispatcherEvents for RecordingEvents {
        fn on_subscription_success(&self, _: &str, _: &str) {}
        fn on_subscription_failed(&self, _: &str, _: &str) {}
        fn on_unsubscription_success(&self, _: &str, _: &str) {}
        fn on_market_data(&self, _: &str, _: &str, _: Value) {}

        fn handle_connection_failure(&self, connection_id: &str) {
            self.failures
                .lock()
                .unwrap()
                .push(connection_id.to_string());
        }

        fn handle_connection_recovery(&self, _: &str) {}
    }

    fn config(id: &str, max_subscriptions: usize) -> ConnectionConfig {
        ConnectionConfig {
            connection_id: id.to_string(),
            front_addr: format!("tcp://front/{id}"),
            broker_id: "9999".to_string(),
            max_subscriptions,
            priority: 1,
            enabled: true,
        }
    }

    fn pool_fixture() -> (Arc<ConnectionPool>, Arc<RecordingEvents>) {
        let events = Arc::new(RecordingEvents::default());
        let events_dyn: Arc<dyn DispatcherEvents> = events.clone();
        let events_weak: Weak<dyn DispatcherEvents> = Arc::downgrade(&events_dyn);
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(RecordingFactory::new()),
            events_weak,
            Arc::new(InstrumentCatalogue::new()),
            None,
            Duration::from_secs(30),
        ));
        (pool, events)
    }

    fn log_in(connection: &Arc<UpstreamConnection>) {
        assert!(connection.start());
        connection.on_front_connected();
        connection.on_login(None);
    }

    #[test]
    fn duplicate_connection_ids_are_rejected() {
        let (pool, _events) = pool_fixture();
        assert!(pool.add_connection(config("c1", 10)));
        assert!(!pool.add_connection(config("c1", 10)));
        assert_eq!(pool.total_count(), 1);
    }

    #[test]
    fn available_filters_on_login_and_headroom() {
        let (pool, _events) = pool_fixture();
        pool.add_connection(config("c1", 1));
        pool.add_connection(config("c2", 10));

        assert!(pool.available().is_empty());

        let c1 = pool.get("c1").unwrap();
        let c2 = pool.get("c2").unwrap();
        log_in(&c1);
        log_in(&c2);
        assert_eq!(pool.available().len(), 2);

        // Fill c1 to its cap; it drops out of the available set.
        assert!(c1.subscribe("cu2501"));
        let available = pool.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].connection_id(), "c2");
    }

    #[test]
    fn best_connection_prefers_quality_then_insertion_order() {
        let (pool, _events) = pool_fixture();
        pool.add_connection(config("c1", 10));
        pool.add_connection(config("c2", 10));

        let c1 = pool.get("c1").unwrap();
        let c2 = pool.get("c2").unwrap();
        log_in(&c1);
        log_in(&c2);

        // Both sit at the post-login score: the earliest added wins.
        assert_eq!(
            pool.best_for_subscription().unwrap().connection_id(),
            "c1"
        );

        // A fresh tick lifts c2's score above the post-login default.
        c2.on_depth_market_data(&common::DepthMarketData {
            instrument_id: "cu2501".to_string(),
            ..Default::default()
        });
        assert!(c2.quality() > c1.quality());
        assert_eq!(
            pool.best_for_subscription().unwrap().connection_id(),
            "c2"
        );
    }

    #[test]
    fn restart_gate_allows_one_attempt_per_window() {
        let (pool, _events) = pool_fixture();
        assert!(pool.restart_permitted("c1"));
        assert!(!pool.restart_permitted("c1"));
        // Other connections run their own windows.
        assert!(pool.restart_permitted("c2"));
    }

    #[test]
    fn heartbeat_timeout_reports_failure() {
        let (pool, events) = pool_fixture();
        pool.add_connection(config("c1", 10));
        let c1 = pool.get("c1").unwrap();
        log_in(&c1);

        // Fresh heartbeat: nothing reported.
        pool.health_pass();
        assert!(events.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn total_subscriptions_sums_across_connections() {
        let (pool, _events) = pool_fixture();
        pool.add_connection(config("c1", 10));
        pool.add_connection(config("c2", 10));

        let c1 = pool.get("c1").unwrap();
        let c2 = pool.get("c2").unwrap();
        log_in(&c1);
        log_in(&c2);

        assert!(c1.subscribe("cu2501"));
        assert!(c2.subscribe("rb2505"));
        assert!(c2.subscribe("ag2506"));

        assert_eq!(pool.total_subscriptions(), 3);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn remove_connection_stops_it() {
        let (pool, _events) = pool_fixture();
        pool.add_connection(config("c1", 10));
        let c1 = pool.get("c1").unwrap();
        log_in(&c1);

        assert!(pool.remove_connection("c1"));
        assert!(pool.get("c1").is_none());
        assert_eq!(c1.status(), ConnectionStatus::Disconnected);
        assert!(!pool.remove_connection("c1"));
    }
}
