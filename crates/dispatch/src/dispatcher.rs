//! Global subscription dispatcher.
//!
//! Keeps the instrument ↔ session ↔ connection bookkeeping consistent,
//! deduplicates upstream subscribes, migrates subscriptions off failed
//! connections, and retries failed subscribes from a queue drained by the
//! maintenance loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde_json::Value;
use tracing::{error, info, warn};

use common::LoadBalanceStrategy;
use upstream::{ConnectionPool, DispatcherEvents, UpstreamConnection};

use crate::balance;
use crate::cache::QuoteCache;

/// FAILED entries older than this are garbage-collected by the
/// maintenance loop.
const FAILED_SUBSCRIPTION_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Pending,
    Subscribing,
    Active,
    Failed,
    Cancelled,
}

/// One instrument that at least one session wants.
#[derive(Debug, Clone)]
struct SubscriptionInfo {
    assigned_connection_id: String,
    status: SubscriptionStatus,
    requesting_sessions: HashSet<String>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    retry_count: u32,
}

impl SubscriptionInfo {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            assigned_connection_id: String::new(),
            status: SubscriptionStatus::Pending,
            requesting_sessions: HashSet::new(),
            created_at: now,
            last_updated_at: now,
            retry_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// The three indexes form a consistent triple and are only ever mutated
/// together under this one lock.
#[derive(Default)]
struct DispatchState {
    global_subscriptions: HashMap<String, SubscriptionInfo>,
    session_subscriptions: HashMap<String, HashSet<String>>,
    connection_subscriptions: HashMap<String, HashSet<String>>,
}

/// Snapshot of dispatcher health, logged by the maintenance loop and
/// exposed through the gateway's health endpoint.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub total_instruments: usize,
    pub active_subscriptions: usize,
    pub pending_subscriptions: usize,
    pub failed_subscriptions: usize,
    pub connection_distribution: HashMap<String, usize>,
    pub total_sessions: usize,
}

pub struct SubscriptionDispatcher {
    pool: OnceLock<Arc<ConnectionPool>>,
    state: Mutex<DispatchState>,
    retry_queue: Mutex<VecDeque<String>>,
    strategy: Mutex<LoadBalanceStrategy>,
    round_robin: AtomicUsize,
    max_retry_count: u32,
    auto_failover: bool,
    cache: Arc<QuoteCache>,
    maintenance_interval: Duration,
    maintenance_running: AtomicBool,
    maintenance_thread: Mutex<Option<JoinHandle<()>>>,
    total_processed: AtomicU64,
    total_succeeded: AtomicU64,
    total_failed: AtomicU64,
}

impl SubscriptionDispatcher {
    pub fn new(
        cache: Arc<QuoteCache>,
        strategy: LoadBalanceStrategy,
        max_retry_count: u32,
        auto_failover: bool,
        maintenance_interval: Duration,
    ) -> Self {
        Self {
            pool: OnceLock::new(),
            state: Mutex::new(DispatchState::default()),
            retry_queue: Mutex::new(VecDeque::new()),
            strategy: Mutex::new(strategy),
            round_robin: AtomicUsize::new(0),
            max_retry_count,
            auto_failover,
            cache,
            maintenance_interval,
            maintenance_running: AtomicBool::new(false),
            maintenance_thread: Mutex::new(None),
            total_processed: AtomicU64::new(0),
            total_succeeded: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    /// Wire the connection pool. Must happen before any subscription
    /// traffic; the pool outlives the dispatcher's working life.
    pub fn attach_pool(&self, pool: Arc<ConnectionPool>) {
        if self.pool.set(pool).is_err() {
            warn!("connection pool already attached");
        }
    }

    pub fn cache(&self) -> &Arc<QuoteCache> {
        &self.cache
    }

    pub fn set_strategy(&self, strategy: LoadBalanceStrategy) {
        *self.strategy.lock().unwrap() = strategy;
        info!("load balance strategy changed to {strategy:?}");
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        *self.strategy.lock().unwrap()
    }

    /// Register `session_id`'s demand for `instrument_id`.
    ///
    /// The first session demanding an instrument triggers the upstream
    /// subscribe; later sessions piggyback on the existing entry.
    pub fn add_subscription(&self, session_id: &str, instrument_id: &str) -> bool {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        counter!("dispatch_subscriptions_requested_total").increment(1);

        let mut state = self.state.lock().unwrap();

        if let Some(info) = state.global_subscriptions.get_mut(instrument_id) {
            info.requesting_sessions.insert(session_id.to_string());
            state
                .session_subscriptions
                .entry(session_id.to_string())
                .or_default()
                .insert(instrument_id.to_string());
            info!("added session {session_id} to existing subscription {instrument_id}");
            return true;
        }

        let mut info = SubscriptionInfo::new();
        info.requesting_sessions.insert(session_id.to_string());
        state
            .global_subscriptions
            .insert(instrument_id.to_string(), info);
        state
            .session_subscriptions
            .entry(session_id.to_string())
            .or_default()
            .insert(instrument_id.to_string());

        let Some(connection) = self.select_connection(instrument_id) else {
            error!("no available connection for subscription {instrument_id}");
            if let Some(info) = state.global_subscriptions.get_mut(instrument_id) {
                info.status = SubscriptionStatus::Failed;
                info.touch();
            }
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let connection_id = connection.connection_id().to_string();
        if let Some(info) = state.global_subscriptions.get_mut(instrument_id) {
            info.assigned_connection_id = connection_id.clone();
            info.status = SubscriptionStatus::Subscribing;
            info.touch();
        }

        let subscribed = connection.subscribe(instrument_id);
        if !subscribed {
            if let Some(info) = state.global_subscriptions.get_mut(instrument_id) {
                info.status = SubscriptionStatus::Failed;
                info.touch();
            }
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        info!("new subscription {instrument_id} on connection {connection_id}");
        true
    }

    /// Drop `session_id`'s demand. The last session leaving drives the
    /// upstream unsubscribe and deletes the entry.
    pub fn remove_subscription(&self, session_id: &str, instrument_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();

        if let Some(instruments) = state.session_subscriptions.get_mut(session_id) {
            instruments.remove(instrument_id);
            if instruments.is_empty() {
                state.session_subscriptions.remove(session_id);
            }
        }

        let Some(info) = state.global_subscriptions.get_mut(instrument_id) else {
            return true;
        };

        info.requesting_sessions.remove(session_id);
        if !info.requesting_sessions.is_empty() {
            info!(
                "kept subscription {instrument_id} (still wanted by {} sessions)",
                info.requesting_sessions.len()
            );
            return true;
        }

        let connection_id = info.assigned_connection_id.clone();
        state.global_subscriptions.remove(instrument_id);
        drop(state);

        if self.execute_unsubscription(instrument_id, &connection_id) {
            info!("removed subscription {instrument_id} from connection {connection_id}");
        }
        true
    }

    /// Session disconnect: release everything it requested.
    pub fn remove_all_subscriptions_for_session(&self, session_id: &str) {
        let instruments: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .session_subscriptions
                .get(session_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        for instrument_id in instruments {
            self.remove_subscription(session_id, &instrument_id);
        }
        info!("removed all subscriptions for session {session_id}");
    }

    pub fn get_subscriptions_for_session(&self, session_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .session_subscriptions
            .get(session_id)
            .map(|set| {
                let mut v: Vec<String> = set.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    pub fn get_sessions_for_instrument(&self, instrument_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .global_subscriptions
            .get(instrument_id)
            .map(|info| {
                let mut v: Vec<String> = info.requesting_sessions.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    /// Status of an instrument's upstream subscription. Unknown
    /// instruments read as `Cancelled`.
    pub fn get_subscription_status(&self, instrument_id: &str) -> SubscriptionStatus {
        let state = self.state.lock().unwrap();
        state
            .global_subscriptions
            .get(instrument_id)
            .map(|info| info.status)
            .unwrap_or(SubscriptionStatus::Cancelled)
    }

    /// Which connection carries an instrument right now, if any.
    pub fn assigned_connection(&self, instrument_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .global_subscriptions
            .get(instrument_id)
            .filter(|info| !info.assigned_connection_id.is_empty())
            .map(|info| info.assigned_connection_id.clone())
    }

    pub fn total_subscriptions(&self) -> usize {
        self.state.lock().unwrap().global_subscriptions.len()
    }

    pub fn statistics(&self) -> Statistics {
        let state = self.state.lock().unwrap();

        let mut stats = Statistics {
            total_instruments: state.global_subscriptions.len(),
            total_sessions: state.session_subscriptions.len(),
            ..Default::default()
        };

        for info in state.global_subscriptions.values() {
            match info.status {
                SubscriptionStatus::Active => stats.active_subscriptions += 1,
                SubscriptionStatus::Pending | SubscriptionStatus::Subscribing => {
                    stats.pending_subscriptions += 1
                }
                SubscriptionStatus::Failed => stats.failed_subscriptions += 1,
                SubscriptionStatus::Cancelled => {}
            }
        }

        for (connection_id, instruments) in &state.connection_subscriptions {
            stats
                .connection_distribution
                .insert(connection_id.clone(), instruments.len());
        }

        stats
    }

    pub fn start_maintenance(self: &Arc<Self>) {
        if self.maintenance_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let dispatcher = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("dispatch-maintenance".to_string())
            .spawn(move || dispatcher.maintenance_loop())
            .expect("failed to spawn maintenance thread");

        *self.maintenance_thread.lock().unwrap() = Some(handle);
        info!("started subscription maintenance loop");
    }

    pub fn stop_maintenance(&self) {
        if !self.maintenance_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.maintenance_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("stopped subscription maintenance loop");
    }

    fn maintenance_loop(self: Arc<Self>) {
        while self.maintenance_running.load(Ordering::SeqCst) {
            self.process_pending();
            self.cleanup_expired(FAILED_SUBSCRIPTION_TTL);

            let stats = self.statistics();
            gauge!("dispatch_active_subscriptions").set(stats.active_subscriptions as f64);
            gauge!("dispatch_failed_subscriptions").set(stats.failed_subscriptions as f64);
            info!(
                "subscription stats - total: {}, active: {}, pending: {}, failed: {}, sessions: {}",
                stats.total_instruments,
                stats.active_subscriptions,
                stats.pending_subscriptions,
                stats.failed_subscriptions,
                stats.total_sessions
            );

            let seconds = self.maintenance_interval.as_secs().max(1);
            for _ in 0..seconds {
                if !self.maintenance_running.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    /// Drain the retry queue onto freshly selected connections.
    fn process_pending(&self) {
        let drained: Vec<String> = {
            let mut queue = self.retry_queue.lock().unwrap();
            queue.drain(..).collect()
        };

        for instrument_id in drained {
            let mut state = self.state.lock().unwrap();
            let Some(info) = state.global_subscriptions.get_mut(&instrument_id) else {
                continue;
            };
            if info.status != SubscriptionStatus::Failed {
                continue;
            }

            let Some(connection) = self.select_for_recovery() else {
                continue;
            };

            info.assigned_connection_id = connection.connection_id().to_string();
            info.status = SubscriptionStatus::Subscribing;
            info.touch();
            let retry_count = info.retry_count;

            if !connection.subscribe(&instrument_id) {
                info.status = SubscriptionStatus::Failed;
                info.touch();
                drop(state);
                if retry_count < self.max_retry_count {
                    self.retry_queue.lock().unwrap().push_back(instrument_id);
                }
            }
        }
    }

    /// Drop FAILED entries older than `ttl`, cleaning the session index
    /// with them so the triple stays consistent.
    fn cleanup_expired(&self, ttl: Duration) {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.state.lock().unwrap();

        let expired: Vec<String> = state
            .global_subscriptions
            .iter()
            .filter(|(_, info)| {
                info.status == SubscriptionStatus::Failed && info.last_updated_at < cutoff
            })
            .map(|(instrument_id, _)| instrument_id.clone())
            .collect();

        for instrument_id in expired {
            if let Some(info) = state.global_subscriptions.remove(&instrument_id) {
                for session_id in &info.requesting_sessions {
                    if let Some(set) = state.session_subscriptions.get_mut(session_id) {
                        set.remove(&instrument_id);
                        if set.is_empty() {
                            state.session_subscriptions.remove(session_id);
                        }
                    }
                }
            }
            info!("cleaned up expired subscription {instrument_id}");
        }
    }

    fn select_connection(&self, instrument_id: &str) -> Option<Arc<UpstreamConnection>> {
        let pool = self.pool.get()?;
        balance::select(
            self.strategy(),
            &pool.available(),
            instrument_id,
            &self.round_robin,
        )
    }

    /// Migration and retry always select on quality, whatever the
    /// configured placement strategy.
    fn select_for_recovery(&self) -> Option<Arc<UpstreamConnection>> {
        let pool = self.pool.get()?;
        balance::select_by_score(&pool.available())
    }

    fn execute_unsubscription(&self, instrument_id: &str, connection_id: &str) -> bool {
        let Some(pool) = self.pool.get() else {
            return false;
        };
        match pool.get(connection_id) {
            Some(connection) => connection.unsubscribe(instrument_id),
            // Connection already gone: nothing left to undo upstream.
            None => true,
        }
    }
}

impl DispatcherEvents for SubscriptionDispatcher {
    fn on_subscription_success(&self, connection_id: &str, instrument_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.global_subscriptions.get_mut(instrument_id) {
            info.status = SubscriptionStatus::Active;
            info.touch();
            state
                .connection_subscriptions
                .entry(connection_id.to_string())
                .or_default()
                .insert(instrument_id.to_string());
            self.total_succeeded.fetch_add(1, Ordering::Relaxed);
            counter!("dispatch_subscriptions_active_total").increment(1);
            info!("subscription active: {instrument_id} on {connection_id}");
        }
    }

    fn on_subscription_failed(&self, connection_id: &str, instrument_id: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(info) = state.global_subscriptions.get_mut(instrument_id) else {
            return;
        };

        info.status = SubscriptionStatus::Failed;
        info.retry_count += 1;
        info.touch();
        let retry_count = info.retry_count;
        drop(state);

        self.total_failed.fetch_add(1, Ordering::Relaxed);
        if retry_count < self.max_retry_count {
            self.retry_queue
                .lock()
                .unwrap()
                .push_back(instrument_id.to_string());
        }

        error!(
            "subscription failed: {instrument_id} on {connection_id} (retry {retry_count})"
        );
    }

    fn on_unsubscription_success(&self, connection_id: &str, instrument_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(instruments) = state.connection_subscriptions.get_mut(connection_id) {
            instruments.remove(instrument_id);
            if instruments.is_empty() {
                state.connection_subscriptions.remove(connection_id);
            }
        }
        info!("unsubscription confirmed: {instrument_id} on {connection_id}");
    }

    fn on_market_data(&self, _connection_id: &str, instrument_id: &str, quote: Value) {
        counter!("dispatch_ticks_total").increment(1);
        self.cache.update(instrument_id, quote);
    }

    fn handle_connection_failure(&self, connection_id: &str) {
        warn!("handling connection failure: {connection_id}");

        let mut state = self.state.lock().unwrap();

        let affected: Vec<String> = state
            .global_subscriptions
            .iter_mut()
            .filter(|(_, info)| {
                info.assigned_connection_id == connection_id
                    && info.status == SubscriptionStatus::Active
            })
            .map(|(instrument_id, info)| {
                info.status = SubscriptionStatus::Failed;
                info.touch();
                instrument_id.clone()
            })
            .collect();

        if self.auto_failover {
            for instrument_id in &affected {
                let replacement = self
                    .select_for_recovery()
                    .filter(|c| c.connection_id() != connection_id);
                let Some(connection) = replacement else {
                    error!("no available connection to migrate subscription {instrument_id}");
                    continue;
                };

                let target_id = connection.connection_id().to_string();
                info!(
                    "migrating subscription {instrument_id} from {connection_id} to {target_id}"
                );
                counter!("dispatch_migrations_total").increment(1);

                if let Some(info) = state.global_subscriptions.get_mut(instrument_id) {
                    info.assigned_connection_id = target_id.clone();
                    info.status = SubscriptionStatus::Subscribing;
                    info.retry_count = 0;
                    info.touch();
                }

                if !connection.subscribe(instrument_id) {
                    error!("failed to migrate subscription {instrument_id}");
                    if let Some(info) = state.global_subscriptions.get_mut(instrument_id) {
                        info.status = SubscriptionStatus::Failed;
                        info.touch();
                    }
                }
            }
        } else if !affected.is_empty() {
            // Failover disabled: leave them queued for the retry path.
            let mut queue = self.retry_queue.lock().unwrap();
            queue.extend(affected.iter().cloned());
        }

        state.connection_subscriptions.remove(connection_id);
        info!("connection failure handling completed for {connection_id}");
    }

    fn handle_connection_recovery(&self, connection_id: &str) {
        info!("connection recovered: {connection_id}");
        self.process_pending();
    }
}
