//! One session to a broker front: lifecycle state machine, capped
//! subscription set, quality scoring, and tick translation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use common::{build_quote, ConnectionConfig, DepthMarketData, InstrumentCatalogue, QuoteSink};

use crate::driver::{DriverCallbacks, DriverFactory, MdDriver};
use crate::events::DispatcherEvents;

/// Lifecycle states. Forward-only except via explicit restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    LoggedIn = 3,
    Error = 4,
}

impl ConnectionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::LoggedIn,
            4 => ConnectionStatus::Error,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::LoggedIn => "LOGGED_IN",
            ConnectionStatus::Error => "ERROR",
        }
    }
}

const QUALITY_AFTER_LOGIN: i32 = 80;
const ERROR_LIMIT: i32 = 10;
const RESTART_PAUSE: Duration = Duration::from_secs(2);

/// One upstream session. Owned by the pool; the dispatcher reaches it
/// through id lookup only.
pub struct UpstreamConnection {
    config: ConnectionConfig,
    factory: Arc<dyn DriverFactory>,
    events: Weak<dyn DispatcherEvents>,
    catalogue: Arc<InstrumentCatalogue>,
    sink: Option<Arc<dyn QuoteSink>>,
    driver: Mutex<Option<Arc<dyn MdDriver>>>,
    status: AtomicU8,
    subscribed: Mutex<HashSet<String>>,
    quality: AtomicI32,
    last_heartbeat: AtomicI64,
    error_count: AtomicI32,
    request_id: AtomicI32,
}

impl UpstreamConnection {
    pub fn new(
        config: ConnectionConfig,
        factory: Arc<dyn DriverFactory>,
        events: Weak<dyn DispatcherEvents>,
        catalogue: Arc<InstrumentCatalogue>,
        sink: Option<Arc<dyn QuoteSink>>,
    ) -> Self {
        Self {
            config,
            factory,
            events,
            catalogue,
            sink,
            driver: Mutex::new(None),
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            subscribed: Mutex::new(HashSet::new()),
            quality: AtomicI32::new(0),
            last_heartbeat: AtomicI64::new(Utc::now().timestamp_millis()),
            error_count: AtomicI32::new(0),
            request_id: AtomicI32::new(0),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.config.connection_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn quality(&self) -> i32 {
        self.quality.load(Ordering::SeqCst)
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> i32 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.lock().unwrap().len()
    }

    pub fn can_accept_more(&self) -> bool {
        self.status() == ConnectionStatus::LoggedIn
            && self.subscription_count() < self.config.max_subscriptions
    }

    pub fn is_subscribed(&self, instrument_id: &str) -> bool {
        self.subscribed.lock().unwrap().contains(instrument_id)
    }

    /// Begin connecting. Fails if the connection is not `DISCONNECTED`.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .status
            .compare_exchange(
                ConnectionStatus::Disconnected as u8,
                ConnectionStatus::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        let self_dyn: Arc<dyn DriverCallbacks> = self.clone();
        let callbacks: Weak<dyn DriverCallbacks> = Arc::downgrade(&self_dyn);
        let driver = match self
            .factory
            .create(&self.config.connection_id, &self.config.front_addr, callbacks)
        {
            Ok(driver) => driver,
            Err(e) => {
                error!(
                    "failed to create driver for connection {}: {e}",
                    self.config.connection_id
                );
                self.enter_error_state();
                return false;
            }
        };

        *self.driver.lock().unwrap() = Some(Arc::clone(&driver));

        if let Err(e) = driver.connect() {
            error!(
                "failed to start connection {}: {e}",
                self.config.connection_id
            );
            self.enter_error_state();
            return false;
        }

        info!("connection {} starting", self.config.connection_id);
        true
    }

    /// Release the driver and drop to `DISCONNECTED`.
    pub fn stop(&self) {
        self.status
            .store(ConnectionStatus::Disconnected as u8, Ordering::SeqCst);
        self.quality.store(0, Ordering::SeqCst);

        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.release();
        }
        self.subscribed.lock().unwrap().clear();

        info!("connection {} stopped", self.config.connection_id);
    }

    /// Stop, pause, start again.
    pub fn restart(self: &Arc<Self>) -> bool {
        info!("restarting connection {}", self.config.connection_id);
        self.stop();
        std::thread::sleep(RESTART_PAUSE);
        self.start()
    }

    /// Subscribe the instrument on this session. Requires `LOGGED_IN`;
    /// idempotent for instruments already carried here.
    pub fn subscribe(&self, instrument_id: &str) -> bool {
        if self.status() != ConnectionStatus::LoggedIn {
            warn!(
                "connection {} not ready to subscribe {instrument_id}",
                self.config.connection_id
            );
            return false;
        }

        {
            let subs = self.subscribed.lock().unwrap();
            if subs.contains(instrument_id) {
                return true;
            }
            if subs.len() >= self.config.max_subscriptions {
                warn!(
                    "connection {} at its subscription cap ({})",
                    self.config.connection_id, self.config.max_subscriptions
                );
                return false;
            }
        }

        let Some(driver) = self.driver_handle() else {
            return false;
        };

        match driver.subscribe(instrument_id) {
            Ok(()) => {
                self.subscribed
                    .lock()
                    .unwrap()
                    .insert(instrument_id.to_string());
                info!(
                    "subscribed {instrument_id} on connection {}",
                    self.config.connection_id
                );
                true
            }
            Err(e) => {
                error!(
                    "failed to subscribe {instrument_id} on connection {}: {e}",
                    self.config.connection_id
                );
                self.record_error();
                false
            }
        }
    }

    /// Unsubscribe the instrument. Requires `LOGGED_IN`; succeeds without
    /// an upstream call when the instrument is not carried here.
    pub fn unsubscribe(&self, instrument_id: &str) -> bool {
        if self.status() != ConnectionStatus::LoggedIn {
            return false;
        }

        if !self.subscribed.lock().unwrap().contains(instrument_id) {
            return true;
        }

        let Some(driver) = self.driver_handle() else {
            return false;
        };

        match driver.unsubscribe(instrument_id) {
            Ok(()) => {
                self.subscribed.lock().unwrap().remove(instrument_id);
                info!(
                    "unsubscribed {instrument_id} on connection {}",
                    self.config.connection_id
                );
                true
            }
            Err(e) => {
                error!(
                    "failed to unsubscribe {instrument_id} on connection {}: {e}",
                    self.config.connection_id
                );
                self.record_error();
                false
            }
        }
    }

    /// Human-readable status line for health reporting.
    pub fn status_line(&self) -> String {
        format!(
            "{}: {} ({} subs) [quality: {}]",
            self.config.connection_id,
            self.status().as_str(),
            self.subscription_count(),
            self.quality()
        )
    }

    fn driver_handle(&self) -> Option<Arc<dyn MdDriver>> {
        self.driver.lock().unwrap().clone()
    }

    fn events(&self) -> Option<Arc<dyn DispatcherEvents>> {
        self.events.upgrade()
    }

    fn next_request_id(&self) -> i32 {
        self.request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Bump the error counter; past the limit the session is declared
    /// dead and drops its subscriptions.
    fn record_error(&self) {
        let errors = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        if errors > ERROR_LIMIT {
            error!(
                "too many errors on connection {}, marking as failed",
                self.config.connection_id
            );
            self.enter_error_state();
        }
    }

    fn enter_error_state(&self) {
        self.status
            .store(ConnectionStatus::Error as u8, Ordering::SeqCst);
        self.quality.store(0, Ordering::SeqCst);
        self.subscribed.lock().unwrap().clear();
    }

    /// Recompute the quality score from heartbeat age, error count, and
    /// subscription load.
    fn update_quality(&self) {
        let heartbeat_age = Utc::now().timestamp_millis() - self.last_heartbeat_ms();

        let mut quality = 100;
        if heartbeat_age > 10_000 {
            quality -= 30;
        } else if heartbeat_age > 5_000 {
            quality -= 15;
        }

        quality -= (self.error_count() * 10).min(50);

        let subs = self.subscription_count() as f64;
        let cap = self.config.max_subscriptions as f64;
        if subs > cap * 0.8 {
            quality -= 20;
        } else if subs > cap * 0.6 {
            quality -= 10;
        }

        self.quality.store(quality.clamp(0, 100), Ordering::SeqCst);
    }
}

impl DriverCallbacks for UpstreamConnection {
    fn on_front_connected(&self) {
        info!("connection {} front connected", self.config.connection_id);
        self.status
            .store(ConnectionStatus::Connected as u8, Ordering::SeqCst);
        self.last_heartbeat
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);

        let Some(driver) = self.driver_handle() else {
            return;
        };
        if let Err(e) = driver.login(&self.config.broker_id, "", "", self.next_request_id()) {
            error!(
                "failed to send login on connection {}: {e}",
                self.config.connection_id
            );
            self.error_count.fetch_add(1, Ordering::SeqCst);
            self.enter_error_state();
        }
    }

    fn on_front_disconnected(&self, reason: i32) {
        warn!(
            "connection {} front disconnected, reason: {reason}",
            self.config.connection_id
        );
        self.status
            .store(ConnectionStatus::Disconnected as u8, Ordering::SeqCst);
        self.quality.store(0, Ordering::SeqCst);
        self.error_count.fetch_add(1, Ordering::SeqCst);
        self.subscribed.lock().unwrap().clear();

        if let Some(events) = self.events() {
            events.handle_connection_failure(&self.config.connection_id);
        }
    }

    fn on_login(&self, error: Option<String>) {
        if let Some(message) = error {
            error!(
                "login failed on connection {}: {message}",
                self.config.connection_id
            );
            self.error_count.fetch_add(1, Ordering::SeqCst);
            self.enter_error_state();
            return;
        }

        info!("login successful on connection {}", self.config.connection_id);
        self.status
            .store(ConnectionStatus::LoggedIn as u8, Ordering::SeqCst);
        self.quality.store(QUALITY_AFTER_LOGIN, Ordering::SeqCst);

        if let Some(events) = self.events() {
            events.handle_connection_recovery(&self.config.connection_id);
        }
    }

    fn on_subscribe_ack(&self, instrument_id: &str, error: Option<String>) {
        if let Some(message) = error {
            error!(
                "subscribe {instrument_id} failed on connection {}: {message}",
                self.config.connection_id
            );
            self.record_error();
            if let Some(events) = self.events() {
                events.on_subscription_failed(&self.config.connection_id, instrument_id);
            }
            return;
        }

        if let Some(events) = self.events() {
            events.on_subscription_success(&self.config.connection_id, instrument_id);
        }
    }

    fn on_unsubscribe_ack(&self, instrument_id: &str, error: Option<String>) {
        if let Some(message) = error {
            error!(
                "unsubscribe {instrument_id} failed on connection {}: {message}",
                self.config.connection_id
            );
            self.record_error();
            return;
        }

        if let Some(events) = self.events() {
            events.on_unsubscription_success(&self.config.connection_id, instrument_id);
        }
    }

    fn on_depth_market_data(&self, md: &DepthMarketData) {
        self.last_heartbeat
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.update_quality();

        let display = self.catalogue.display(&md.instrument_id);
        let (quote, timestamp_ms) = build_quote(md, &display);

        if let Some(sink) = &self.sink {
            sink.store(&md.instrument_id, &quote.to_string(), timestamp_ms);
        }

        if let Some(events) = self.events() {
            events.on_market_data(&self.config.connection_id, &md.instrument_id, quote);
        }
    }

    fn on_error(&self, message: &str) {
        error!(
            "upstream error on connection {}: {message}",
            self.config.connection_id
        );
        self.record_error();
    }
}
