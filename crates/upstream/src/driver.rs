//! Broker driver SPI.
//!
//! The real market-data wire protocol is an external concern; the core
//! only sees these traits. A driver owns its own threads and delivers
//! every event through [`DriverCallbacks`], so the core treats each
//! callback as entering from a foreign thread.

use std::sync::{Arc, Weak};

use thiserror::Error;

use common::DepthMarketData;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver not connected")]
    NotConnected,

    #[error("driver request rejected: {0}")]
    Rejected(String),
}

/// Requests the core sends into a driver session.
pub trait MdDriver: Send + Sync {
    /// Begin the session. Success means the request was accepted; the
    /// transport coming up is reported later via
    /// [`DriverCallbacks::on_front_connected`].
    fn connect(&self) -> Result<(), DriverError>;

    /// Send the market-data login. Market-data fronts authenticate on
    /// broker id alone; user and password travel empty.
    fn login(
        &self,
        broker_id: &str,
        user_id: &str,
        password: &str,
        request_id: i32,
    ) -> Result<(), DriverError>;

    fn subscribe(&self, instrument_id: &str) -> Result<(), DriverError>;

    fn unsubscribe(&self, instrument_id: &str) -> Result<(), DriverError>;

    /// Tear the session down and stop delivering callbacks.
    fn release(&self);
}

/// Events a driver delivers back into the core.
///
/// Implementations only do bookkeeping under their own locks and never
/// call back into the driver from inside a callback.
pub trait DriverCallbacks: Send + Sync {
    fn on_front_connected(&self);
    fn on_front_disconnected(&self, reason: i32);
    /// `None` on success, otherwise the front's error message.
    fn on_login(&self, error: Option<String>);
    fn on_subscribe_ack(&self, instrument_id: &str, error: Option<String>);
    fn on_unsubscribe_ack(&self, instrument_id: &str, error: Option<String>);
    fn on_depth_market_data(&self, md: &DepthMarketData);
    fn on_error(&self, message: &str);
}

/// Creates one driver session per connection.
pub trait DriverFactory: Send + Sync {
    fn create(
        &self,
        connection_id: &str,
        front_addr: &str,
        callbacks: Weak<dyn DriverCallbacks>,
    ) -> Result<Arc<dyn MdDriver>, DriverError>;
}

pub mod sim {
    //! In-process stand-ins for the broker driver.
    //!
    //! [`SimFeedDriver`] connects and logs in immediately and synthesises
    //! periodic depth ticks for whatever is subscribed — the dev/demo
    //! feed behind `sim://` front addresses. [`RecordingDriver`] accepts
    //! requests without acknowledging anything, so tests can drive the
    //! callback side by hand.

    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::sync::{Arc, Mutex, Weak};
    use std::time::Duration;

    use chrono::Local;
    use tracing::debug;

    use common::DepthMarketData;

    use super::{DriverCallbacks, DriverError, DriverFactory, MdDriver};

    enum SimCommand {
        Connect,
        Login,
        Subscribe(String),
        Unsubscribe(String),
        Release,
    }

    /// Driver that emits a synthetic tick per subscribed instrument on a
    /// fixed cadence. All callbacks fire on the driver's worker thread,
    /// matching the threading contract of a real driver.
    pub struct SimFeedDriver {
        tx: mpsc::Sender<SimCommand>,
    }

    impl SimFeedDriver {
        fn spawn(
            connection_id: &str,
            callbacks: Weak<dyn DriverCallbacks>,
            tick_interval: Duration,
        ) -> Self {
            let (tx, rx) = mpsc::channel();
            let connection_id = connection_id.to_string();
            std::thread::Builder::new()
                .name(format!("sim-feed-{connection_id}"))
                .spawn(move || run_worker(&connection_id, callbacks, rx, tick_interval))
                .expect("failed to spawn sim feed thread");
            Self { tx }
        }
    }

    impl MdDriver for SimFeedDriver {
        fn connect(&self) -> Result<(), DriverError> {
            self.tx
                .send(SimCommand::Connect)
                .map_err(|_| DriverError::NotConnected)
        }

        fn login(
            &self,
            _broker_id: &str,
            _user_id: &str,
            _password: &str,
            _request_id: i32,
        ) -> Result<(), DriverError> {
            self.tx
                .send(SimCommand::Login)
                .map_err(|_| DriverError::NotConnected)
        }

        fn subscribe(&self, instrument_id: &str) -> Result<(), DriverError> {
            self.tx
                .send(SimCommand::Subscribe(instrument_id.to_string()))
                .map_err(|_| DriverError::NotConnected)
        }

        fn unsubscribe(&self, instrument_id: &str) -> Result<(), DriverError> {
            self.tx
                .send(SimCommand::Unsubscribe(instrument_id.to_string()))
                .map_err(|_| DriverError::NotConnected)
        }

        fn release(&self) {
            let _ = self.tx.send(SimCommand::Release);
        }
    }

    fn run_worker(
        connection_id: &str,
        callbacks: Weak<dyn DriverCallbacks>,
        rx: mpsc::Receiver<SimCommand>,
        tick_interval: Duration,
    ) {
        let mut subscribed: BTreeMap<String, u64> = BTreeMap::new();

        loop {
            let Some(cb) = callbacks.upgrade() else {
                return;
            };

            match rx.recv_timeout(tick_interval) {
                Ok(SimCommand::Connect) => cb.on_front_connected(),
                Ok(SimCommand::Login) => cb.on_login(None),
                Ok(SimCommand::Subscribe(inst)) => {
                    subscribed.entry(inst.clone()).or_insert(0);
                    cb.on_subscribe_ack(&inst, None);
                }
                Ok(SimCommand::Unsubscribe(inst)) => {
                    subscribed.remove(&inst);
                    cb.on_unsubscribe_ack(&inst, None);
                }
                Ok(SimCommand::Release) => {
                    debug!("[{connection_id}] sim feed released");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    for (inst, seq) in subscribed.iter_mut() {
                        *seq += 1;
                        cb.on_depth_market_data(&synth_tick(inst, *seq));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn synth_tick(instrument_id: &str, seq: u64) -> DepthMarketData {
        // Stable per-symbol base so restarts replay the same price band.
        let base = 3000.0 + f64::from(
            instrument_id.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b))) % 5000,
        );
        let last = base + (seq % 60) as f64 * 0.5;
        let now = Local::now();

        DepthMarketData {
            instrument_id: instrument_id.to_string(),
            trading_day: now.format("%Y%m%d").to_string(),
            update_time: now.format("%H:%M:%S").to_string(),
            update_millisec: now.timestamp_subsec_millis() as i32,
            last_price: last,
            highest_price: base + 40.0,
            lowest_price: base - 10.0,
            open_price: base,
            pre_settlement_price: base - 5.0,
            pre_close_price: base - 4.0,
            pre_open_interest: 1000.0,
            open_interest: 1000.0 + seq as f64,
            volume: seq as i64,
            turnover: last * seq as f64,
            upper_limit_price: base * 1.1,
            lower_limit_price: base * 0.9,
            bid_prices: [last - 1.0, last - 2.0, last - 3.0, last - 4.0, last - 5.0],
            bid_volumes: [5, 4, 3, 2, 1],
            ask_prices: [last + 1.0, last + 2.0, last + 3.0, last + 4.0, last + 5.0],
            ask_volumes: [5, 4, 3, 2, 1],
            ..Default::default()
        }
    }

    /// Factory for [`SimFeedDriver`] sessions.
    pub struct SimFeedFactory {
        tick_interval: Duration,
    }

    impl SimFeedFactory {
        pub fn new(tick_interval: Duration) -> Self {
            Self { tick_interval }
        }
    }

    impl Default for SimFeedFactory {
        fn default() -> Self {
            Self::new(Duration::from_millis(500))
        }
    }

    impl DriverFactory for SimFeedFactory {
        fn create(
            &self,
            connection_id: &str,
            _front_addr: &str,
            callbacks: Weak<dyn DriverCallbacks>,
        ) -> Result<Arc<dyn MdDriver>, DriverError> {
            Ok(Arc::new(SimFeedDriver::spawn(
                connection_id,
                callbacks,
                self.tick_interval,
            )))
        }
    }

    /// Driver that records every request and never acknowledges; the test
    /// fires callbacks on the connection directly.
    #[derive(Default)]
    pub struct RecordingDriver {
        pub connects: AtomicUsize,
        pub released: AtomicBool,
        pub logins: Mutex<Vec<String>>,
        pub subscribes: Mutex<Vec<String>>,
        pub unsubscribes: Mutex<Vec<String>>,
        fail_subscribe: AtomicBool,
    }

    impl RecordingDriver {
        pub fn set_fail_subscribe(&self, fail: bool) {
            self.fail_subscribe.store(fail, Ordering::SeqCst);
        }

        pub fn subscribe_count(&self) -> usize {
            self.subscribes.lock().unwrap().len()
        }
    }

    impl MdDriver for RecordingDriver {
        fn connect(&self) -> Result<(), DriverError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn login(
            &self,
            broker_id: &str,
            _user_id: &str,
            _password: &str,
            _request_id: i32,
        ) -> Result<(), DriverError> {
            self.logins.lock().unwrap().push(broker_id.to_string());
            Ok(())
        }

        fn subscribe(&self, instrument_id: &str) -> Result<(), DriverError> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(DriverError::Rejected("subscribe refused".into()));
            }
            self.subscribes.lock().unwrap().push(instrument_id.to_string());
            Ok(())
        }

        fn unsubscribe(&self, instrument_id: &str) -> Result<(), DriverError> {
            self.unsubscribes
                .lock()
                .unwrap()
                .push(instrument_id.to_string());
            Ok(())
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Factory that hands out [`RecordingDriver`]s and keeps every handle
    /// so tests can inspect the request log afterwards.
    #[derive(Default)]
    pub struct RecordingFactory {
        drivers: Mutex<Vec<(String, Arc<RecordingDriver>)>>,
    }

    impl RecordingFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn driver(&self, connection_id: &str) -> Option<Arc<RecordingDriver>> {
            self.drivers
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| id == connection_id)
                .map(|(_, driver)| Arc::clone(driver))
        }

        /// Total subscribe requests across every driver handed out.
        pub fn total_subscribes(&self) -> usize {
            self.drivers
                .lock()
                .unwrap()
                .iter()
                .map(|(_, d)| d.subscribe_count())
                .sum()
        }
    }

    impl DriverFactory for RecordingFactory {
        fn create(
            &self,
            connection_id: &str,
            _front_addr: &str,
            _callbacks: Weak<dyn DriverCallbacks>,
        ) -> Result<Arc<dyn MdDriver>, DriverError> {
            let driver = Arc::new(RecordingDriver::default());
            self.drivers
                .lock()
                .unwrap()
                .push((connection_id.to_string(), Arc::clone(&driver)));
            Ok(driver)
        }
    }
}
