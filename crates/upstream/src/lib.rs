//! Upstream side of the fan-out server: the broker driver SPI, per-front
//! connection sessions with their lifecycle state machine, and the
//! connection pool with its health monitor.
//!
//! The wire protocol itself lives behind [`driver::MdDriver`]; everything
//! in this crate treats it as a callback-style black box.

pub mod connection;
pub mod driver;
pub mod events;
pub mod pool;

pub use connection::{ConnectionStatus, UpstreamConnection};
pub use driver::{DriverCallbacks, DriverError, DriverFactory, MdDriver};
pub use events::DispatcherEvents;
pub use pool::ConnectionPool;
