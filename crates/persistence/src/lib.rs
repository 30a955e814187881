//! Best-effort persistence for translated quotes.
//!
//! Mirrors the latest quote per instrument into Redis and keeps a short
//! sliding history window per instrument. Never on the delivery critical
//! path: the tick threads enqueue, a single writer task does the I/O.

pub mod error;
pub mod redis_store;

pub use error::{PersistenceError, Result};
pub use redis_store::QuoteStore;
