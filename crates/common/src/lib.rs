//! Shared foundations for the market-data fan-out server.
//!
//! Holds the pieces every service crate needs: configuration loading and
//! validation, the depth-tick record and its translation to the wire quote
//! object, the instrument catalogue, and the persistence seam the tick
//! path writes through.

pub mod config;
pub mod instruments;
pub mod quote;
pub mod sink;

pub use config::{ConfigError, ConnectionConfig, LoadBalanceStrategy, ServerConfig};
pub use instruments::{raw_symbol, InstrumentCatalogue};
pub use quote::{build_quote, is_valid_price, DepthMarketData};
pub use sink::QuoteSink;
