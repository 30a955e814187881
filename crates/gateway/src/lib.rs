//! WebSocket gateway for real-time futures quote fan-out.
//!
//! This crate owns the downstream side of the server:
//! - Accepts WebSocket connections and manages per-session state
//! - Translates the `subscribe_quote` / `peek_message` protocol into
//!   dispatcher calls
//! - Delivers quote updates as diffs against each session's last-sent
//!   snapshot, parking peeks until something actually changes
//!
//! ## Data flow
//!
//! ```text
//! upstream tick
//!         ↓
//! QuoteCache.update
//!         ↓
//! DiffDeliveryEngine (wakes parked peeks, computes JSON diffs)
//!         ↓
//! ClientSession outbound queue → WebSocket
//! ```

pub mod error;
pub mod json_diff;
pub mod peek;
pub mod protocol;
pub mod session;
pub mod ws_server;

pub use error::{GatewayError, Result};
pub use peek::DiffDeliveryEngine;
pub use session::{ClientSession, SessionId, SessionRegistry};
pub use ws_server::{create_router, handle_client_text, AppState};
