//! Interface the upstream side uses to reach the subscription authority.

use serde_json::Value;

/// Callbacks a connection (and the pool's health monitor) raises toward
/// the dispatch layer.
///
/// Split out as a trait so connections never hold a concrete handle back
/// into the dispatcher; connections keep a `Weak` reference and drop
/// events on upgrade failure during teardown.
pub trait DispatcherEvents: Send + Sync {
    /// Upstream acknowledged a subscribe.
    fn on_subscription_success(&self, connection_id: &str, instrument_id: &str);

    /// Upstream rejected a subscribe.
    fn on_subscription_failed(&self, connection_id: &str, instrument_id: &str);

    /// Upstream acknowledged an unsubscribe.
    fn on_unsubscription_success(&self, connection_id: &str, instrument_id: &str);

    /// A translated quote arrived. `connection_id` is advisory; delivery
    /// is keyed by instrument.
    fn on_market_data(&self, connection_id: &str, instrument_id: &str, quote: Value);

    /// The connection dropped or timed out; carried subscriptions need a
    /// new home.
    fn handle_connection_failure(&self, connection_id: &str);

    /// The connection logged back in; queued retries may proceed.
    fn handle_connection_recovery(&self, connection_id: &str);
}
