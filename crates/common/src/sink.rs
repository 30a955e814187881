//! Persistence seam for the tick path.

/// Destination for translated quotes, keyed by raw instrument.
///
/// Ticks arrive on driver callback threads; implementations must enqueue
/// and return rather than block on I/O. Persistence is best-effort and is
/// never on the delivery critical path.
pub trait QuoteSink: Send + Sync {
    fn store(&self, instrument_id: &str, quote_json: &str, timestamp_ms: i64);
}
