//! Last-quote-per-instrument cache with pending-peek wakeup.

use std::sync::{Mutex, Weak};

use dashmap::DashMap;
use serde_json::Value;

/// Notified after the cache takes a new quote for an instrument, so any
/// peek parked on that instrument can be re-evaluated.
pub trait QuoteListener: Send + Sync {
    fn on_quote_update(&self, instrument_id: &str);
}

/// Latest quote per raw instrument. Unbounded in instrument count,
/// exactly one entry per instrument.
#[derive(Default)]
pub struct QuoteCache {
    quotes: DashMap<String, Value>,
    listener: Mutex<Option<Weak<dyn QuoteListener>>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the wakeup target. Held weak so teardown order stays free.
    pub fn set_listener(&self, listener: Weak<dyn QuoteListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Replace the latest quote for `instrument_id` and wake any parked
    /// peek that cares about it.
    pub fn update(&self, instrument_id: &str, quote: Value) {
        self.quotes.insert(instrument_id.to_string(), quote);

        let listener = self
            .listener
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_quote_update(instrument_id);
        }
    }

    /// Latest quote seen for `instrument_id`, if any.
    pub fn snapshot(&self, instrument_id: &str) -> Option<Value> {
        self.quotes.get(instrument_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, instrument_id: &str) -> bool {
        self.quotes.contains_key(instrument_id)
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        updates: Mutex<Vec<String>>,
    }

    impl QuoteListener for RecordingListener {
        fn on_quote_update(&self, instrument_id: &str) {
            self.updates.lock().unwrap().push(instrument_id.to_string());
        }
    }

    #[test]
    fn update_replaces_and_notifies() {
        let cache = QuoteCache::new();
        let listener = Arc::new(RecordingListener::default());
        let listener_dyn: Arc<dyn QuoteListener> = listener.clone();
        cache.set_listener(Arc::downgrade(&listener_dyn));

        cache.update("cu2501", json!({"last_price": 71230.0}));
        cache.update("cu2501", json!({"last_price": 71235.0}));

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.snapshot("cu2501").unwrap()["last_price"],
            json!(71235.0)
        );
        assert_eq!(
            *listener.updates.lock().unwrap(),
            vec!["cu2501".to_string(), "cu2501".to_string()]
        );
    }

    #[test]
    fn snapshot_of_unknown_instrument_is_none() {
        let cache = QuoteCache::new();
        assert!(cache.snapshot("cu2501").is_none());
        assert!(!cache.contains("cu2501"));
    }

    #[test]
    fn dropped_listener_is_ignored() {
        let cache = QuoteCache::new();
        {
            let listener = Arc::new(RecordingListener::default());
            let listener_dyn: Arc<dyn QuoteListener> = listener.clone();
            cache.set_listener(Arc::downgrade(&listener_dyn));
        }
        // Listener gone; update must not panic.
        cache.update("cu2501", json!({"last_price": 1.0}));
        assert!(cache.contains("cu2501"));
    }
}
