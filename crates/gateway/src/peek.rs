//! Peek-driven diff delivery.
//!
//! Each `peek_message` either answers immediately (empty frame, full
//! snapshot, or diff) or parks the session until a cached quote it cares
//! about changes. The last answered snapshot is kept per session in its
//! serialized form; if it fails to re-parse the engine degrades to a full
//! send rather than guessing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use common::InstrumentCatalogue;
use dispatch::{QuoteCache, QuoteListener};

use crate::json_diff::json_diff;
use crate::protocol;
use crate::session::{SessionId, SessionRegistry};

pub struct DiffDeliveryEngine {
    registry: Arc<SessionRegistry>,
    cache: Arc<QuoteCache>,
    catalogue: Arc<InstrumentCatalogue>,
    /// Session → serialized full `rtn_data` frame last delivered.
    last_sent: Mutex<HashMap<SessionId, String>>,
    /// Sessions with a parked peek.
    pending: Mutex<HashSet<SessionId>>,
}

impl DiffDeliveryEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        cache: Arc<QuoteCache>,
        catalogue: Arc<InstrumentCatalogue>,
    ) -> Self {
        Self {
            registry,
            cache,
            catalogue,
            last_sent: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Answer or park one `peek_message`. Re-entrant per session: a peek
    /// arriving while parked just re-evaluates.
    pub fn handle_peek(&self, session_id: SessionId) {
        let Some(session) = self.registry.get(&session_id) else {
            return;
        };

        let mut quotes = Map::new();
        for raw in session.sorted_subscriptions() {
            if let Some(quote) = self.cache.snapshot(&raw) {
                quotes.insert(self.catalogue.display(&raw), quote);
            }
        }

        if quotes.is_empty() {
            let _ = session.send_json(&protocol::empty_rtn_data_frame());
            return;
        }

        let full = protocol::rtn_data_frame(Value::Object(quotes));
        let full_str = full.to_string();

        let mut last_sent = self.last_sent.lock().unwrap();

        let Some(previous) = last_sent.get(&session_id) else {
            let _ = session.send_text(full_str.clone());
            last_sent.insert(session_id, full_str);
            return;
        };

        let Some(old_quotes) = extract_quotes(previous) else {
            warn!("unreadable last-sent snapshot for session {session_id}, sending full");
            let _ = session.send_text(full_str.clone());
            last_sent.insert(session_id, full_str);
            return;
        };

        let diff = json_diff(&old_quotes, &full["data"][0]["quotes"]);
        if diff.as_object().is_none_or(Map::is_empty) {
            drop(last_sent);
            self.pending.lock().unwrap().insert(session_id);
            debug!("parked peek for session {session_id} (no quote change)");
            return;
        }

        let _ = session.send_json(&protocol::rtn_data_frame(diff));
        // The cached snapshot is always the full frame, never the diff.
        last_sent.insert(session_id, full_str);
    }

    /// Re-evaluate every parked session subscribed to `instrument_id`.
    /// Sessions whose diff is still empty park again.
    pub fn wake(&self, instrument_id: &str) {
        let woken: Vec<SessionId> = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            self.registry
                .subscribers_of(instrument_id)
                .into_iter()
                .filter(|id| pending.remove(id))
                .collect()
        };

        for session_id in woken {
            debug!("waking parked session {session_id} for {instrument_id}");
            self.handle_peek(session_id);
        }
    }

    /// Session teardown: forget its snapshot and any parked peek.
    pub fn drop_session(&self, session_id: SessionId) {
        self.last_sent.lock().unwrap().remove(&session_id);
        self.pending.lock().unwrap().remove(&session_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl QuoteListener for DiffDeliveryEngine {
    fn on_quote_update(&self, instrument_id: &str) {
        self.wake(instrument_id);
    }
}

/// Pull `data[0].quotes` out of a serialized frame.
fn extract_quotes(frame: &str) -> Option<Value> {
    let doc: Value = serde_json::from_str(frame).ok()?;
    doc.get("data")?.get(0)?.get("quotes").cloned()
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::Message;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::session::ClientSession;

    use super::*;

    struct Fixture {
        engine: Arc<DiffDeliveryEngine>,
        registry: Arc<SessionRegistry>,
        cache: Arc<QuoteCache>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let cache = Arc::new(QuoteCache::new());
        let catalogue = Arc::new(InstrumentCatalogue::new());
        catalogue.register("cu2501", "SHFE.cu2501");
        catalogue.register("rb2505", "SHFE.rb2505");

        let engine = Arc::new(DiffDeliveryEngine::new(
            registry.clone(),
            cache.clone(),
            catalogue,
        ));
        let engine_dyn: Arc<dyn QuoteListener> = engine.clone();
        cache.set_listener(Arc::downgrade(&engine_dyn));

        Fixture {
            engine,
            registry,
            cache,
        }
    }

    fn connect(
        f: &Fixture,
        instruments: &[&str],
    ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new(tx));
        f.registry.register(session.clone());
        for instrument in instruments {
            f.registry.subscribe(&session, instrument);
        }
        (session, rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Value> {
        match rx.try_recv().ok()? {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    fn quote(last_price: f64, volume: i64) -> Value {
        json!({"last_price": last_price, "volume": volume, "close": "-"})
    }

    #[test]
    fn peek_without_cached_quotes_answers_empty_frame() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);

        f.engine.handle_peek(session.id);

        let frame = next_frame(&mut rx).unwrap();
        assert_eq!(frame["aid"], "rtn_data");
        assert!(frame["data"][0]["quotes"].as_object().unwrap().is_empty());
        assert_eq!(f.engine.pending_count(), 0);
    }

    #[test]
    fn first_peek_sends_full_snapshot() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);
        f.cache.update("cu2501", quote(71230.0, 10));

        f.engine.handle_peek(session.id);

        let frame = next_frame(&mut rx).unwrap();
        assert_eq!(
            frame["data"][0]["quotes"]["SHFE.cu2501"]["last_price"],
            json!(71230.0)
        );
    }

    #[test]
    fn unchanged_peek_parks_until_a_tick_arrives() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);
        f.cache.update("cu2501", quote(71230.0, 10));

        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_some());

        // Nothing changed: the peek parks and no frame goes out.
        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_none());
        assert_eq!(f.engine.pending_count(), 1);

        // A fresh tick wakes the session with a diff.
        f.cache.update("cu2501", quote(71235.0, 12));
        let frame = next_frame(&mut rx).unwrap();
        let diff = &frame["data"][0]["quotes"]["SHFE.cu2501"];
        assert_eq!(diff["last_price"], json!(71235.0));
        assert_eq!(diff["volume"], json!(12));
        assert!(diff.get("close").is_none());
        assert_eq!(f.engine.pending_count(), 0);
    }

    #[test]
    fn parked_peek_is_idempotent() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);
        f.cache.update("cu2501", quote(71230.0, 10));

        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_some());

        f.engine.handle_peek(session.id);
        f.engine.handle_peek(session.id);
        assert_eq!(f.engine.pending_count(), 1);

        f.cache.update("cu2501", quote(71231.0, 11));
        // Exactly one frame for the woken peek.
        assert!(next_frame(&mut rx).is_some());
        assert!(next_frame(&mut rx).is_none());
    }

    #[test]
    fn wake_with_still_equal_quote_parks_again() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);
        f.cache.update("cu2501", quote(71230.0, 10));

        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_some());
        f.engine.handle_peek(session.id);
        assert_eq!(f.engine.pending_count(), 1);

        // Same payload again: woken, diff empty, parked again.
        f.cache.update("cu2501", quote(71230.0, 10));
        assert!(next_frame(&mut rx).is_none());
        assert_eq!(f.engine.pending_count(), 1);
    }

    #[test]
    fn snapshot_after_diff_is_the_full_frame() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);
        f.cache.update("cu2501", quote(71230.0, 10));
        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_some());

        f.cache.update("cu2501", quote(71235.0, 12));
        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_some());

        // The stored snapshot must be the full frame, so an identical
        // re-peek has an empty diff and parks.
        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_none());
        assert_eq!(f.engine.pending_count(), 1);
    }

    #[test]
    fn corrupt_last_sent_degrades_to_full_send() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);
        f.cache.update("cu2501", quote(71230.0, 10));
        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_some());

        f.engine
            .last_sent
            .lock()
            .unwrap()
            .insert(session.id, "{broken".to_string());

        f.engine.handle_peek(session.id);
        let frame = next_frame(&mut rx).unwrap();
        assert_eq!(
            frame["data"][0]["quotes"]["SHFE.cu2501"]["last_price"],
            json!(71230.0)
        );
    }

    #[test]
    fn wake_only_touches_subscribed_sessions() {
        let f = fixture();
        let (cu_session, mut cu_rx) = connect(&f, &["cu2501"]);
        let (rb_session, mut rb_rx) = connect(&f, &["rb2505"]);
        f.cache.update("cu2501", quote(71230.0, 10));
        f.cache.update("rb2505", quote(3300.0, 5));

        f.engine.handle_peek(cu_session.id);
        f.engine.handle_peek(rb_session.id);
        assert!(next_frame(&mut cu_rx).is_some());
        assert!(next_frame(&mut rb_rx).is_some());

        f.engine.handle_peek(cu_session.id);
        f.engine.handle_peek(rb_session.id);
        assert_eq!(f.engine.pending_count(), 2);

        f.cache.update("cu2501", quote(71231.0, 11));

        assert!(next_frame(&mut cu_rx).is_some());
        assert!(next_frame(&mut rb_rx).is_none());
        assert_eq!(f.engine.pending_count(), 1);
    }

    #[test]
    fn drop_session_clears_engine_state() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501"]);
        f.cache.update("cu2501", quote(71230.0, 10));
        f.engine.handle_peek(session.id);
        assert!(next_frame(&mut rx).is_some());
        f.engine.handle_peek(session.id);
        assert_eq!(f.engine.pending_count(), 1);

        f.engine.drop_session(session.id);
        assert_eq!(f.engine.pending_count(), 0);
        assert!(f.engine.last_sent.lock().unwrap().is_empty());
    }

    #[test]
    fn multi_instrument_snapshot_keys_by_display_symbol() {
        let f = fixture();
        let (session, mut rx) = connect(&f, &["cu2501", "rb2505"]);
        f.cache.update("cu2501", quote(71230.0, 10));
        f.cache.update("rb2505", quote(3300.0, 5));

        f.engine.handle_peek(session.id);

        let frame = next_frame(&mut rx).unwrap();
        let quotes = frame["data"][0]["quotes"].as_object().unwrap();
        assert!(quotes.contains_key("SHFE.cu2501"));
        assert!(quotes.contains_key("SHFE.rb2505"));
        assert_eq!(quotes.len(), 2);
    }
}
