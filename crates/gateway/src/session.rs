//! Client session state and registry.

use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

pub type SessionId = Uuid;

/// State for one connected client.
///
/// Outbound frames go through the unbounded channel; a single writer task
/// drains it, so frames reach the socket in enqueue order.
pub struct ClientSession {
    pub id: SessionId,
    pub tx: mpsc::UnboundedSender<Message>,
    /// Raw instruments this session asked for.
    pub subscriptions: DashSet<String>,
    pub connected_at: i64,
}

impl ClientSession {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            subscriptions: DashSet::new(),
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Queue a JSON frame for delivery.
    pub fn send_json(&self, frame: &Value) -> Result<()> {
        self.send_text(frame.to_string())
    }

    /// Queue an already-serialized frame for delivery.
    pub fn send_text(&self, frame: String) -> Result<()> {
        self.tx
            .send(Message::Text(frame.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    pub fn is_subscribed(&self, instrument_id: &str) -> bool {
        self.subscriptions.contains(instrument_id)
    }

    /// Subscribed raw instruments, sorted for stable frame layout.
    pub fn sorted_subscriptions(&self) -> Vec<String> {
        let mut instruments: Vec<String> =
            self.subscriptions.iter().map(|e| e.clone()).collect();
        instruments.sort();
        instruments
    }
}

/// Registry of connected sessions with a per-instrument reverse index.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<ClientSession>>,
    /// Raw instrument → sessions that requested it.
    subscribers: DashMap<String, DashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    pub fn register(&self, session: Arc<ClientSession>) -> SessionId {
        let id = session.id;
        self.sessions.insert(id, session);
        info!("session {id} registered");
        id
    }

    /// Drop a session and scrub it from the reverse index.
    pub fn unregister(&self, session_id: &SessionId) -> Option<Arc<ClientSession>> {
        let (_, session) = self.sessions.remove(session_id)?;
        for instrument in session.subscriptions.iter() {
            if let Some(subscribers) = self.subscribers.get(&*instrument) {
                subscribers.remove(session_id);
            }
        }
        info!("session {session_id} unregistered");
        Some(session)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(session_id).map(|e| e.clone())
    }

    /// Record a subscription on both sides of the index.
    pub fn subscribe(&self, session: &Arc<ClientSession>, instrument_id: &str) {
        session.subscriptions.insert(instrument_id.to_string());
        self.subscribers
            .entry(instrument_id.to_string())
            .or_default()
            .insert(session.id);
        debug!("session {} subscribed {instrument_id}", session.id);
    }

    pub fn unsubscribe(&self, session: &Arc<ClientSession>, instrument_id: &str) {
        session.subscriptions.remove(instrument_id);
        if let Some(subscribers) = self.subscribers.get(instrument_id) {
            subscribers.remove(&session.id);
        }
        debug!("session {} unsubscribed {instrument_id}", session.id);
    }

    /// Sessions whose subscription set contains `instrument_id`.
    pub fn subscribers_of(&self, instrument_id: &str) -> Vec<SessionId> {
        self.subscribers
            .get(instrument_id)
            .map(|set| set.iter().map(|id| *id).collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Distinct instruments with at least one subscriber entry.
    pub fn instrument_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
