//! WebSocket server handler using Axum.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use common::{raw_symbol, InstrumentCatalogue};
use dispatch::SubscriptionDispatcher;
use upstream::ConnectionPool;

use crate::error::Result;
use crate::peek::DiffDeliveryEngine;
use crate::protocol::{self, ActionRequest, ClientRequest};
use crate::session::{ClientSession, SessionRegistry};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<DiffDeliveryEngine>,
    pub dispatcher: Arc<SubscriptionDispatcher>,
    pub pool: Arc<ConnectionPool>,
    pub catalogue: Arc<InstrumentCatalogue>,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.dispatcher.statistics();
    format!(
        r#"{{"status":"ok","clients":{},"instruments":{},"active_subscriptions":{},"active_connections":{}}}"#,
        state.registry.session_count(),
        stats.total_instruments,
        stats.active_subscriptions,
        state.pool.active_count()
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = Arc::new(ClientSession::new(tx));
    let session_id = state.registry.register(session.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_sessions").set(state.registry.session_count() as f64);
    info!("session {session_id} connected");

    // Forward queued frames to the socket, one write in flight.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let _ = session.send_json(&protocol::welcome_frame(
        &session_id.to_string(),
        state.pool.active_count() > 0,
    ));

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_text(&state, &session, &text) {
                            warn!("error handling message from {session_id}: {e}");
                            let _ = session.send_json(&protocol::error_frame(&e.to_string()));
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => {
                                if let Err(e) = handle_client_text(&state, &session, &text) {
                                    warn!("error handling message from {session_id}: {e}");
                                    let _ = session.send_json(&protocol::error_frame(&e.to_string()));
                                }
                            }
                            Err(_) => {
                                let _ = session.send_json(&protocol::error_frame("Invalid JSON format"));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = session.tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("websocket error for {session_id}: {e}");
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if session.tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Teardown: subscriptions dereferenced, parked peek dropped, writer
    // drained and aborted.
    state.registry.unregister(&session_id);
    state
        .dispatcher
        .remove_all_subscriptions_for_session(&session_id.to_string());
    state.engine.drop_session(session_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_sessions").set(state.registry.session_count() as f64);
    info!("session {session_id} disconnected");
}

/// Handle one inbound text frame from a client.
pub fn handle_client_text(
    state: &Arc<AppState>,
    session: &Arc<ClientSession>,
    text: &str,
) -> Result<()> {
    match protocol::parse_request(text)? {
        ClientRequest::SubscribeQuote { ins_list } => {
            for entry in ins_list.split(',').filter(|e| !e.is_empty()) {
                let raw = raw_symbol(entry);
                state.catalogue.register(raw, entry);
                state.registry.subscribe(session, raw);
                state
                    .dispatcher
                    .add_subscription(&session.id.to_string(), raw);
            }
            counter!("gateway_subscribe_requests_total").increment(1);
            session.send_json(&protocol::subscribe_ok_frame())
        }
        ClientRequest::PeekMessage => {
            state.engine.handle_peek(session.id);
            Ok(())
        }
        ClientRequest::Action(action) => handle_action(state, session, action),
    }
}

fn handle_action(
    state: &Arc<AppState>,
    session: &Arc<ClientSession>,
    action: ActionRequest,
) -> Result<()> {
    match action {
        ActionRequest::Subscribe { instruments } => {
            for instrument in &instruments {
                state.registry.subscribe(session, instrument);
                state
                    .dispatcher
                    .add_subscription(&session.id.to_string(), instrument);
            }
            session.send_json(&protocol::action_ack_frame(
                "subscribe_response",
                session.subscriptions.len(),
            ))
        }
        ActionRequest::Unsubscribe { instruments } => {
            for instrument in &instruments {
                state.registry.unsubscribe(session, instrument);
                state
                    .dispatcher
                    .remove_subscription(&session.id.to_string(), instrument);
            }
            session.send_json(&protocol::action_ack_frame(
                "unsubscribe_response",
                session.subscriptions.len(),
            ))
        }
        ActionRequest::ListInstruments => {
            let instruments = state.catalogue.all();
            session.send_json(&protocol::instrument_list_frame(&instruments))
        }
        ActionRequest::SearchInstruments { pattern } => {
            let instruments = state.catalogue.search(&pattern);
            session.send_json(&protocol::search_result_frame(&pattern, &instruments))
        }
    }
}
