//! Connection gateway.
//!
//! Accepts and authenticates WebSocket connections, decodes inbound client
//! events, dispatches them to the engine and drains the per-connection
//! outbound channel back to the client. Every inbound handler is bound once
//! per connection; dispatch looks up current subscription state at handling
//! time.

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use banter_core::{CoreError, Engine, MemoryStore, SendRequest, StoreAdapter};
use banter_protocol::codec;
use banter_protocol::events::{ClientEvent, ServerEvent};
use banter_protocol::model::Identity;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The coordination engine.
    pub engine: Engine,
    /// Token-to-identity verifier.
    pub verifier: Box<dyn TokenVerifier>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn StoreAdapter>,
        verifier: Box<dyn TokenVerifier>,
    ) -> Self {
        Self {
            engine: Engine::with_config(store, config.engine_config()),
            verifier,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, verifier: Box<dyn TokenVerifier>) -> Result<()> {
    let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::new());
    let state = Arc::new(AppState::new(config.clone(), store, verifier));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.gateway.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Banter server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.gateway.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
///
/// The opaque token travels in the query string; the connection is refused
/// before any registry entry exists when it is missing or rejected.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = params
        .get("token")
        .and_then(|token| state.verifier.verify(token));

    match identity {
        Some(identity) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, identity))
            .into_response(),
        None => {
            metrics::record_error("auth");
            warn!("Connection refused: missing or invalid token");
            (StatusCode::UNAUTHORIZED, "missing or invalid token").into_response()
        }
    }
}

/// Handle an authenticated WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Generate connection ID
    let connection_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    debug!(connection = %connection_id, user = %identity.id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // The per-connection outbound channel. The engine holds the sending
    // half; this task drains it towards the client.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();

    state
        .engine
        .connect(identity.clone(), connection_id.clone(), events_tx.clone())
        .await;
    metrics::set_users_online(state.engine.stats().online_users);

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Event processing loop
    'conn: loop {
        tokio::select! {
            biased;

            // Drain engine events towards the client
            Some(event) = events_rx.recv() => {
                match codec::encode(&event) {
                    Ok(data) => {
                        metrics::record_event(data.len(), "outbound");
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break 'conn;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Outbound encode failed");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    metrics::record_event(data.len(), "inbound");
                                    if let Err(e) = dispatch(event, &connection_id, &state).await {
                                        warn!(connection = %connection_id, error = %e, "Request failed");
                                        metrics::record_error("request");
                                        let _ = events_tx.send(ServerEvent::error(e.code(), e.to_string()));
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Protocol error");
                                    metrics::record_error("protocol");
                                    break 'conn;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break 'conn;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break 'conn;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break 'conn;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break 'conn;
                    }
                }
            }
        }
    }

    // Cleanup: presence, typing and room state for this connection
    state.engine.disconnect(&connection_id).await;

    let stats = state.engine.stats();
    metrics::set_users_online(stats.online_users);
    metrics::set_rooms_active(stats.active_rooms);

    debug!(connection = %connection_id, user = %identity.id, "WebSocket disconnected");
}

/// Dispatch a decoded client event to the engine.
///
/// Errors surface only to the requesting connection as an error event.
async fn dispatch(
    event: ClientEvent,
    connection_id: &str,
    state: &Arc<AppState>,
) -> Result<(), CoreError> {
    match event {
        ClientEvent::Join { room } => state.engine.join_room(connection_id, &room).await,

        ClientEvent::Leave { room } => state.engine.leave_room(connection_id, &room).await,

        ClientEvent::Send {
            content,
            kind,
            room,
            recipient,
            file,
        } => {
            if content.len() > state.config.limits.max_message_size {
                return Err(CoreError::Validation("message content exceeds size limit"));
            }
            state
                .engine
                .send_message(
                    connection_id,
                    SendRequest {
                        content,
                        kind,
                        room,
                        recipient,
                        file,
                    },
                )
                .await?;
            metrics::record_message_routed();
            metrics::set_rooms_active(state.engine.stats().active_rooms);
            Ok(())
        }

        ClientEvent::Typing { target } => state.engine.start_typing(connection_id, &target),

        ClientEvent::StopTyping { target } => state.engine.stop_typing(connection_id, &target),

        // The broadcast scope is derived from the stored message, not from
        // the client's claim.
        ClientEvent::MarkRead { message_id, .. } => {
            state.engine.mark_read(connection_id, message_id).await
        }

        ClientEvent::AddReaction {
            message_id, kind, ..
        } => {
            state
                .engine
                .add_reaction(connection_id, message_id, kind)
                .await
        }

        ClientEvent::Search { query, target } => {
            state.engine.search(connection_id, &target, &query).await
        }

        ClientEvent::LoadOlder { target, before } => {
            state
                .engine
                .load_older(connection_id, &target, before)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DevTokenVerifier;
    use banter_protocol::model::MessageKind;
    use tokio::sync::mpsc::unbounded_channel;

    fn state() -> Arc<AppState> {
        let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::new());
        Arc::new(AppState::new(
            Config::default(),
            store,
            Box::new(DevTokenVerifier),
        ))
    }

    #[tokio::test]
    async fn test_dispatch_rejects_oversized_content() {
        let state = state();
        let (tx, _rx) = unbounded_channel();
        state
            .engine
            .connect(Identity::new("u1", "Alice"), "conn-1".into(), tx)
            .await;

        let event = ClientEvent::Send {
            content: "x".repeat(state.config.limits.max_message_size + 1),
            kind: MessageKind::Text,
            room: Some("general".into()),
            recipient: None,
            file: None,
        };
        let result = dispatch(event, "conn-1", &state).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_connection() {
        let state = state();
        let event = ClientEvent::Join {
            room: "general".into(),
        };
        let result = dispatch(event, "conn-missing", &state).await;
        assert!(matches!(result, Err(CoreError::Auth(_))));
    }
}
