//! WebSocket transport
//!
//! Authenticates the upgrade request, registers the connection with the hub before the
//! upgrade completes, then pumps binary frames into the route dispatcher.

use crate::auth::{AdminKey, KeyStore};
use crate::server::admin;
use crate::server::connections::{ClientConnection, CloseReason};
use crate::server::hub::{extract_credential, Hub, HubError, API_KEY_PARAM};
use crate::server::router::{dispatch_frame, RequestContext};

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Shared state for HTTP and WebSocket handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub store: Arc<KeyStore>,
    pub admin_key: Option<AdminKey>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

/// Create the HTTP router: `/ws`, `/health` and the key admin routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(admin::routes())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.connection_count(),
    })
}

/// First `api_key` value in the query string, as `Url::query_pairs` would yield it
fn query_credential(pairs: &[(String, String)]) -> Option<&str> {
    pairs
        .iter()
        .find(|(name, _)| name == API_KEY_PARAM)
        .map(|(_, value)| value.as_str())
}

fn unauthorized(reason: impl fmt::Display) -> Response {
    warn!(reason = %reason, "Rejected WebSocket upgrade");
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

async fn ws_handler(
    State(state): State<AppState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(Query(pairs)) = query else {
        return unauthorized("unparseable query string");
    };

    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let secret = extract_credential(query_credential(&pairs), authorization);

    let ticket = state.hub.begin_upgrade();
    let opened = match state.hub.authenticate(secret).await {
        Ok(key_id) => state.hub.open(key_id, ticket),
        Err(e) => Err(e),
    };

    let (conn, rx) = match opened {
        Ok(opened) => opened,
        Err(HubError::ShuttingDown) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
        }
        Err(e) => return unauthorized(e),
    };

    let hub = state.hub.clone();
    let failed = (state.hub.clone(), conn.clone());

    ws.on_failed_upgrade(move |e: axum::Error| {
        let (hub, conn) = failed;
        warn!(conn_id = %conn.id, error = %e, "WebSocket upgrade failed");
        hub.close(&conn, CloseReason::Transport(e.to_string()));
    })
    .on_upgrade(move |socket| handle_socket(socket, hub, conn, rx))
}

/// Forward queued frames to `sink` until the connection closes, then send its close frame.
/// Every write is bounded by `write_timeout` so a peer that stops reading cannot pin the task.
async fn write_frames<S>(
    mut sink: S,
    conn: Arc<ClientConnection>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let sent = tokio::select! {
            _ = conn.closed() => break,
            sent = timeout(write_timeout, sink.send(Message::Binary(frame.into()))) => sent,
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                conn.close(CloseReason::Transport(e.to_string()));
                break;
            }
            Err(_) => {
                conn.close(CloseReason::Transport("write timed out".to_string()));
                break;
            }
        }
    }

    if let Some((code, reason)) = conn.close_reason().and_then(CloseReason::close_frame) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if timeout(write_timeout, sink.send(Message::Close(Some(frame)))).await.is_err() {
            debug!(conn_id = %conn.id, "Close frame not delivered in time");
        }
    }
    let _ = timeout(write_timeout, sink.close()).await;
}

async fn handle_socket(
    socket: WebSocket,
    hub: Arc<Hub>,
    conn: Arc<ClientConnection>,
    rx: mpsc::Receiver<Vec<u8>>,
) {
    let (sender, mut receiver) = socket.split();
    let conn_id = conn.id;

    info!(conn_id = %conn_id, key_id = ?conn.key_id, "WebSocket client connected");

    let send_task = tokio::spawn(write_frames(
        sender,
        conn.clone(),
        rx,
        hub.config().write_timeout,
    ));

    let router = hub.router().clone();

    loop {
        let msg = tokio::select! {
            _ = conn.closed() => break,
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => {
                let ctx = RequestContext::new(conn.clone());
                let result = tokio::select! {
                    _ = conn.closed() => break,
                    result = dispatch_frame(router.as_ref(), ctx, &data) => result,
                };

                if let Err(e) = result {
                    if e.is_framing() {
                        warn!(conn_id = %conn_id, error = %e, "Malformed frame, closing");
                        hub.close(&conn, CloseReason::MalformedFrame);
                        break;
                    }
                    warn!(conn_id = %conn_id, error = %e, "Frame handling failed");
                }
            }
            Some(Ok(Message::Text(_))) => {
                warn!(conn_id = %conn_id, "Text frame on binary protocol, closing");
                hub.close(&conn, CloseReason::MalformedFrame);
                break;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // Answered by the websocket layer
            }
            Some(Ok(Message::Close(_))) | None => {
                hub.close(&conn, CloseReason::PeerClosed);
                break;
            }
            Some(Err(e)) => {
                warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                hub.close(&conn, CloseReason::Transport(e.to_string()));
                break;
            }
        }
    }

    // No-op when revocation or shutdown got there first
    hub.close(&conn, CloseReason::PeerClosed);
    let _ = send_task.await;

    debug!(conn_id = %conn_id, reason = ?conn.close_reason(), "WebSocket client disconnected");
}
