//! Relay routes: signaling WebSockets, status, and management.
//!
//! 1. A publisher connects to `/ws/receiver`, a viewer to `/ws/sender`
//! 2. Each socket is handed to its endpoint as a signaling connection
//! 3. `/api/status` reports whether media is flowing end to end

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use camrelay_common::error::{ApiError, ApiResult};
use camrelay_relay::{MediaEndpoint, RelayStats, RelayStatus, SignalingConnection, SignalingError};
use futures_util::{SinkExt, StreamExt, future};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

/// Which endpoint a signaling socket belongs to.
#[derive(Debug, Clone, Copy)]
enum Side {
    Receiver,
    Sender,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Receiver => f.write_str("receiver"),
            Side::Sender => f.write_str("sender"),
        }
    }
}

/// Public relay routes. The receiver socket is only mounted when the
/// receiver negotiates over WebRTC.
pub fn router(receiver_signaling: bool) -> Router<Arc<AppState>> {
    let router = Router::new()
        .route("/ws/sender", get(sender_ws))
        .route("/api/status", get(status).options(preflight));

    if receiver_signaling {
        router.route("/ws/receiver", get(receiver_ws))
    } else {
        router
    }
}

/// Management routes; mounted behind the auth middleware.
pub fn protected_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/stats", get(stats))
        .route("/relay/start", post(start))
}

async fn receiver_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| serve_signaling(socket, state, Side::Receiver))
}

async fn sender_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| serve_signaling(socket, state, Side::Sender))
}

/// Run one endpoint's signaling loop over an upgraded socket.
async fn serve_signaling(socket: WebSocket, state: Arc<AppState>, side: Side) {
    tracing::debug!(endpoint = %side, "Signaling WebSocket connected");

    let conn = into_connection(socket);
    let result = match side {
        Side::Receiver => state.relay.receiver().handle_signaling_connection(conn).await,
        Side::Sender => state.relay.sender().handle_signaling_connection(conn).await,
    };

    match result {
        Ok(()) => tracing::debug!(endpoint = %side, "Signaling WebSocket finished"),
        Err(e) => tracing::warn!(endpoint = %side, error = %e, "Signaling WebSocket ended with error"),
    }
}

/// Adapt an axum WebSocket into a text-only signaling connection.
fn into_connection(socket: WebSocket) -> SignalingConnection {
    let (sink, stream) = socket.split();

    let inbound = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            // Control frames are handled by axum; binary is not part of the protocol.
            Ok(_) => None,
            Err(e) => Some(Err(SignalingError::Transport(e.to_string()))),
        })
    });

    let outbound = sink
        .sink_map_err(|e| SignalingError::Transport(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, SignalingError>(Message::Text(text.into()))));

    SignalingConnection::new(inbound, outbound)
}

/// GET /api/status
async fn status(State(state): State<Arc<AppState>>) -> Json<RelayStatus> {
    Json(state.relay.status())
}

/// OPTIONS /api/status
///
/// Bare pre-flight; CORS headers come from the router's CORS layer.
async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// GET /api/stats
async fn stats(State(state): State<Arc<AppState>>) -> Json<RelayStats> {
    Json(state.relay.stats())
}

#[derive(Serialize)]
struct StartResponse {
    message: &'static str,
    status: RelayStatus,
}

/// POST /relay/start
///
/// Start both endpoints. Safe to repeat.
async fn start(State(state): State<Arc<AppState>>) -> ApiResult<Json<StartResponse>> {
    state
        .relay
        .start()
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("{e}")))?;

    Ok(Json(StartResponse {
        message: "Relay started",
        status: state.relay.status(),
    }))
}
