use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::fanout::broadcast::ChunkBroadcast;
use crate::relay::serve_peer;
use crate::routes::AppState;

/// Upgrade for the relay endpoint. Open to any caller: the autonomous
/// controller connects here without a browser session.
pub async fn relay_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = Arc::clone(&state.hub);
    let probe_every = state.liveness_interval;
    ws.on_upgrade(move |socket| serve_peer(socket, hub, probe_every))
}

/// Upgrade for the video endpoint, behind the session gate.
pub async fn stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !state.gate.admits(&headers, params.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let video = Arc::clone(&state.video);
    ws.on_upgrade(move |socket| serve_viewer(socket, video))
}

/// Push transcoder chunks to one viewer until it disconnects.
pub async fn serve_viewer(socket: WebSocket, video: Arc<ChunkBroadcast>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut chunks, _guard) = video.subscribe();
    debug!(viewers = video.viewer_count(), "viewer connected");

    loop {
        tokio::select! {
            result = chunks.recv() => match result {
                Ok(chunk) => {
                    if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "viewer lagging, dropping chunks");
                    video.record_lag(n);
                }
                Err(RecvError::Closed) => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {} // Viewers have nothing to say
            },
        }
    }

    debug!("viewer disconnected");
}
