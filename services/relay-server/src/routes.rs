use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rover_protocol::{HealthReport, ProfileValidation, RemoteConfig, RELAY_PATH};

use crate::fanout::broadcast::ChunkBroadcast;
use crate::gate::SessionGate;
use crate::health::{health_handler, healthz_handler};
use crate::relay::RelayHub;
use crate::transport::websocket::{relay_ws, stream_ws};

/// Everything the HTTP and WebSocket handlers share.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub video: Arc<ChunkBroadcast>,
    pub gate: Arc<dyn SessionGate>,
    pub remote: Arc<RemoteConfig>,
    pub validation: Arc<ProfileValidation>,
    pub upstream: Arc<HealthReport>,
    pub liveness_interval: Duration,
    pub start_time: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/config", get(config_handler))
        .route("/ble/validate", get(validate_handler))
        .route("/stream", get(stream_ws))
        .route(RELAY_PATH, get(relay_ws))
        .with_state(state)
}

async fn config_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !state.gate.admits(&headers, params.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.remote.as_ref().clone()).into_response()
}

async fn validate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !state.gate.admits(&headers, params.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.validation.as_ref().clone()).into_response()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use rover_protocol::{validate_profiles, BleProfile};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::gate::TokenGate;
    use crate::health::upstream_report;
    use crate::relay::hub::tests::CountingLifecycle;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    struct TestServer {
        addr: SocketAddr,
        state: AppState,
        lifecycle: Arc<CountingLifecycle>,
    }

    async fn spawn_server(token: Option<&str>, liveness: Duration) -> TestServer {
        let lifecycle = Arc::new(CountingLifecycle::default());
        let hub = Arc::new(RelayHub::new(lifecycle.clone(), Arc::new(AtomicUsize::new(0))));
        let profiles = vec![BleProfile::new(
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b",
            "beb5483e-36e1-4688-b7f5-ea07361b26a8",
        )];
        let state = AppState {
            hub,
            video: Arc::new(ChunkBroadcast::new(16)),
            gate: Arc::new(TokenGate::new(token.map(String::from))),
            remote: Arc::new(RemoteConfig {
                remote_host: Some("rover.example.net".into()),
                ble_profiles: profiles.clone(),
            }),
            validation: Arc::new(validate_profiles(&profiles, Vec::new())),
            upstream: Arc::new(upstream_report(Some("rover.example.net"), None, "udp")),
            liveness_interval: liveness,
            start_time: Instant::now(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestServer {
            addr,
            state,
            lifecycle,
        }
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let url = format!("ws://{addr}{path}");
        let (stream, _resp) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("WebSocket connect failed");
        stream
    }

    async fn wait_for_peers(state: &AppState, n: usize) {
        for _ in 0..200 {
            if state.hub.peer_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} peers, have {}", state.hub.peer_count());
    }

    /// Next text frame within `wait`, skipping control frames.
    async fn next_text(ws: &mut Client, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, ws.next()).await {
                Ok(Some(Ok(Message::Text(t)))) => return Some(t.as_str().to_string()),
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_command_reaches_other_peer_only() {
        let server = spawn_server(None, Duration::from_secs(20)).await;
        let mut peer1 = connect(server.addr, RELAY_PATH).await;
        let mut peer2 = connect(server.addr, RELAY_PATH).await;
        wait_for_peers(&server.state, 2).await;

        peer1.send(Message::text("L")).await.unwrap();

        assert_eq!(
            next_text(&mut peer2, Duration::from_secs(2)).await.as_deref(),
            Some("L")
        );
        assert_eq!(next_text(&mut peer1, Duration::from_millis(200)).await, None);
    }

    #[tokio::test]
    async fn test_invalid_payloads_are_not_relayed() {
        let server = spawn_server(None, Duration::from_secs(20)).await;
        let mut peer1 = connect(server.addr, RELAY_PATH).await;
        let mut peer2 = connect(server.addr, RELAY_PATH).await;
        wait_for_peers(&server.state, 2).await;

        for junk in ["Z", "", "forward", "pong"] {
            peer1.send(Message::text(junk)).await.unwrap();
        }
        peer1.send(Message::text("S")).await.unwrap();

        // Per-peer order holds, so the first text to arrive must be the valid one.
        assert_eq!(
            next_text(&mut peer2, Duration::from_secs(2)).await.as_deref(),
            Some("S")
        );
    }

    #[tokio::test]
    async fn test_text_ping_answered_not_relayed() {
        let server = spawn_server(None, Duration::from_secs(20)).await;
        let mut peer1 = connect(server.addr, RELAY_PATH).await;
        let mut peer2 = connect(server.addr, RELAY_PATH).await;
        wait_for_peers(&server.state, 2).await;

        peer1.send(Message::text("ping")).await.unwrap();
        assert_eq!(
            next_text(&mut peer1, Duration::from_secs(2)).await.as_deref(),
            Some("pong")
        );
        assert_eq!(next_text(&mut peer2, Duration::from_millis(200)).await, None);
    }

    #[tokio::test]
    async fn test_peer_count_drives_lifecycle() {
        let server = spawn_server(None, Duration::from_secs(20)).await;
        let mut peer1 = connect(server.addr, RELAY_PATH).await;
        let mut peer2 = connect(server.addr, RELAY_PATH).await;
        wait_for_peers(&server.state, 2).await;
        assert_eq!(server.lifecycle.starts.load(Ordering::SeqCst), 1);

        peer1.close(None).await.unwrap();
        wait_for_peers(&server.state, 1).await;
        assert_eq!(server.lifecycle.stops.load(Ordering::SeqCst), 0);

        peer2.close(None).await.unwrap();
        wait_for_peers(&server.state, 0).await;
        assert_eq!(server.lifecycle.stops.load(Ordering::SeqCst), 1);
        assert_eq!(server.lifecycle.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_peer_is_closed() {
        let server = spawn_server(None, Duration::from_millis(50)).await;
        // Never polled, so the client never answers pings.
        let _silent = connect(server.addr, RELAY_PATH).await;
        let mut lively = connect(server.addr, RELAY_PATH).await;
        wait_for_peers(&server.state, 2).await;

        // Reading keeps the lively peer answering pings.
        let reader = tokio::spawn(async move {
            while let Some(Ok(_)) = lively.next().await {}
        });

        wait_for_peers(&server.state, 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.state.hub.peer_count(), 1);
        reader.abort();
    }

    #[tokio::test]
    async fn test_viewer_receives_binary_chunks() {
        let server = spawn_server(None, Duration::from_secs(20)).await;
        let mut viewer = connect(server.addr, "/stream").await;
        for _ in 0..200 {
            if server.state.video.viewer_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.state.video.send_chunk(Bytes::from_static(b"\x47\x40\x00"));
        let got = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match viewer.next().await {
                    Some(Ok(Message::Binary(data))) => return data.to_vec(),
                    Some(Ok(_)) => continue,
                    other => panic!("viewer stream ended: {other:?}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, b"\x47\x40\x00");
    }

    #[tokio::test]
    async fn test_gate_rejects_stream_without_token() {
        let server = spawn_server(Some("secret"), Duration::from_secs(20)).await;
        let url = format!("ws://{}/stream", server.addr);
        assert!(tokio_tungstenite::connect_async(&url).await.is_err());

        let url = format!("ws://{}/stream?token=secret", server.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.close(None).await.ok();
    }

    #[tokio::test]
    async fn test_config_and_validation_queries() {
        let server = spawn_server(None, Duration::from_secs(20)).await;
        let cfg: RemoteConfig = get_json(server.addr, "/config").await.unwrap();
        assert_eq!(cfg.remote_host.as_deref(), Some("rover.example.net"));
        assert_eq!(cfg.ble_profiles.len(), 1);

        let v: ProfileValidation = get_json(server.addr, "/ble/validate").await.unwrap();
        assert!(v.ok);
        assert!(v.profiles[0].service_valid);

        let health: serde_json::Value = get_json(server.addr, "/healthz").await.unwrap();
        assert_eq!(health["remoteHost"], true);
        assert_eq!(health["videoSource"], false);
    }

    #[tokio::test]
    async fn test_gated_queries_accept_encoded_token() {
        let server = spawn_server(Some("s3cr=t+/x"), Duration::from_secs(20)).await;

        let denied = reqwest::get(format!("http://{}/config", server.addr)).await.unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let cfg: RemoteConfig = get_json(server.addr, "/config?token=s3cr%3Dt%2B%2Fx")
            .await
            .unwrap();
        assert_eq!(cfg.ble_profiles.len(), 1);

        let v: ProfileValidation = reqwest::Client::new()
            .get(format!("http://{}/ble/validate", server.addr))
            .bearer_auth("s3cr=t+/x")
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(v.ok);
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        addr: SocketAddr,
        path: &str,
    ) -> reqwest::Result<T> {
        reqwest::get(format!("http://{addr}{path}"))
            .await?
            .error_for_status()?
            .json::<T>()
            .await
    }
}
