use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::Json;
use rover_protocol::HealthReport;
use serde::Serialize;

use crate::routes::AppState;

/// Operational counters, read from the live hub and broadcast.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub viewers: usize,
    pub relay_peers: usize,
    pub controller_running: bool,
    pub chunks_broadcast: u64,
    pub viewer_lag_total: u64,
    pub uptime_s: u64,
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        viewers: state.video.viewer_count(),
        relay_peers: state.hub.peer_count(),
        controller_running: state.hub.lifecycle().is_running(),
        chunks_broadcast: state.video.chunks_broadcast.load(Ordering::Relaxed),
        viewer_lag_total: state.video.viewer_lag_total.load(Ordering::Relaxed),
        uptime_s: state.start_time.elapsed().as_secs(),
    })
}

/// Which upstream settings are present. Values are never echoed.
pub fn upstream_report(
    public_host: Option<&str>,
    video_source: Option<&str>,
    transport: &str,
) -> HealthReport {
    HealthReport {
        ok: true,
        remote_host: public_host.is_some(),
        video_source: video_source.is_some(),
        transport: transport.to_string(),
    }
}

pub async fn healthz_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.upstream.as_ref().clone())
}
