//! Rover relay server
//!
//! Serves the operator console's backing endpoints: a WebSocket relay that
//! forwards single-letter drive commands between peers, a transcoded camera
//! stream, and the BLE profile configuration. The autonomous controller is
//! started while at least one relay peer is connected.
//!
//! ## Usage
//!
//! ```bash
//! ROVER_VIDEO_SOURCE=rtsp://cam.local/stream1 \
//! ROVER_BLE_PROFILES='[{"service":"...","characteristic":"..."}]' \
//! relay-server
//! ```

mod config;
mod fanout;
mod gate;
mod health;
mod relay;
mod routes;
mod supervisor;
mod transcoder;
mod transport;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rover_protocol::{parse_profiles, relay_url, validate_profiles, RemoteConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::fanout::broadcast::ChunkBroadcast;
use crate::gate::TokenGate;
use crate::relay::RelayHub;
use crate::routes::AppState;
use crate::supervisor::{AiSupervisor, SupervisorConfig};
use crate::transcoder::{Transcoder, VideoSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    let (profiles, parse_reasons) = parse_profiles(config.ble_profiles.as_deref());
    let validation = validate_profiles(&profiles, parse_reasons);
    if !validation.ok {
        for reason in &validation.reasons {
            warn!(reason = %reason, "BLE profile problem");
        }
    }

    let relay_host = config.relay_host();
    let mut controller_env = vec![("ROVER_RELAY_URL".to_string(), relay_url(&relay_host))];
    if let Some(host) = &config.public_host {
        controller_env.push(("ROVER_PUBLIC_HOST".to_string(), host.clone()));
    }
    if let Some(source) = &config.video_source {
        controller_env.push(("ROVER_VIDEO_SOURCE".to_string(), source.clone()));
    }

    let peers = Arc::new(AtomicUsize::new(0));
    let supervisor = AiSupervisor::new(
        SupervisorConfig {
            program: config.ai_program.clone(),
            args: config.ai_args.clone(),
            env: controller_env,
            restart_delay: Duration::from_millis(config.ai_restart_delay_ms),
            stop_grace: Duration::from_millis(config.ai_stop_grace_ms),
        },
        Arc::clone(&peers),
    );
    let hub = Arc::new(RelayHub::new(Arc::new(supervisor.clone()), peers));
    let video = Arc::new(ChunkBroadcast::new(config.broadcast_capacity));

    let transcoder = match VideoSettings::from_config(&config) {
        Ok(settings) => {
            match Transcoder::spawn(&config.ffmpeg_bin, &settings.ffmpeg_args(), Arc::clone(&video))
            {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(error = %e, "video stream unavailable");
                    None
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "video stream disabled");
            None
        }
    };

    let state = AppState {
        hub,
        video,
        gate: Arc::new(TokenGate::new(config.access_token.clone())),
        remote: Arc::new(RemoteConfig {
            remote_host: config.public_host.clone(),
            ble_profiles: profiles,
        }),
        validation: Arc::new(validation),
        upstream: Arc::new(health::upstream_report(
            config.public_host.as_deref(),
            config.video_source.as_deref(),
            &config.camera_transport,
        )),
        liveness_interval: config.liveness_interval(),
        start_time: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, relay = %relay_url(&relay_host), "relay-server listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    supervisor.shutdown().await;
    if let Some(t) = transcoder {
        t.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
