//! Rover drive client
//!
//! Connects to the vehicle's receiver over Bluetooth LE and sends it the
//! single-letter drive commands typed on the operator console, or those
//! arriving from the autonomous controller through the relay server.
//!
//! ## Usage
//!
//! ```bash
//! # Drive the built-in simulated vehicle
//! drive-client --simulate
//!
//! # Against a deployed server, real hardware
//! ROVER_SERVER_URL=https://rover.example.net drive-client
//! ```

mod auto_mode;
mod config;
mod connection;
mod console;
mod controls;
mod link;
mod pilot;
mod prefs;
mod queue;
mod session;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, ServerApi};
use crate::connection::ConnectionManager;
use crate::link::sim::{SimAdapter, SimVehicle};
use crate::link::LinkAdapter;
use crate::pilot::Pilot;
use crate::prefs::PrefsStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api = ServerApi::new(&cli.server_url, cli.token.clone())?;

    let remote = match api.fetch_config().await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(error = %e, "could not fetch server configuration, relying on discovery");
            Default::default()
        }
    };
    if remote.ble_profiles.is_empty() {
        warn!("server has no BLE profiles; custom services may be unreachable");
    }

    let store = PrefsStore::new(&cli.prefs_path);
    let prefs = store.load();
    if let Some(name) = &prefs.last_device_name {
        debug!(device = %name, "last device used");
    }

    let adapter = build_adapter(cli.simulate).await;
    let mut conn = ConnectionManager::new(adapter, remote.ble_profiles.clone());
    conn.set_preferred_name(cli.device.clone().or_else(|| prefs.last_device_name.clone()));

    let relay_url = api.relay_url(remote.remote_host.as_deref());
    info!(server = %cli.server_url, relay = %relay_url, "drive-client starting");

    let (tx, rx) = mpsc::unbounded_channel();
    let pilot = Pilot::new(conn, prefs, Some(store), relay_url, Some(api), tx.clone());
    tokio::spawn(console::run(tx));
    pilot.run(rx).await;
    Ok(())
}

async fn build_adapter(simulate: bool) -> Arc<dyn LinkAdapter> {
    if simulate {
        info!("using simulated vehicle");
        return Arc::new(SimAdapter::new(SimVehicle::default()));
    }
    platform_adapter().await
}

#[cfg(feature = "btleplug")]
async fn platform_adapter() -> Arc<dyn LinkAdapter> {
    match link::btle::BtleAdapter::new().await {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            // Connect attempts will report the missing stack.
            warn!(error = %e, "Bluetooth adapter unavailable");
            Arc::new(link::Unsupported)
        }
    }
}

#[cfg(not(feature = "btleplug"))]
async fn platform_adapter() -> Arc<dyn LinkAdapter> {
    Arc::new(link::Unsupported)
}
