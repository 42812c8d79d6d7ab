use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rover_protocol::{normalize_host, relay_url, ProfileValidation, RemoteConfig};

/// Drive a rover over Bluetooth LE from the terminal.
#[derive(Debug, Clone, Parser)]
#[command(name = "drive-client", version)]
pub struct Cli {
    /// Base URL of the relay server
    #[arg(long, env = "ROVER_SERVER_URL", default_value = "http://localhost:3000")]
    pub server_url: String,

    /// Device name to prefer in the chooser (overrides the saved one)
    #[arg(long, env = "ROVER_DEVICE")]
    pub device: Option<String>,

    /// Where operator preferences are kept
    #[arg(long, env = "ROVER_PREFS_PATH", default_value = "rover-prefs.json")]
    pub prefs_path: PathBuf,

    /// Session token for the server's gated queries
    #[arg(long, env = "ROVER_ACCESS_TOKEN")]
    pub token: Option<String>,

    /// Drive an in-process simulated vehicle instead of a Bluetooth device
    #[arg(long)]
    pub simulate: bool,
}

/// Client for the server's configuration and validation queries.
#[derive(Clone)]
pub struct ServerApi {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl ServerApi {
    pub fn new(base: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned error status"))?
            .json()
            .await
            .with_context(|| format!("GET {url} returned malformed JSON"))
    }

    pub async fn fetch_config(&self) -> Result<RemoteConfig> {
        let mut cfg: RemoteConfig = self.get("/config").await?;
        cfg.ble_profiles
            .retain(|p| !p.service.is_empty() && !p.characteristic.is_empty());
        Ok(cfg)
    }

    pub async fn validate(&self) -> Result<ProfileValidation> {
        self.get("/ble/validate").await
    }

    /// Relay endpoint: the configured public host, else this server's host.
    pub fn relay_url(&self, remote_host: Option<&str>) -> String {
        let host = remote_host
            .map(normalize_host)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| normalize_host(&self.base));
        relay_url(&host)
    }
}
