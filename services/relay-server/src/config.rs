use std::env;
use std::time::Duration;

/// All configuration for the relay server, loaded from environment variables.
pub struct Config {
    pub listen_addr: String,
    pub public_host: Option<String>,
    pub video_source: Option<String>,
    pub camera_transport: String,
    pub camera_res: String,
    pub camera_bitrate: String,
    pub camera_fps: String,
    pub ffmpeg_bin: String,
    pub broadcast_capacity: usize,
    pub ai_program: String,
    pub ai_args: Vec<String>,
    pub ai_restart_delay_ms: u64,
    pub ai_stop_grace_ms: u64,
    pub liveness_interval_ms: u64,
    pub ble_profiles: Option<String>,
    pub access_token: Option<String>,
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("ROVER_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            public_host: non_empty("ROVER_PUBLIC_HOST"),
            video_source: non_empty("ROVER_VIDEO_SOURCE"),
            camera_transport: env::var("ROVER_CAMERA_TRANSPORT")
                .map(|v| v.to_lowercase())
                .unwrap_or_else(|_| "udp".into()),
            camera_res: env::var("ROVER_CAMERA_RES").unwrap_or_else(|_| "640x480".into()),
            camera_bitrate: env::var("ROVER_CAMERA_BITRATE").unwrap_or_else(|_| "800k".into()),
            camera_fps: env::var("ROVER_CAMERA_FPS").unwrap_or_else(|_| "30".into()),
            ffmpeg_bin: env::var("ROVER_FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".into()),
            broadcast_capacity: parsed("ROVER_BROADCAST_CAPACITY", 64),
            ai_program: env::var("ROVER_AI_PROGRAM").unwrap_or_else(|_| "python".into()),
            ai_args: env::var("ROVER_AI_ARGS")
                .unwrap_or_else(|_| "auto_ai_server.py".into())
                .split_whitespace()
                .map(String::from)
                .collect(),
            ai_restart_delay_ms: parsed("ROVER_AI_RESTART_DELAY_MS", 1000),
            ai_stop_grace_ms: parsed("ROVER_AI_STOP_GRACE_MS", 5000),
            liveness_interval_ms: parsed("ROVER_LIVENESS_INTERVAL_MS", 20_000),
            ble_profiles: non_empty("ROVER_BLE_PROFILES"),
            access_token: non_empty("ROVER_ACCESS_TOKEN"),
        }
    }

    /// Host the controller and browsers use to reach the relay endpoint.
    pub fn relay_host(&self) -> String {
        self.public_host
            .as_deref()
            .map(rover_protocol::normalize_host)
            .unwrap_or_else(|| "localhost:3000".into())
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "ROVER_LISTEN_ADDR", "ROVER_PUBLIC_HOST", "ROVER_VIDEO_SOURCE",
        "ROVER_CAMERA_TRANSPORT", "ROVER_CAMERA_RES", "ROVER_CAMERA_BITRATE",
        "ROVER_CAMERA_FPS", "ROVER_FFMPEG_BIN", "ROVER_BROADCAST_CAPACITY",
        "ROVER_AI_PROGRAM", "ROVER_AI_ARGS", "ROVER_AI_RESTART_DELAY_MS",
        "ROVER_AI_STOP_GRACE_MS", "ROVER_LIVENESS_INTERVAL_MS", "ROVER_BLE_PROFILES",
        "ROVER_ACCESS_TOKEN",
    ];

    // Defaults and overrides share one test: the ROVER_* variables are
    // process state and separate tests would race on them.
    #[test]
    fn test_config_from_env() {
        // --- defaults ---
        for key in KEYS {
            env::remove_var(key);
        }

        let cfg = Config::from_env();
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
        assert!(cfg.public_host.is_none());
        assert!(cfg.video_source.is_none());
        assert_eq!(cfg.camera_transport, "udp");
        assert_eq!(cfg.camera_res, "640x480");
        assert_eq!(cfg.camera_bitrate, "800k");
        assert_eq!(cfg.camera_fps, "30");
        assert_eq!(cfg.ffmpeg_bin, "ffmpeg");
        assert_eq!(cfg.broadcast_capacity, 64);
        assert_eq!(cfg.ai_program, "python");
        assert_eq!(cfg.ai_args, vec!["auto_ai_server.py".to_string()]);
        assert_eq!(cfg.ai_restart_delay_ms, 1000);
        assert_eq!(cfg.ai_stop_grace_ms, 5000);
        assert_eq!(cfg.liveness_interval(), Duration::from_secs(20));
        assert!(cfg.ble_profiles.is_none());
        assert!(cfg.access_token.is_none());
        assert_eq!(cfg.relay_host(), "localhost:3000");

        // --- overrides ---
        env::set_var("ROVER_PUBLIC_HOST", "https://rover.example.net/");
        env::set_var("ROVER_CAMERA_TRANSPORT", "TCP");
        env::set_var("ROVER_AI_ARGS", "-u  pilot.py --fast");
        env::set_var("ROVER_ACCESS_TOKEN", "  ");
        let cfg = Config::from_env();
        assert_eq!(cfg.relay_host(), "rover.example.net");
        assert_eq!(cfg.camera_transport, "tcp");
        assert_eq!(cfg.ai_args, vec!["-u", "pilot.py", "--fast"]);
        assert!(cfg.access_token.is_none());

        for key in KEYS {
            env::remove_var(key);
        }
    }
}
