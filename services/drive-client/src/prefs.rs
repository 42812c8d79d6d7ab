use std::path::{Path, PathBuf};

use rover_protocol::Command;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Operator preferences kept between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default = "default_speed")]
    pub speed: String,
    #[serde(default)]
    pub last_device_id: Option<String>,
    #[serde(default)]
    pub last_device_name: Option<String>,
}

fn default_speed() -> String {
    Command::SpeedMed.to_string()
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            last_device_id: None,
            last_device_name: None,
        }
    }
}

impl Preferences {
    /// Stored speed if it is a speed command, medium otherwise.
    pub fn speed_command(&self) -> Command {
        match self.speed.parse::<Command>() {
            Ok(cmd) if cmd.is_speed() => cmd,
            _ => Command::SpeedMed,
        }
    }
}

/// JSON file holding [`Preferences`]. Failures are logged, never fatal.
pub struct PrefsStore {
    path: PathBuf,
}

impl PrefsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Preferences {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no saved preferences");
                return Preferences::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable preferences");
                Preferences::default()
            }
        }
    }

    pub fn save(&self, prefs: &Preferences) {
        let result = serde_json::to_string_pretty(prefs)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to save preferences");
        }
    }
}
