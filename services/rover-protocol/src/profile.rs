//! BLE service/characteristic profiles and the JSON shapes of the server's
//! configuration, validation and health queries.

use serde::{Deserialize, Serialize};

/// Generic Access service, advertised so the chooser can list more devices.
pub const GENERIC_ACCESS_SERVICE: &str = "00001800-0000-1000-8000-00805f9b34fb";
/// Generic Attribute service.
pub const GENERIC_ATTRIBUTE_SERVICE: &str = "00001801-0000-1000-8000-00805f9b34fb";

/// One `{service, characteristic}` pair the vehicle may expose for commands.
/// UUIDs are stored trimmed and lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleProfile {
    pub service: String,
    pub characteristic: String,
}

impl BleProfile {
    pub fn new(service: &str, characteristic: &str) -> Self {
        Self {
            service: service.trim().to_lowercase(),
            characteristic: characteristic.trim().to_lowercase(),
        }
    }
}

/// Response of the configuration query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub ble_profiles: Vec<BleProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    pub index: usize,
    pub service: String,
    pub characteristic: String,
    pub service_valid: bool,
    pub characteristic_valid: bool,
}

/// Response of the profile-validation query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileValidation {
    pub ok: bool,
    pub reasons: Vec<String>,
    pub profiles: Vec<ProfileReport>,
}

/// Response of the health query: which upstream settings are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ok: bool,
    pub remote_host: bool,
    pub video_source: bool,
    pub transport: String,
}

/// Canonical 128-bit textual form `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
pub fn is_uuid128(s: &str) -> bool {
    let s = s.trim();
    let groups: Vec<&str> = s.split('-').collect();
    let lens = [8, 4, 4, 4, 12];
    groups.len() == lens.len()
        && groups
            .iter()
            .zip(lens)
            .all(|(g, len)| g.len() == len && g.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Parse the raw profile list. Entries without both fields are dropped.
/// Returns the usable profiles plus any reason the input was unusable.
pub fn parse_profiles(raw: Option<&str>) -> (Vec<BleProfile>, Vec<String>) {
    let Some(raw) = raw else {
        return (Vec::new(), Vec::new());
    };
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return (Vec::new(), vec![format!("BLE profiles are not valid JSON: {e}")]),
    };
    let profiles = value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let service = entry.get("service")?.as_str()?;
                    let characteristic = entry.get("characteristic")?.as_str()?;
                    if service.trim().is_empty() || characteristic.trim().is_empty() {
                        return None;
                    }
                    Some(BleProfile::new(service, characteristic))
                })
                .collect()
        })
        .unwrap_or_default();
    (profiles, Vec::new())
}

/// Check every profile's UUIDs. `parse_reasons` are carried over from
/// [`parse_profiles`].
pub fn validate_profiles(profiles: &[BleProfile], parse_reasons: Vec<String>) -> ProfileValidation {
    let mut reasons = parse_reasons;
    if profiles.is_empty() {
        reasons.push("no BLE profiles configured".to_string());
    }

    let reports: Vec<ProfileReport> = profiles
        .iter()
        .enumerate()
        .map(|(index, p)| {
            let service_valid = is_uuid128(&p.service);
            let characteristic_valid = is_uuid128(&p.characteristic);
            if !service_valid || !characteristic_valid {
                reasons.push(format!(
                    "profile {index}: invalid UUID (service={}, characteristic={})",
                    p.service, p.characteristic
                ));
            }
            ProfileReport {
                index,
                service: p.service.clone(),
                characteristic: p.characteristic.clone(),
                service_valid,
                characteristic_valid,
            }
        })
        .collect();

    ProfileValidation {
        ok: reasons.is_empty(),
        reasons,
        profiles: reports,
    }
}

/// Services to advertise to the device chooser: every profile service plus
/// the two standard discovery services, deduplicated in order.
pub fn advertised_services(profiles: &[BleProfile]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let candidates = profiles
        .iter()
        .map(|p| p.service.as_str())
        .chain([GENERIC_ACCESS_SERVICE, GENERIC_ATTRIBUTE_SERVICE]);
    for s in candidates {
        if !out.iter().any(|o| o == s) {
            out.push(s.to_string());
        }
    }
    out
}
