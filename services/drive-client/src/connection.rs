//! Device link lifecycle: selection, connect, characteristic resolution,
//! bounded reconnection and teardown.

use std::sync::Arc;
use std::time::Duration;

use rover_protocol::{advertised_services, BleProfile};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::link::{
    DeviceRequest, GattCharacteristic, GattService, LinkAdapter, LinkDevice, LinkError, LinkEvent,
};
use crate::session::DeviceSession;

pub const RECONNECT_ATTEMPTS: u32 = 3;
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),
    #[error("device selection cancelled")]
    SelectionCancelled,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl ConnectError {
    fn from_selection(e: LinkError) -> Self {
        match e {
            LinkError::Unavailable(why) => ConnectError::BluetoothUnavailable(why),
            LinkError::Cancelled => ConnectError::SelectionCancelled,
            LinkError::NotFound(why) => ConnectError::DeviceNotFound(why),
            other => ConnectError::Link(other),
        }
    }
}

pub struct ConnectionManager {
    adapter: Arc<dyn LinkAdapter>,
    profiles: Vec<BleProfile>,
    preferred_name: Option<String>,
    session: DeviceSession,
}

impl ConnectionManager {
    pub fn new(adapter: Arc<dyn LinkAdapter>, profiles: Vec<BleProfile>) -> Self {
        Self {
            adapter,
            profiles,
            preferred_name: None,
            session: DeviceSession::default(),
        }
    }

    pub fn profiles(&self) -> &[BleProfile] {
        &self.profiles
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Device name offered to the chooser as the default pick.
    pub fn set_preferred_name(&mut self, name: Option<String>) {
        self.preferred_name = name;
    }

    pub fn device_request(&self) -> DeviceRequest {
        DeviceRequest {
            accept_all: true,
            optional_services: advertised_services(&self.profiles)
                .iter()
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect(),
            preferred_name: self.preferred_name.clone(),
        }
    }

    /// Select a device, connect, and resolve a writable characteristic.
    ///
    /// Returns the device's event stream on success. Any failure tears down
    /// what was set up and leaves the session Disconnected.
    pub async fn initiate(&mut self) -> Result<mpsc::UnboundedReceiver<LinkEvent>, ConnectError> {
        if self.profiles.is_empty() {
            warn!("no BLE profiles configured, relying on characteristic discovery");
        } else {
            debug!(profiles = self.profiles.len(), "BLE profiles loaded");
        }

        self.session.begin();
        let request = self.device_request();
        let device = match self.adapter.request_device(&request).await {
            Ok(device) => device,
            Err(e) => {
                self.session.teardown();
                return Err(ConnectError::from_selection(e));
            }
        };
        self.session.attach(Arc::clone(&device));

        let device_label = device.name().unwrap_or_else(|| device.id());
        info!(device = %device_label, "connecting");
        match self.link(&device).await {
            Ok((characteristic, events)) => {
                info!(
                    device = %device_label,
                    service = %characteristic.service,
                    characteristic = %characteristic.uuid,
                    "connected"
                );
                self.session.finalize(characteristic);
                Ok(events)
            }
            Err(e) => {
                if let Some(device) = self.session.teardown() {
                    device.disconnect().await;
                }
                Err(e)
            }
        }
    }

    async fn link(
        &self,
        device: &Arc<dyn LinkDevice>,
    ) -> Result<(GattCharacteristic, mpsc::UnboundedReceiver<LinkEvent>), ConnectError> {
        let events = device.connect().await?;
        let services = device.services().await?;
        debug!(services = services.len(), "services discovered");
        let characteristic = resolve_characteristic(&services, &self.profiles).ok_or_else(|| {
            ConnectError::DeviceNotFound(
                "no writable characteristic; check the configured BLE profiles".into(),
            )
        })?;
        Ok((characteristic, events))
    }

    /// Operator-requested disconnect. Returns false when there was nothing
    /// to disconnect.
    pub async fn disconnect(&mut self) -> bool {
        if !self.session.is_connected() {
            return false;
        }
        info!("disconnecting");
        if let Some(device) = self.session.teardown() {
            device.disconnect().await;
        }
        self.session.set_reconnect_attempts(0);
        info!("disconnected");
        true
    }

    /// Link lost without being asked to. Returns the delay before the next
    /// reconnect attempt, or `None` once the attempt bound is spent (the
    /// counter is then reset and only a manual connect starts over).
    pub fn handle_unexpected_disconnect(&mut self) -> Option<Duration> {
        self.session.teardown();
        let attempts = self.session.reconnect_attempts();
        if attempts < RECONNECT_ATTEMPTS {
            self.session.set_reconnect_attempts(attempts + 1);
            info!(
                attempt = attempts + 1,
                max = RECONNECT_ATTEMPTS,
                "scheduling reconnect"
            );
            Some(RECONNECT_DELAY)
        } else {
            self.session.set_reconnect_attempts(0);
            warn!("reconnect attempts exhausted, connect manually");
            None
        }
    }
}

/// Configured profiles in order, first match wins; otherwise the first
/// characteristic that accepts writes.
pub fn resolve_characteristic(
    services: &[GattService],
    profiles: &[BleProfile],
) -> Option<GattCharacteristic> {
    for profile in profiles {
        let (Ok(svc), Ok(chr)) = (
            Uuid::parse_str(&profile.service),
            Uuid::parse_str(&profile.characteristic),
        ) else {
            continue;
        };
        debug!(service = %svc, "trying profile");
        let found = services
            .iter()
            .filter(|s| s.uuid == svc)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == chr);
        if let Some(c) = found {
            return Some(c.clone());
        }
    }

    debug!("no profile matched, scanning for a writable characteristic");
    services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.is_writable())
        .cloned()
}
