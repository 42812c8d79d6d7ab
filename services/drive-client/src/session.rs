use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::link::{GattCharacteristic, LinkDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
        })
    }
}

/// The one device session. The characteristic is held exactly while the
/// status is `Connected`; fields are only changed through the transitions
/// below.
pub struct DeviceSession {
    status: LinkStatus,
    device: Option<Arc<dyn LinkDevice>>,
    characteristic: Option<GattCharacteristic>,
    reconnect_attempts: u32,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            device: None,
            characteristic: None,
            reconnect_attempts: 0,
        }
    }
}

impl DeviceSession {
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Connected
    }

    pub fn device(&self) -> Option<&Arc<dyn LinkDevice>> {
        self.device.as_ref()
    }

    pub fn service(&self) -> Option<Uuid> {
        self.characteristic.as_ref().map(|c| c.service)
    }

    pub fn characteristic(&self) -> Option<&GattCharacteristic> {
        self.characteristic.as_ref()
    }

    /// Device and characteristic to write to, while connected.
    pub fn writable(&self) -> Option<(Arc<dyn LinkDevice>, GattCharacteristic)> {
        match (&self.device, &self.characteristic) {
            (Some(d), Some(c)) if self.is_connected() => Some((Arc::clone(d), c.clone())),
            _ => None,
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub(crate) fn set_reconnect_attempts(&mut self, n: u32) {
        self.reconnect_attempts = n;
    }

    pub(crate) fn begin(&mut self) {
        self.status = LinkStatus::Connecting;
        self.characteristic = None;
    }

    pub(crate) fn attach(&mut self, device: Arc<dyn LinkDevice>) {
        self.device = Some(device);
    }

    /// Connecting → Connected. Resets the reconnect counter.
    pub(crate) fn finalize(&mut self, characteristic: GattCharacteristic) {
        self.characteristic = Some(characteristic);
        self.status = LinkStatus::Connected;
        self.reconnect_attempts = 0;
    }

    /// Back to Disconnected, handing out the device for teardown. The
    /// reconnect counter survives.
    pub(crate) fn teardown(&mut self) -> Option<Arc<dyn LinkDevice>> {
        self.status = LinkStatus::Disconnected;
        self.characteristic = None;
        self.device.take()
    }
}
