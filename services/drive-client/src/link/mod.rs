//! Device link abstraction: operator-driven device selection, GATT discovery
//! and single-byte writes. Backends are the in-process simulated vehicle and,
//! with the `btleplug` feature, the platform Bluetooth LE stack.

#[cfg(feature = "btleplug")]
pub mod btle;
pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("bluetooth unavailable: {0}")]
    Unavailable(String),
    #[error("device selection cancelled")]
    Cancelled,
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("link transport error: {0}")]
    Transport(String),
    #[error("device not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Events a connected device reports on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithoutResponse,
    WithResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service: Uuid,
    pub write: bool,
    pub write_without_response: bool,
}

impl GattCharacteristic {
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Without-response when the characteristic supports it.
    pub fn write_mode(&self) -> WriteMode {
        if self.write_without_response {
            WriteMode::WithoutResponse
        } else {
            WriteMode::WithResponse
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// What the device chooser is asked for. With `accept_all` any device may
/// be picked; the optional services are the ones the session may touch
/// afterwards and rank devices that advertise them.
#[derive(Debug, Clone, Default)]
pub struct DeviceRequest {
    pub accept_all: bool,
    pub optional_services: Vec<Uuid>,
    pub preferred_name: Option<String>,
}

/// A device seen by the chooser: advertised name and service UUIDs.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

impl DeviceRequest {
    /// Index of the device to pick. The preferred name wins, then the first
    /// device advertising an allow-listed service, then the first device
    /// seen when every device is acceptable.
    pub fn choose(&self, candidates: &[Candidate]) -> Option<usize> {
        if let Some(want) = &self.preferred_name {
            if let Some(i) = candidates.iter().position(|c| c.name.as_ref() == Some(want)) {
                return Some(i);
            }
        }
        candidates
            .iter()
            .position(|c| c.services.iter().any(|s| self.optional_services.contains(s)))
            .or_else(|| (self.accept_all && !candidates.is_empty()).then_some(0))
    }
}

#[async_trait]
pub trait LinkAdapter: Send + Sync {
    /// Present device selection and return the chosen device, unconnected.
    async fn request_device(&self, request: &DeviceRequest)
        -> Result<Arc<dyn LinkDevice>, LinkError>;
}

#[async_trait]
pub trait LinkDevice: Send + Sync {
    fn id(&self) -> String;
    fn name(&self) -> Option<String>;

    /// Open the transport. The receiver yields `Disconnected` if the link
    /// drops without `disconnect` being called.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>, LinkError>;

    async fn disconnect(&self);

    async fn services(&self) -> Result<Vec<GattService>, LinkError>;

    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), LinkError>;
}

/// Adapter for builds without a Bluetooth backend.
pub struct Unsupported;

#[async_trait]
impl LinkAdapter for Unsupported {
    async fn request_device(
        &self,
        _request: &DeviceRequest,
    ) -> Result<Arc<dyn LinkDevice>, LinkError> {
        Err(LinkError::Unavailable(
            "built without a Bluetooth backend; run with --simulate".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(write: bool, write_without_response: bool) -> GattCharacteristic {
        GattCharacteristic {
            uuid: Uuid::nil(),
            service: Uuid::nil(),
            write,
            write_without_response,
        }
    }

    #[test]
    fn test_write_mode_prefers_without_response() {
        assert_eq!(ch(true, true).write_mode(), WriteMode::WithoutResponse);
        assert_eq!(ch(true, false).write_mode(), WriteMode::WithResponse);
        assert!(!ch(false, false).is_writable());
    }

    fn seen(name: &str, services: &[Uuid]) -> Candidate {
        Candidate {
            name: Some(name.to_string()),
            services: services.to_vec(),
        }
    }

    #[test]
    fn test_choose_ranks_candidates() {
        let wanted = Uuid::from_u128(0xfeed);
        let other = Uuid::from_u128(0xbeef);
        let scanned = vec![
            seen("headphones", &[other]),
            seen("rover", &[wanted]),
            seen("garage-rover", &[]),
        ];

        let mut req = DeviceRequest {
            accept_all: true,
            optional_services: vec![wanted],
            preferred_name: Some("garage-rover".into()),
        };
        assert_eq!(req.choose(&scanned), Some(2));

        req.preferred_name = Some("gone".into());
        assert_eq!(req.choose(&scanned), Some(1));
    }

    #[test]
    fn test_choose_accepts_unlisted_device() {
        let scanned = vec![Candidate::default(), seen("rover", &[Uuid::from_u128(1)])];
        let mut req = DeviceRequest {
            accept_all: true,
            optional_services: vec![Uuid::from_u128(0xfeed)],
            preferred_name: None,
        };
        assert_eq!(req.choose(&scanned), Some(0));

        req.accept_all = false;
        assert_eq!(req.choose(&scanned), None);
        assert_eq!(req.choose(&[]), None);
    }

    #[tokio::test]
    async fn test_unsupported_adapter() {
        let err = Unsupported
            .request_device(&DeviceRequest::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::Unavailable(_)));
    }
}
