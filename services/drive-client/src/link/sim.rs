//! In-process vehicle standing in for the real receiver. Records every byte
//! written to it and can be told to drop the link or fail writes.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rover_protocol::Command;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use super::{
    Candidate, DeviceRequest, GattCharacteristic, GattService, LinkAdapter, LinkDevice, LinkError, LinkEvent,
    WriteMode,
};

pub const SIM_SERVICE: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
pub const SIM_CHARACTERISTIC: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);
const SIM_NAME: &str = "rover-sim";

#[derive(Default)]
struct SimState {
    services: Vec<GattService>,
    writes: Vec<(u8, WriteMode)>,
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
    connects: usize,
    connect_attempts: usize,
    fail_connects: usize,
    fail_writes: usize,
    cancel_selection: bool,
    write_latency: Duration,
}

/// Cloning shares the same vehicle.
#[derive(Clone)]
pub struct SimVehicle {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimVehicle {
    fn default() -> Self {
        Self::new(vec![GattService {
            uuid: SIM_SERVICE,
            characteristics: vec![GattCharacteristic {
                uuid: SIM_CHARACTERISTIC,
                service: SIM_SERVICE,
                write: true,
                write_without_response: true,
            }],
        }])
    }
}

impl SimVehicle {
    pub fn new(services: Vec<GattService>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                services,
                ..SimState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes received so far, in arrival order.
    pub fn writes(&self) -> Vec<u8> {
        self.lock().writes.iter().map(|(b, _)| *b).collect()
    }

    pub fn write_modes(&self) -> Vec<WriteMode> {
        self.lock().writes.iter().map(|(_, m)| *m).collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Connect calls, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.lock().events.is_some()
    }

    /// Lose the link as if the vehicle went out of range.
    pub fn drop_link(&self) {
        if let Some(tx) = self.lock().events.take() {
            let _ = tx.send(LinkEvent::Disconnected);
        }
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    pub fn cancel_next_selection(&self) {
        self.lock().cancel_selection = true;
    }

    /// Time each write takes to complete.
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }
}

#[async_trait]
impl LinkDevice for SimVehicle {
    fn id(&self) -> String {
        "sim-0".to_string()
    }

    fn name(&self) -> Option<String> {
        Some(SIM_NAME.to_string())
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>, LinkError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(LinkError::Transport("vehicle out of range".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        state.connects += 1;
        Ok(rx)
    }

    async fn disconnect(&self) {
        // A requested disconnect is not reported as a link event.
        self.lock().events = None;
    }

    async fn services(&self) -> Result<Vec<GattService>, LinkError> {
        let state = self.lock();
        if state.events.is_none() {
            return Err(LinkError::NotConnected);
        }
        Ok(state.services.clone())
    }

    async fn write(
        &self,
        _characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), LinkError> {
        let latency = self.lock().write_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if state.events.is_none() {
            return Err(LinkError::NotConnected);
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(LinkError::WriteFailed("simulated write failure".into()));
        }
        for &b in data {
            state.writes.push((b, mode));
            match Command::from_byte(b) {
                Some(cmd) => info!(command = %cmd, "sim vehicle received"),
                None => info!(byte = b, "sim vehicle received unknown byte"),
            }
        }
        Ok(())
    }
}

/// Chooser that always offers the one simulated vehicle.
pub struct SimAdapter {
    vehicle: SimVehicle,
}

impl SimAdapter {
    pub fn new(vehicle: SimVehicle) -> Self {
        Self { vehicle }
    }
}

#[async_trait]
impl LinkAdapter for SimAdapter {
    async fn request_device(
        &self,
        request: &DeviceRequest,
    ) -> Result<Arc<dyn LinkDevice>, LinkError> {
        let offered = {
            let mut state = self.vehicle.lock();
            if std::mem::take(&mut state.cancel_selection) {
                return Err(LinkError::Cancelled);
            }
            Candidate {
                name: Some(SIM_NAME.to_string()),
                services: state.services.iter().map(|s| s.uuid).collect(),
            }
        };
        match request.choose(&[offered]) {
            Some(_) => Ok(Arc::new(self.vehicle.clone())),
            None => Err(LinkError::NotFound("simulated vehicle not acceptable".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drop_link_reports_disconnect() {
        let vehicle = SimVehicle::default();
        let mut events = vehicle.connect().await.unwrap();
        vehicle.drop_link();
        assert_eq!(events.recv().await, Some(LinkEvent::Disconnected));
        assert!(!vehicle.is_connected());
    }

    #[tokio::test]
    async fn test_requested_disconnect_is_silent() {
        let vehicle = SimVehicle::default();
        let mut events = vehicle.connect().await.unwrap();
        vehicle.disconnect().await;
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_chooser_respects_accept_all() {
        let adapter = SimAdapter::new(SimVehicle::new(Vec::new()));
        let mut req = DeviceRequest {
            accept_all: true,
            optional_services: vec![SIM_SERVICE],
            preferred_name: None,
        };
        assert!(adapter.request_device(&req).await.is_ok());

        req.accept_all = false;
        let err = adapter.request_device(&req).await.err().unwrap();
        assert!(matches!(err, LinkError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_write_failures_then_success() {
        let vehicle = SimVehicle::default();
        let _events = vehicle.connect().await.unwrap();
        let ch = vehicle.services().await.unwrap()[0].characteristics[0].clone();
        vehicle.fail_next_writes(1);
        assert!(vehicle.write(&ch, b"F", WriteMode::WithoutResponse).await.is_err());
        vehicle.write(&ch, b"F", WriteMode::WithoutResponse).await.unwrap();
        assert_eq!(vehicle.writes(), b"F");
    }
}
