//! Bluetooth LE backend on btleplug.
//!
//! There is no graphical chooser here: selection scans for a short window
//! and lets [`DeviceRequest::choose`] pick among what was seen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    Candidate, DeviceRequest, GattCharacteristic, GattService, LinkAdapter, LinkDevice, LinkError, LinkEvent,
    WriteMode,
};

const SCAN_WINDOW: Duration = Duration::from_secs(3);

fn transport(e: btleplug::Error) -> LinkError {
    LinkError::Transport(e.to_string())
}

pub struct BtleAdapter {
    adapter: Adapter,
}

impl BtleAdapter {
    /// First adapter reported by the platform.
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::Unavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| LinkError::Unavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Unavailable("no Bluetooth adapter found".into()))?;
        Ok(Self { adapter })
    }
}

#[async_trait]
impl LinkAdapter for BtleAdapter {
    async fn request_device(
        &self,
        request: &DeviceRequest,
    ) -> Result<Arc<dyn LinkDevice>, LinkError> {
        // Unfiltered scan; the allow-list only ranks candidates.
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(transport)?;
        tokio::time::sleep(SCAN_WINDOW).await;
        let peripherals = self.adapter.peripherals().await.map_err(transport)?;
        let _ = self.adapter.stop_scan().await;

        let mut scanned = Vec::new();
        let mut candidates = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            debug!(name = ?props.local_name, services = props.services.len(), "scanned device");
            candidates.push(Candidate {
                name: props.local_name.clone(),
                services: props.services.clone(),
            });
            scanned.push((peripheral, props.local_name));
        }

        let Some(pick) = request.choose(&candidates) else {
            return Err(LinkError::NotFound("no matching device in range".into()));
        };
        let (peripheral, name) = scanned.swap_remove(pick);
        Ok(Arc::new(BtleDevice::new(self.adapter.clone(), peripheral, name)))
    }
}

pub struct BtleDevice {
    adapter: Adapter,
    peripheral: Peripheral,
    name: Option<String>,
}

impl BtleDevice {
    fn new(adapter: Adapter, peripheral: Peripheral, name: Option<String>) -> Self {
        Self {
            adapter,
            peripheral,
            name,
        }
    }
}

#[async_trait]
impl LinkDevice for BtleDevice {
    fn id(&self) -> String {
        format!("{:?}", self.peripheral.id())
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>, LinkError> {
        let mut central_events = self.adapter.events().await.map_err(transport)?;
        self.peripheral.connect().await.map_err(transport)?;
        info!(device = ?self.name, "link established");

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.peripheral.id();
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        let _ = tx.send(LinkEvent::Disconnected);
                        break;
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn disconnect(&self) {
        if let Err(e) = self.peripheral.disconnect().await {
            debug!(error = %e, "disconnect failed");
        }
    }

    async fn services(&self) -> Result<Vec<GattService>, LinkError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(transport)?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|svc| GattService {
                uuid: svc.uuid,
                characteristics: svc
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        service: c.service_uuid,
                        write: c.properties.contains(CharPropFlags::WRITE),
                        write_without_response: c
                            .properties
                            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), LinkError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or(LinkError::NotConnected)?;
        let write_type = match mode {
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
            WriteMode::WithResponse => WriteType::WithResponse,
        };
        self.peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }
}
