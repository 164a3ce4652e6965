//! Bluetooth Low Energy interface for Meshtastic device communication
//!
//! Meshtastic radios expose a GATT service with three characteristics:
//! `ToRadio` (write), `FromRadio` (read, drained until empty) and `FromNum`
//! (notify, signals that `FromRadio` has data). Frames are carried through
//! the characteristics unchanged.
//!
//! # Requirements
//!
//! Enable the `ble` feature in Cargo.toml to use this interface.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use crate::config::{TransportKind, DEFAULT_TIMEOUT_MS};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionState, LinkRead, MeshInterface};

/// Meshtastic GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
/// Host to radio
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
/// Radio to host
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);
/// New-data notification
pub const FROM_NUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

/// How often to poll discovered peripherals while scanning
const SCAN_POLL: Duration = Duration::from_millis(500);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

struct BleLink {
    peripheral: Peripheral,
    to_radio: Characteristic,
    from_radio: Characteristic,
    notifications: Notifications,
}

/// BLE interface for connecting to Meshtastic devices over Bluetooth
pub struct BleInterface {
    address: String,
    scan_timeout: Duration,
    link: Option<BleLink>,
    state: ConnectionState,
    name: String,
}

impl BleInterface {
    /// Create a new BLE interface
    ///
    /// `address` matches either the peripheral address or its advertised name.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let name = format!("ble:{}", address);
        Self {
            address,
            scan_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            link: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Set how long to scan for the device
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    fn open_failed(&self, reason: impl ToString) -> MeshError {
        MeshError::OpenFailed {
            target: self.address.clone(),
            reason: reason.to_string(),
        }
    }

    async fn find_peripheral(&self) -> Result<Peripheral> {
        let manager = Manager::new().await.map_err(|e| self.open_failed(e))?;
        let central = manager
            .adapters()
            .await
            .map_err(|e| self.open_failed(e))?
            .into_iter()
            .next()
            .ok_or_else(|| self.open_failed("no Bluetooth adapter"))?;

        central
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| self.open_failed(e))?;

        let wanted = self.address.to_lowercase();
        let deadline = tokio::time::Instant::now() + self.scan_timeout;
        let found = loop {
            let peripherals = central
                .peripherals()
                .await
                .map_err(|e| self.open_failed(e))?;
            let mut hit = None;
            for p in peripherals {
                let address = p.address().to_string().to_lowercase();
                let local_name = p
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|props| props.local_name)
                    .map(|n| n.to_lowercase());
                if address == wanted || local_name.as_deref() == Some(wanted.as_str()) {
                    hit = Some(p);
                    break;
                }
            }
            if let Some(p) = hit {
                break Some(p);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = central.stop_scan().await {
            warn!(error = %e, "Failed to stop BLE scan");
        }

        found.ok_or_else(|| MeshError::ConnectionTimeout {
            duration_ms: self.scan_timeout.as_millis() as u64,
        })
    }

    async fn open(&self, peripheral: Peripheral) -> Result<BleLink> {
        peripheral
            .connect()
            .await
            .map_err(|e| self.open_failed(e))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| self.open_failed(e))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| self.open_failed(format!("characteristic {} missing", uuid)))
        };
        let to_radio = find(TO_RADIO_UUID)?;
        let from_radio = find(FROM_RADIO_UUID)?;
        let from_num = find(FROM_NUM_UUID)?;

        peripheral
            .subscribe(&from_num)
            .await
            .map_err(|e| self.open_failed(e))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| self.open_failed(e))?;

        Ok(BleLink {
            peripheral,
            to_radio,
            from_radio,
            notifications,
        })
    }
}

#[async_trait]
impl MeshInterface for BleInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(address = %self.address, "Scanning for BLE radio");

        let result = match self.find_peripheral().await {
            Ok(peripheral) => self.open(peripheral).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.state = ConnectionState::Connected;
                info!(address = %self.address, "Connected to Meshtastic device");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.peripheral.disconnect().await {
                debug!(error = %e, "BLE disconnect failed");
            }
        }
        self.state = ConnectionState::Disconnected;
        info!(address = %self.address, "Disconnected from BLE radio");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.link.is_some()
    }

    async fn read_frame(&mut self) -> Result<LinkRead> {
        let link = self.link.as_mut().ok_or(MeshError::Disconnected)?;

        loop {
            let read = link.peripheral.read(&link.from_radio).await;
            let data = match read {
                Ok(data) => data,
                Err(e) => {
                    self.link = None;
                    self.state = ConnectionState::Disconnected;
                    return Err(MeshError::ReadError(e.to_string()));
                }
            };
            if !data.is_empty() {
                return Ok(LinkRead::Data(Bytes::from(data)));
            }

            // FromRadio drained; wait for the radio to signal more
            let signal = link.notifications.next().await;
            if signal.is_none() {
                self.link = None;
                self.state = ConnectionState::Disconnected;
                return Ok(LinkRead::Closed);
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let link = self.link.as_ref().ok_or(MeshError::Disconnected)?;
        link.peripheral
            .write(&link.to_radio, frame, WriteType::WithResponse)
            .await
            .map_err(|e| MeshError::WriteError(e.to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
    }

    #[test]
    fn test_initial_state() {
        let iface = BleInterface::new("AA:BB:CC:DD:EE:FF");
        assert!(!iface.is_connected());
        assert_eq!(iface.name(), "ble:AA:BB:CC:DD:EE:FF");
        assert_eq!(iface.kind(), TransportKind::Ble);
    }
}
