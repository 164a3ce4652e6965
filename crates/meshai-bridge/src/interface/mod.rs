//! Link implementations for Meshtastic radios
//!
//! This module provides the physical links a session can run over:
//!
//! - [`SerialInterface`] - USB serial (requires `serial` feature)
//! - [`TcpInterface`] - TCP socket to a networked radio
//! - [`BleInterface`] - Bluetooth LE GATT (requires `ble` feature)
//!
//! Interfaces move raw bytes only. Framing and decoding happen in
//! [`crate::codec`], so every link variant feeds the same
//! [`crate::codec::FrameDecoder`].
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialInterface;

mod tcp;
pub use tcp::TcpInterface;

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::BleInterface;

use crate::config::{InterfaceConfig, TransportKind};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Device paths probed when no serial port is configured
pub const SERIAL_PORT_PATTERNS: &[&str] = &[
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
    "/dev/cu.usbserial*",
    "/dev/cu.usbmodem*",
];

/// Outcome of a single link read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRead {
    /// Raw bytes from the radio (not necessarily a whole frame)
    Data(Bytes),
    /// Nothing arrived before the link's read timeout
    Idle,
    /// The peer closed the link
    Closed,
}

/// Trait for radio links
///
/// This trait abstracts over the connection methods (serial, TCP, BLE) with
/// one capability set: connect, read, write and close. A link is owned by a
/// single task, so implementations only need to be `Send`.
///
/// `read_frame` must be cancel-safe: the link task races it against write
/// requests and shutdown, and a cancelled read must not lose bytes.
#[async_trait]
pub trait MeshInterface: Send {
    /// Open the link
    async fn connect(&mut self) -> Result<()>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read whatever bytes are available
    async fn read_frame(&mut self) -> Result<LinkRead>;

    /// Write one encoded frame
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;

    /// Which kind of link this is
    fn kind(&self) -> TransportKind;
}

/// Builds a link from configuration; replaceable for tests
pub type InterfaceFactory =
    Arc<dyn Fn(&InterfaceConfig) -> Result<Box<dyn MeshInterface>> + Send + Sync>;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Link lost, reconnecting with backoff
    Degraded,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Degraded => write!(f, "degraded"),
        }
    }
}

/// List serial devices that look like a Meshtastic radio
pub fn detect_serial_ports() -> Vec<PathBuf> {
    let mut found = Vec::new();
    for pattern in SERIAL_PORT_PATTERNS {
        let Ok(paths) = glob::glob(pattern) else {
            continue;
        };
        for path in paths.flatten() {
            debug!(port = %path.display(), "Found candidate serial port");
            found.push(path);
        }
    }
    found
}

/// Build the link described by `config` without opening it
pub fn create_interface(config: &InterfaceConfig) -> Result<Box<dyn MeshInterface>> {
    config.validate()?;

    match config {
        #[cfg(feature = "serial")]
        InterfaceConfig::Serial { port, baud_rate } => {
            let port = match port {
                Some(p) => p.clone(),
                None => detect_serial_ports().into_iter().next().ok_or_else(|| {
                    MeshError::PortNotFound("no serial device detected".to_string())
                })?,
            };
            Ok(Box::new(
                SerialInterface::new(port).with_baud_rate(*baud_rate),
            ))
        }
        #[cfg(not(feature = "serial"))]
        InterfaceConfig::Serial { .. } => Err(MeshError::InvalidConfig(
            "serial support not compiled in (enable the `serial` feature)".to_string(),
        )),
        InterfaceConfig::Tcp { host, port } => Ok(Box::new(TcpInterface::new(host.clone(), *port))),
        #[cfg(feature = "ble")]
        InterfaceConfig::Ble { address } => Ok(Box::new(BleInterface::new(address.clone()))),
        #[cfg(not(feature = "ble"))]
        InterfaceConfig::Ble { .. } => Err(MeshError::InvalidConfig(
            "BLE support not compiled in (enable the `ble` feature)".to_string(),
        )),
    }
}

/// The factory used outside tests
pub fn default_factory() -> InterfaceFactory {
    Arc::new(create_interface)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Degraded.to_string(), "degraded");
    }

    #[test]
    fn test_create_tcp_interface() {
        let iface = create_interface(&InterfaceConfig::Tcp {
            host: "10.0.0.5".to_string(),
            port: 4403,
        })
        .unwrap();
        assert_eq!(iface.kind(), TransportKind::Tcp);
        assert_eq!(iface.name(), "tcp:10.0.0.5:4403");
        assert!(!iface.is_connected());
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let err = create_interface(&InterfaceConfig::Tcp {
            host: String::new(),
            port: 4403,
        })
        .err()
        .unwrap();
        assert!(err.is_config_error());
    }
}
