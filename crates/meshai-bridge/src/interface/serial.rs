//! Serial port interface for Meshtastic devices
//!
//! This module provides async serial communication with Meshtastic devices
//! using tokio-serial. Bytes are passed up unframed; a read timeout on the
//! port surfaces as [`LinkRead::Idle`].

use crate::config::{TransportKind, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};
use crate::error::{MeshError, Result};
use crate::interface::{ConnectionState, LinkRead, MeshInterface};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{error, info, trace};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial interface for Meshtastic communication
pub struct SerialInterface {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Port read timeout
    timeout: Duration,

    /// Serial stream (when connected)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Create with custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
    }
}

#[async_trait]
impl MeshInterface for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Connecting to serial port");

        if !self.port_path.exists() {
            self.state = ConnectionState::Disconnected;
            return Err(MeshError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                MeshError::OpenFailed {
                    target: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;

        info!(port = %self.port_path.display(), "Connected to Meshtastic device");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush().await;
        }
        self.state = ConnectionState::Disconnected;

        info!(port = %self.port_path.display(), "Disconnected from serial port");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    async fn read_frame(&mut self) -> Result<LinkRead> {
        let stream = self.stream.as_mut().ok_or(MeshError::Disconnected)?;

        let mut buf = [0u8; READ_BUFFER_SIZE];
        match stream.read(&mut buf).await {
            Ok(0) => {
                // EOF - device unplugged
                self.drop_stream();
                Ok(LinkRead::Closed)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                Ok(LinkRead::Data(Bytes::copy_from_slice(&buf[..n])))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(LinkRead::Idle)
            }
            Err(e) => {
                error!(error = %e, "Serial read error");
                self.drop_stream();
                Err(MeshError::ReadError(e.to_string()))
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MeshError::Disconnected)?;

        trace!(size = frame.len(), "Writing frame");
        if let Err(e) = stream.write_all(frame).await {
            error!(error = %e, "Serial write error");
            self.drop_stream();
            return Err(MeshError::WriteError(e.to_string()));
        }

        stream
            .flush()
            .await
            .map_err(|e| MeshError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .finish()
    }
}
