//! TCP interface for networked Meshtastic radios
//!
//! Radios with WiFi or Ethernet expose the same framed stream as the serial
//! port on TCP port 4403.

use crate::config::{TransportKind, DEFAULT_TIMEOUT_MS};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace};

use super::{ConnectionState, LinkRead, MeshInterface};

const READ_BUFFER_SIZE: usize = 1024;

/// TCP interface for connecting to Meshtastic devices over network
pub struct TcpInterface {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    state: ConnectionState,
    name: String,
}

impl TcpInterface {
    /// Create a new TCP interface
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = format!("tcp:{}:{}", host, port);
        Self {
            host,
            port,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Set the connect timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl MeshInterface for TcpInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let address = self.address();
        info!(address = %address, "Connecting to radio over TCP");

        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                return Err(MeshError::OpenFailed {
                    target: address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                return Err(MeshError::ConnectionTimeout {
                    duration_ms: self.timeout.as_millis() as u64,
                });
            }
        };
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        info!(address = %address, "Connected to Meshtastic device");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "TCP shutdown failed");
            }
        }
        self.state = ConnectionState::Disconnected;
        info!(address = %self.address(), "Disconnected from radio");
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
                self.state = ConnectionState::Disconnected;
                self.stream = None;
                Ok(LinkRead::Closed)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from TCP socket");
                Ok(LinkRead::Data(Bytes::copy_from_slice(&buf[..n])))
            }
            Err(e) => {
                error!(error = %e, "TCP read error");
                self.state = ConnectionState::Disconnected;
                self.stream = None;
                Err(MeshError::ReadError(e.to_string()))
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MeshError::Disconnected)?;

        trace!(size = frame.len(), "Writing frame");
        if let Err(e) = stream.write_all(frame).await {
            error!(error = %e, "TCP write error");
            self.state = ConnectionState::Disconnected;
            self.stream = None;
            return Err(MeshError::WriteError(e.to_string()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

impl std::fmt::Debug for TcpInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpInterface")
            .field("address", &self.address())
            .field("state", &self.state)
            .finish()
    }
}
