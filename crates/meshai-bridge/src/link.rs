//! Link task
//!
//! One task owns the radio link. It forwards raw inbound bytes to the
//! decoder, serves write requests from the outbound queue, and reconnects
//! with backoff when the link drops. Link errors never escape the task;
//! they surface as `ConnectionStateChanged` events.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ReconnectConfig, TransportKind};
use crate::error::{MeshError, Result};
use crate::event::BridgeEvent;
use crate::interface::{ConnectionState, LinkRead, MeshInterface};
use crate::outbound::FrameWriter;
use crate::router::EventRouter;

/// Pending write requests buffered in front of the link
const WRITE_QUEUE_DEPTH: usize = 32;

struct WriteRequest {
    frame: Bytes,
    ack: oneshot::Sender<Result<()>>,
}

/// Handle to a running link task
#[derive(Debug, Clone)]
pub struct LinkHandle {
    write_tx: mpsc::Sender<WriteRequest>,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest")
            .field("len", &self.frame.len())
            .finish()
    }
}

impl LinkHandle {
    /// Current link state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch link state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the link task to close the interface and exit
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl FrameWriter for LinkHandle {
    async fn write_frame(&self, frame: Bytes) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { frame, ack })
            .await
            .map_err(|_| MeshError::NotConnected)?;
        rx.await.map_err(|_| MeshError::NotConnected)?
    }
}

/// The task that owns a connected interface
pub struct Link {
    interface: Box<dyn MeshInterface>,
    reconnect: ReconnectConfig,
    inbound: mpsc::UnboundedSender<Bytes>,
    write_rx: mpsc::Receiver<WriteRequest>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
    router: Arc<EventRouter>,
    transport: TransportKind,
    target: String,
}

impl Link {
    /// Start the task for an interface that is already connected
    ///
    /// Raw bytes read from the link are sent to `inbound`.
    pub fn spawn(
        interface: Box<dyn MeshInterface>,
        target: String,
        reconnect: ReconnectConfig,
        inbound: mpsc::UnboundedSender<Bytes>,
        router: Arc<EventRouter>,
    ) -> (LinkHandle, JoinHandle<()>) {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let link = Link {
            transport: interface.kind(),
            interface,
            reconnect,
            inbound,
            write_rx,
            shutdown: shutdown_rx,
            state: state_tx,
            router,
            target,
        };
        let handle = LinkHandle {
            write_tx,
            shutdown: Arc::new(shutdown_tx),
            state: state_rx,
        };
        (handle, tokio::spawn(link.run()))
    }

    async fn run(mut self) {
        info!(link = %self.interface.name(), "Link task started");

        loop {
            let shutdown = &mut self.shutdown;
            let write_rx = &mut self.write_rx;
            let interface = &mut self.interface;

            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                request = write_rx.recv() => match request {
                    Some(WriteRequest { frame, ack }) => {
                        let result = self.interface.write_frame(&frame).await;
                        if let Err(e) = &result {
                            debug!(error = %e, "Link write failed");
                        }
                        let _ = ack.send(result);
                    }
                    None => break,
                },

                read = interface.read_frame() => match read {
                    Ok(LinkRead::Data(bytes)) => {
                        if self.inbound.send(bytes).is_err() {
                            debug!("Decoder gone, stopping link");
                            break;
                        }
                    }
                    Ok(LinkRead::Idle) => {}
                    Ok(LinkRead::Closed) => {
                        if !self.recover("link closed by peer".to_string()).await {
                            break;
                        }
                    }
                    Err(e) => {
                        if !self.recover(e.to_string()).await {
                            break;
                        }
                    }
                },
            }
        }

        if self.interface.is_connected() {
            if let Err(e) = self.interface.disconnect().await {
                warn!(error = %e, "Error closing link");
            }
        }
        let _ = self.state.send(ConnectionState::Disconnected);
        info!(link = %self.interface.name(), "Link task stopped");
    }

    fn set_state(&self, state: ConnectionState, reason: Option<String>) {
        let _ = self.state.send(state);
        self.router.publish(BridgeEvent::ConnectionStateChanged {
            state,
            transport: self.transport,
            target: self.target.clone(),
            reason,
        });
    }

    /// Reconnect after a link failure
    ///
    /// Returns false when the task should stop.
    async fn recover(&mut self, reason: String) -> bool {
        warn!(link = %self.interface.name(), reason = %reason, "Link lost");
        if let Err(e) = self.interface.disconnect().await {
            debug!(error = %e, "Closing failed link");
        }

        if !self.reconnect.enabled {
            self.set_state(ConnectionState::Disconnected, Some(reason));
            return false;
        }
        self.set_state(ConnectionState::Degraded, Some(reason));

        for attempt in 1..=self.reconnect.max_attempts {
            let delay = self.reconnect.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = self.shutdown.changed() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            // Writes queued while degraded are refused rather than left to time out
            self.refuse_pending_writes();

            match connect_with_timeout(&mut self.interface, self.reconnect.connect_timeout).await {
                Ok(()) => {
                    info!(link = %self.interface.name(), attempt, "Link restored");
                    self.set_state(ConnectionState::Connected, None);
                    return true;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        let err = MeshError::ReconnectExhausted {
            attempts: self.reconnect.max_attempts,
        };
        error!(link = %self.interface.name(), "{}", err);
        self.set_state(ConnectionState::Disconnected, Some(err.to_string()));
        false
    }

    fn refuse_pending_writes(&mut self) {
        while let Ok(request) = self.write_rx.try_recv() {
            let _ = request.ack.send(Err(MeshError::NotConnected));
        }
    }
}

/// Open an interface, bounded by `timeout`
pub async fn connect_with_timeout(
    interface: &mut Box<dyn MeshInterface>,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, interface.connect()).await {
        Ok(result) => result,
        Err(_) => Err(MeshError::ConnectionTimeout {
            duration_ms: timeout.as_millis() as u64,
        }),
    }
}
