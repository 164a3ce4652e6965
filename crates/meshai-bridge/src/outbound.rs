//! Outbound queue
//!
//! Serializes transmissions onto the link. Messages leave in submission
//! order with at least `min_spacing` between writes, so the radio's airtime
//! budget is respected. A failed write is retried with exponential backoff;
//! the message stays at the head of the queue while it is retried, so
//! retries never reorder a channel.
//!
//! A close request interrupts a write or backoff in progress. Every message
//! ends in exactly one of `MessageSent` or `MessageFailed`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::DeduplicationCache;
use crate::codec::{self, PacketHeader, ProtocolMessage};
use crate::config::{ClosePolicy, OutboundConfig, MAX_CHANNELS, MAX_TEXT_BYTES};
use crate::error::{MeshError, Result};
use crate::event::BridgeEvent;
use crate::orchestrator::ReplySink;
use crate::registry::{node_id_string, DeliveryState, Message, MessageId, Registry};
use crate::router::EventRouter;

/// Destination of encoded frames
#[async_trait]
pub trait FrameWriter: Send + Sync {
    /// Write one frame, returning once the link accepted it
    async fn write_frame(&self, frame: Bytes) -> Result<()>;
}

enum OutboundCommand {
    Enqueue(Message),
    Close {
        policy: ClosePolicy,
        done: oneshot::Sender<usize>,
    },
}

/// Outbound counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundStats {
    /// Messages written to the link
    pub sent: u64,
    /// Messages that failed after retries
    pub failed: u64,
    /// Write retries performed
    pub retries: u64,
    /// Messages discarded on close
    pub discarded: u64,
    /// Messages waiting to be written
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    discarded: AtomicU64,
    pending: AtomicUsize,
}

/// Handle for submitting messages to the outbound queue
#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<OutboundCommand>,
    registry: Arc<Registry>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for OutboundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundHandle")
            .field("pending", &self.counters.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl OutboundHandle {
    /// Queue a pending message
    pub fn enqueue(&self, message: Message) -> Result<MessageId> {
        let id = message.id;
        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(OutboundCommand::Enqueue(message)).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(MeshError::ChannelClosed);
        }
        Ok(id)
    }

    /// Build and queue a text message from the local node
    pub fn enqueue_text(&self, channel: u8, to: u32, text: impl Into<String>) -> Result<MessageId> {
        let text = text.into();
        if channel >= MAX_CHANNELS {
            return Err(MeshError::InvalidChannel(channel));
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(MeshError::MessageTooLarge {
                size: text.len(),
                max: MAX_TEXT_BYTES,
            });
        }
        let from = self.registry.local_node().ok_or(MeshError::NotConnected)?;

        let message = Message {
            id: self.registry.next_message_id(),
            packet_id: rand::random::<u32>() | 1,
            from,
            to,
            channel,
            payload: text.as_bytes().to_vec(),
            text,
            timestamp: Utc::now(),
            delivery: DeliveryState::Pending,
        };
        self.enqueue(message)
    }

    /// Stop the queue, discarding or flushing what is left
    ///
    /// Returns how many queued messages were discarded or flushed.
    pub async fn close(&self, policy: ClosePolicy) -> Result<usize> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(OutboundCommand::Close { policy, done })
            .map_err(|_| MeshError::ChannelClosed)?;
        rx.await.map_err(|_| MeshError::ChannelClosed)
    }

    /// Counters
    pub fn stats(&self) -> OutboundStats {
        OutboundStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }
}

impl ReplySink for OutboundHandle {
    fn send_reply(&self, channel: u8, to: u32, text: String) -> Result<MessageId> {
        self.enqueue_text(channel, to, text)
    }
}

/// The drain task behind an [`OutboundHandle`]
pub struct OutboundQueue {
    config: OutboundConfig,
    rx: mpsc::UnboundedReceiver<OutboundCommand>,
    queue: VecDeque<Message>,
    writer: Arc<dyn FrameWriter>,
    registry: Arc<Registry>,
    router: Arc<EventRouter>,
    dedup: DeduplicationCache,
    counters: Arc<Counters>,
    last_write: Option<Instant>,
}

impl OutboundQueue {
    /// Start the drain task
    pub fn spawn(
        config: OutboundConfig,
        writer: Arc<dyn FrameWriter>,
        registry: Arc<Registry>,
        router: Arc<EventRouter>,
        dedup: DeduplicationCache,
    ) -> (OutboundHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let handle = OutboundHandle {
            tx,
            registry: Arc::clone(&registry),
            counters: Arc::clone(&counters),
        };
        let queue = OutboundQueue {
            config,
            rx,
            queue: VecDeque::new(),
            writer,
            registry,
            router,
            dedup,
            counters,
            last_write: None,
        };
        (handle, tokio::spawn(queue.run()))
    }

    async fn run(mut self) {
        debug!("Outbound queue started");
        loop {
            let ready_at = self
                .last_write
                .map(|t| t + self.config.min_spacing)
                .unwrap_or_else(Instant::now);

            let interrupt = tokio::select! {
                biased;

                cmd = self.rx.recv() => match cmd {
                    Some(OutboundCommand::Enqueue(message)) => {
                        debug!(message = message.id, channel = message.channel, "Message queued");
                        self.queue.push_back(message);
                        None
                    }
                    Some(OutboundCommand::Close { policy, done }) => {
                        Some(Interrupt::Close { policy, done })
                    }
                    None => Some(Interrupt::Closed),
                },

                _ = tokio::time::sleep_until(ready_at), if !self.queue.is_empty() => {
                    match self.queue.pop_front() {
                        Some(message) => self.transmit(message, true, None).await,
                        None => None,
                    }
                }
            };

            match interrupt {
                Some(Interrupt::Close { policy, done }) => {
                    let n = self.close(policy).await;
                    let _ = done.send(n);
                    break;
                }
                Some(Interrupt::Closed) => {
                    self.close(ClosePolicy::Discard).await;
                    break;
                }
                Some(Interrupt::Deadline) | None => {}
            }
        }
        debug!("Outbound queue stopped");
    }

    /// Write one message, retrying with backoff
    ///
    /// With `listen` set, a close request stops the attempt; a `deadline`
    /// does the same. An interrupted message goes back to the head of the
    /// queue so the close policy settles it.
    async fn transmit(
        &mut self,
        mut message: Message,
        listen: bool,
        deadline: Option<Instant>,
    ) -> Option<Interrupt> {
        self.counters.pending.fetch_sub(1, Ordering::Relaxed);

        let frame = match codec::encode(&ProtocolMessage::Text {
            header: PacketHeader {
                packet_id: message.packet_id,
                ..PacketHeader::outgoing(
                    message.from,
                    message.to,
                    message.channel,
                    self.config.hop_limit,
                )
            },
            text: message.text.clone(),
        }) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(message, e.to_string());
                return None;
            }
        };

        let write_timeout = self.config.write_timeout;
        let mut attempt = 0u32;
        loop {
            self.last_write = Some(Instant::now());
            let write = tokio::time::timeout(write_timeout, self.writer.write_frame(frame.clone()));
            let commands = listen.then_some((&mut self.rx, &mut self.queue));
            let outcome = interruptible(write, commands, deadline).await;
            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(MeshError::WriteTimeout {
                    duration_ms: write_timeout.as_millis() as u64,
                }),
                Err(interrupt) => return Some(self.requeue(message, interrupt)),
            };

            match result {
                Ok(()) => break,
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff.saturating_mul(1u32 << attempt.min(16));
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message = message.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Write failed, retrying"
                    );
                    let commands = listen.then_some((&mut self.rx, &mut self.queue));
                    let waited = interruptible(tokio::time::sleep(delay), commands, deadline).await;
                    if let Err(interrupt) = waited {
                        return Some(self.requeue(message, interrupt));
                    }
                }
                Err(e) => {
                    self.fail(message, e.to_string());
                    return None;
                }
            }
        }

        message.delivery = DeliveryState::Sent;
        self.dedup.mark_sent(message.from, message.packet_id);
        if let Err(e) = self.registry.append_message(message.clone()) {
            warn!(message = message.id, error = %e, "Sent message not recorded in history");
        }
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            message = message.id,
            channel = message.channel,
            to = %node_id_string(message.to),
            "Message sent"
        );
        self.router.publish(BridgeEvent::MessageSent { message });
        None
    }

    fn requeue(&mut self, message: Message, interrupt: Interrupt) -> Interrupt {
        debug!(message = message.id, "Transmission interrupted");
        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        self.queue.push_front(message);
        interrupt
    }

    fn fail(&self, mut message: Message, reason: String) {
        warn!(message = message.id, reason = %reason, "Message failed");
        message.delivery = DeliveryState::Failed;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.router
            .publish(BridgeEvent::MessageFailed { message, reason });
    }

    fn discard_queued(&mut self, reason: &str) {
        for mut message in std::mem::take(&mut self.queue) {
            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            message.delivery = DeliveryState::Failed;
            self.router.publish(BridgeEvent::MessageFailed {
                message,
                reason: reason.to_string(),
            });
        }
    }

    async fn close(&mut self, policy: ClosePolicy) -> usize {
        // Pick up anything submitted before the close request
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                OutboundCommand::Enqueue(message) => self.queue.push_back(message),
                OutboundCommand::Close { done, .. } => {
                    let _ = done.send(0);
                }
            }
        }
        self.rx.close();

        let count = self.queue.len();
        match policy {
            ClosePolicy::Discard => self.discard_queued("discarded: session closed"),
            ClosePolicy::Flush => {
                let deadline = Instant::now() + self.config.flush_timeout;
                while let Some(message) = self.queue.pop_front() {
                    if let Some(last) = self.last_write {
                        let ready_at = last + self.config.min_spacing;
                        if ready_at >= deadline {
                            self.queue.push_front(message);
                            break;
                        }
                        tokio::time::sleep_until(ready_at).await;
                    }
                    if self.transmit(message, false, Some(deadline)).await.is_some() {
                        break;
                    }
                }
                if !self.queue.is_empty() {
                    warn!(left = self.queue.len(), "Flush timed out");
                    self.discard_queued("discarded: flush timed out");
                }
            }
        }
        if count > 0 {
            info!(count, policy = ?policy, "Outbound queue closed");
        }
        count
    }
}

/// Why a transmission stopped before it settled
enum Interrupt {
    Close {
        policy: ClosePolicy,
        done: oneshot::Sender<usize>,
    },
    Closed,
    Deadline,
}

/// Run `fut` unless a close request or the deadline comes first
///
/// Enqueues that arrive meanwhile are appended to `queue`.
async fn interruptible<F: Future>(
    fut: F,
    commands: Option<(
        &mut mpsc::UnboundedReceiver<OutboundCommand>,
        &mut VecDeque<Message>,
    )>,
    deadline: Option<Instant>,
) -> std::result::Result<F::Output, Interrupt> {
    let closing = async {
        let Some((rx, queue)) = commands else {
            return std::future::pending::<Interrupt>().await;
        };
        loop {
            match rx.recv().await {
                Some(OutboundCommand::Enqueue(message)) => queue.push_back(message),
                Some(OutboundCommand::Close { policy, done }) => {
                    return Interrupt::Close { policy, done }
                }
                None => return Interrupt::Closed,
            }
        }
    };
    let expired = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;

        output = fut => Ok(output),
        interrupt = closing => Err(interrupt),
        _ = expired => Err(Interrupt::Deadline),
    }
}
