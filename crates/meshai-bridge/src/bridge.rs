//! MeshBridge - session controller
//!
//! The controller owns at most one connection session and accepts commands
//! from the presentation layer through a cloneable [`BridgeHandle`]. A
//! session wires the components together:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Session                                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌───────────┐  bytes  ┌──────────────┐  events  ┌────────────┐   │
//! │  │ Link task │────────►│ Inbound task │─────────►│ EventRouter│   │
//! │  │ (radio)   │         │ FrameDecoder │          └────────────┘   │
//! │  └───────────┘         │ Dedup        │                           │
//! │        ▲               │ Registry     │─────┐                     │
//! │        │ frames        └──────────────┘     │ triggers            │
//! │  ┌─────┴────────┐                     ┌─────▼────────┐            │
//! │  │ Outbound     │◄────── replies ─────│ Orchestrator │            │
//! │  │ queue        │                     └──────────────┘            │
//! │  └──────────────┘                                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The event router outlives sessions, so subscribers keep their stream
//! across disconnects and reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshai_bridge::{BridgeConfigBuilder, MeshBridge};
//!
//! let (bridge, handle) = MeshBridge::with_defaults();
//! tokio::spawn(bridge.run());
//!
//! let mut events = handle.subscribe_all();
//! handle.connect(BridgeConfigBuilder::new().tcp("meshtastic.local", 4403).build()).await?;
//! handle.send_message(0, "hello mesh").await?;
//! ```

use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cache::{DeduplicationCache, PacketKey, PacketOrigin};
use crate::codec::{FrameDecoder, ProtocolMessage};
use crate::config::{
    AiConfig, BridgeConfig, ClosePolicy, RouterConfig, TransportKind, BROADCAST_ADDR,
};
use crate::error::{MeshError, Result};
use crate::event::{BridgeEvent, EventKind};
use crate::interface::{default_factory, ConnectionState, InterfaceFactory};
use crate::link::{connect_with_timeout, Link, LinkHandle};
use crate::ollama::OllamaClient;
use crate::orchestrator::{CompletionService, Orchestrator, OrchestratorStats};
use crate::outbound::{OutboundHandle, OutboundQueue, OutboundStats};
use crate::registry::{
    node_id_string, DeliveryState, Message, MessageId, Observation, Registry, RegistrySnapshot,
};
use crate::router::{EventRouter, Subscription};

/// How often stale nodes and expired dedup entries are swept
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on waiting for a session task to stop
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the completion service for a session
pub type CompletionFactory =
    Arc<dyn Fn(&AiConfig) -> Result<Arc<dyn CompletionService>> + Send + Sync>;

/// Completion factory that talks to Ollama
pub fn ollama_factory() -> CompletionFactory {
    Arc::new(|config: &AiConfig| {
        Ok(Arc::new(OllamaClient::new(config)?) as Arc<dyn CompletionService>)
    })
}

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Open a session
    Connect {
        /// Session configuration
        config: Box<BridgeConfig>,
        /// Outcome of the connect
        reply: oneshot::Sender<Result<()>>,
    },
    /// Close the active session
    Disconnect {
        /// Outcome of the disconnect
        reply: oneshot::Sender<Result<()>>,
    },
    /// Queue a text message from the local node
    SendMessage {
        /// Channel index
        channel: u8,
        /// Destination node; `None` broadcasts
        to: Option<u32>,
        /// Message text
        text: String,
        /// Id of the queued message
        reply: oneshot::Sender<Result<MessageId>>,
    },
    /// Toggle AI auto-respond on a channel
    SetAutoRespond {
        /// Channel index
        channel: u8,
        /// New flag value
        enabled: bool,
        /// Outcome of the change
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Get a copy of the registry, if a session is active
    GetSnapshot(oneshot::Sender<Option<RegistrySnapshot>>),
    /// Close any session and stop the controller
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Session state
    pub state: Option<ConnectionState>,
    /// Link kind of the active session
    pub transport: Option<TransportKind>,
    /// Frames decoded from the link
    pub frames_decoded: u64,
    /// Frames rejected by the codec
    pub codec_errors: u64,
    /// Packets suppressed as rebroadcasts
    pub duplicates_blocked: u64,
    /// Text messages received
    pub messages_received: u64,
    /// Acknowledgements matched to sent messages
    pub acks_received: u64,
    /// Known nodes
    pub nodes: usize,
    /// Outbound queue counters
    pub outbound: OutboundStats,
    /// AI orchestrator counters
    pub ai: OrchestratorStats,
    /// Events published since the bridge started
    pub events_published: u64,
    /// Events lost to slow subscribers
    pub events_dropped: u64,
}

/// Handle for controlling the MeshBridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    router: Arc<EventRouter>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("subscribers", &self.router.subscriber_count())
            .finish()
    }
}

impl BridgeHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| MeshError::ChannelClosed)?;
        rx.await.map_err(|_| MeshError::ChannelClosed)
    }

    /// Open a session with `config`
    ///
    /// The configuration is validated before any device is touched.
    pub async fn connect(&self, config: BridgeConfig) -> Result<()> {
        self.request(|reply| BridgeCommand::Connect {
            config: Box::new(config),
            reply,
        })
        .await?
    }

    /// Close the active session
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| BridgeCommand::Disconnect { reply }).await?
    }

    /// Broadcast a text message on a channel
    pub async fn send_message(&self, channel: u8, text: impl Into<String>) -> Result<MessageId> {
        let text = text.into();
        self.request(|reply| BridgeCommand::SendMessage {
            channel,
            to: None,
            text,
            reply,
        })
        .await?
    }

    /// Send a text message to one node
    pub async fn send_direct(
        &self,
        channel: u8,
        to: u32,
        text: impl Into<String>,
    ) -> Result<MessageId> {
        let text = text.into();
        self.request(|reply| BridgeCommand::SendMessage {
            channel,
            to: Some(to),
            text,
            reply,
        })
        .await?
    }

    /// Toggle AI auto-respond on a channel
    pub async fn set_auto_respond(&self, channel: u8, enabled: bool) -> Result<()> {
        self.request(|reply| BridgeCommand::SetAutoRespond {
            channel,
            enabled,
            reply,
        })
        .await?
    }

    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        self.request(BridgeCommand::GetStats).await
    }

    /// Copy of the active session's registry
    pub async fn snapshot(&self) -> Result<Option<RegistrySnapshot>> {
        self.request(BridgeCommand::GetSnapshot).await
    }

    /// Subscribe to the given event kinds
    pub fn subscribe(&self, kinds: impl IntoIterator<Item = EventKind>) -> Subscription {
        self.router.subscribe(kinds)
    }

    /// Subscribe to every event
    pub fn subscribe_all(&self) -> Subscription {
        self.router.subscribe_all()
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| MeshError::ChannelClosed)
    }
}

/// Session controller
pub struct MeshBridge {
    interfaces: InterfaceFactory,
    completions: CompletionFactory,
    router: Arc<EventRouter>,
    command_rx: mpsc::Receiver<BridgeCommand>,
    session: Option<Session>,
}

impl MeshBridge {
    /// Create a controller with injectable link and completion factories
    pub fn new(
        router: RouterConfig,
        interfaces: InterfaceFactory,
        completions: CompletionFactory,
    ) -> (Self, BridgeHandle) {
        let router = Arc::new(EventRouter::new(router));
        let (command_tx, command_rx) = mpsc::channel(256);
        let handle = BridgeHandle {
            command_tx,
            router: Arc::clone(&router),
        };

        let bridge = Self {
            interfaces,
            completions,
            router,
            command_rx,
            session: None,
        };
        (bridge, handle)
    }

    /// Controller using the real links and Ollama
    pub fn with_defaults() -> (Self, BridgeHandle) {
        Self::new(RouterConfig::default(), default_factory(), ollama_factory())
    }

    /// Run the controller until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("Bridge controller started");

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }

                _ = link_lost(&mut self.session) => {
                    if let Some(session) = self.session.take() {
                        warn!(target = %session.target, "Link lost for good, closing session");
                        session.close(&self.router, false).await;
                    }
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.close(&self.router, true).await;
        }
        self.router.close();
        info!("Bridge controller stopped");
    }

    /// Returns false when the controller should stop
    async fn handle_command(&mut self, cmd: BridgeCommand) -> bool {
        match cmd {
            BridgeCommand::Connect { config, reply } => {
                let _ = reply.send(self.connect(*config).await);
            }
            BridgeCommand::Disconnect { reply } => {
                let result = match self.session.take() {
                    Some(session) => {
                        session.close(&self.router, true).await;
                        Ok(())
                    }
                    None => Err(MeshError::NotConnected),
                };
                let _ = reply.send(result);
            }
            BridgeCommand::SendMessage {
                channel,
                to,
                text,
                reply,
            } => {
                let result = match &self.session {
                    Some(session) => {
                        session
                            .outbound
                            .enqueue_text(channel, to.unwrap_or(BROADCAST_ADDR), text)
                    }
                    None => Err(MeshError::NotConnected),
                };
                let _ = reply.send(result);
            }
            BridgeCommand::SetAutoRespond {
                channel,
                enabled,
                reply,
            } => {
                let result = match &self.session {
                    Some(session) => session.registry.set_auto_respond(channel, enabled),
                    None => Err(MeshError::NotConnected),
                };
                let _ = reply.send(result);
            }
            BridgeCommand::GetStats(tx) => {
                let _ = tx.send(self.stats());
            }
            BridgeCommand::GetSnapshot(tx) => {
                let _ = tx.send(self.session.as_ref().map(|s| s.registry.snapshot()));
            }
            BridgeCommand::Shutdown => {
                info!("Bridge shutdown requested");
                return false;
            }
        }
        true
    }

    async fn connect(&mut self, config: BridgeConfig) -> Result<()> {
        if self.session.is_some() {
            return Err(MeshError::AlreadyConnected);
        }
        config.validate()?;

        let session =
            Session::open(config, &self.interfaces, &self.completions, &self.router).await?;
        self.session = Some(session);
        Ok(())
    }

    fn stats(&self) -> BridgeStats {
        let mut stats = BridgeStats {
            events_published: self.router.published_count(),
            events_dropped: self.router.dropped_count(),
            ..Default::default()
        };
        let Some(session) = &self.session else {
            stats.state = Some(ConnectionState::Disconnected);
            return stats;
        };

        stats.state = Some(session.link.state());
        stats.transport = Some(session.transport);
        stats.frames_decoded = session.counters.frames_decoded.load(Ordering::Relaxed);
        stats.codec_errors = session.counters.codec_errors.load(Ordering::Relaxed);
        stats.duplicates_blocked = session.dedup.stats().duplicates_blocked;
        stats.messages_received = session.counters.messages_received.load(Ordering::Relaxed);
        stats.acks_received = session.counters.acks_received.load(Ordering::Relaxed);
        stats.nodes = session.registry.node_count();
        stats.outbound = session.outbound.stats();
        if let Some(orchestrator) = &session.orchestrator {
            stats.ai = orchestrator.stats();
        }
        stats
    }
}

/// Resolves once the active session's link has given up
async fn link_lost(session: &mut Option<Session>) {
    let Some(session) = session else {
        return std::future::pending().await;
    };
    loop {
        if *session.link_state.borrow_and_update() == ConnectionState::Disconnected {
            return;
        }
        if session.link_state.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Default)]
struct InboundCounters {
    frames_decoded: AtomicU64,
    codec_errors: AtomicU64,
    messages_received: AtomicU64,
    acks_received: AtomicU64,
}

/// One connection session and the tasks serving it
struct Session {
    config: BridgeConfig,
    transport: TransportKind,
    target: String,
    registry: Arc<Registry>,
    dedup: DeduplicationCache,
    orchestrator: Option<Arc<Orchestrator>>,
    outbound: OutboundHandle,
    outbound_task: JoinHandle<()>,
    link: LinkHandle,
    link_state: watch::Receiver<ConnectionState>,
    link_task: JoinHandle<()>,
    inbound_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    counters: Arc<InboundCounters>,
}

impl Session {
    async fn open(
        config: BridgeConfig,
        interfaces: &InterfaceFactory,
        completions: &CompletionFactory,
        router: &Arc<EventRouter>,
    ) -> Result<Self> {
        let transport = config.interface.kind();
        let target = config.interface.target();

        let registry = Arc::new(Registry::with_channels(
            config.registry.clone(),
            &config.channels,
        )?);
        let service = if config.ai.enabled {
            Some(completions(&config.ai)?)
        } else {
            None
        };
        let mut interface = interfaces(&config.interface)?;

        router.publish(BridgeEvent::ConnectionStateChanged {
            state: ConnectionState::Connecting,
            transport,
            target: target.clone(),
            reason: None,
        });
        info!(link = %interface.name(), "Connecting");

        if let Err(e) = connect_with_timeout(&mut interface, config.reconnect.connect_timeout).await
        {
            error!(link = %interface.name(), error = %e, "Connect failed");
            router.publish(BridgeEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                transport,
                target,
                reason: Some(e.to_string()),
            });
            return Err(e);
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (link, link_task) = Link::spawn(
            interface,
            target.clone(),
            config.reconnect.clone(),
            raw_tx,
            Arc::clone(router),
        );

        let dedup = DeduplicationCache::from_config(&config.dedup);
        let (outbound, outbound_task) = OutboundQueue::spawn(
            config.outbound.clone(),
            Arc::new(link.clone()),
            Arc::clone(&registry),
            Arc::clone(router),
            dedup.clone(),
        );

        let orchestrator = service.map(|service| {
            info!(service = %service.name(), model = %config.ai.model, "AI responder enabled");
            Orchestrator::new(
                config.ai.clone(),
                service,
                Arc::clone(&registry),
                Arc::clone(router),
                Arc::new(outbound.clone()),
            )
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(InboundCounters::default());
        let processor = InboundProcessor {
            registry: Arc::clone(&registry),
            dedup: dedup.clone(),
            router: Arc::clone(router),
            orchestrator: orchestrator.clone(),
            counters: Arc::clone(&counters),
        };
        let inbound_task = tokio::spawn(processor.run(raw_rx, shutdown_rx));

        router.publish(BridgeEvent::ConnectionStateChanged {
            state: ConnectionState::Connected,
            transport,
            target: target.clone(),
            reason: None,
        });
        info!(transport = %transport, target = %target, "Session connected");

        Ok(Self {
            config,
            transport,
            target,
            registry,
            dedup,
            orchestrator,
            outbound,
            outbound_task,
            link_state: link.watch_state(),
            link,
            link_task,
            inbound_task,
            shutdown,
            counters,
        })
    }

    /// Tear the session down
    ///
    /// Stops intake, fails outstanding AI requests, settles the outbound
    /// queue under the configured close policy, then closes the link.
    async fn close(self, router: &EventRouter, announce: bool) {
        info!(target = %self.target, "Closing session");

        let _ = self.shutdown.send(true);
        join_bounded("inbound", self.inbound_task).await;

        if let Some(orchestrator) = &self.orchestrator {
            let cancelled = orchestrator.cancel_all("session closed");
            if cancelled > 0 {
                info!(cancelled, "Outstanding AI requests failed");
            }
        }

        let policy = self.config.outbound.close_policy;
        // The queue bounds its own flush; this only guards a wedged task
        let limit = match policy {
            ClosePolicy::Flush => self.config.outbound.flush_timeout + TEARDOWN_TIMEOUT,
            ClosePolicy::Discard => TEARDOWN_TIMEOUT,
        };
        match tokio::time::timeout(limit, self.outbound.close(policy)).await {
            Ok(Ok(n)) => debug!(count = n, policy = ?policy, "Outbound queue closed"),
            Ok(Err(e)) => debug!(error = %e, "Outbound queue already stopped"),
            Err(_) => {
                warn!("Outbound queue did not close in time");
                self.outbound_task.abort();
            }
        }

        self.link.shutdown();
        join_bounded("link", self.link_task).await;

        if announce {
            router.publish(BridgeEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                transport: self.transport,
                target: self.target.clone(),
                reason: None,
            });
        }
        info!(target = %self.target, "Session closed");
    }
}

async fn join_bounded(name: &str, task: JoinHandle<()>) {
    let abort = task.abort_handle();
    match tokio::time::timeout(TEARDOWN_TIMEOUT, task).await {
        Ok(Ok(())) => trace!(task = name, "Task stopped"),
        Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Decodes link bytes and applies each message to the session state
struct InboundProcessor {
    registry: Arc<Registry>,
    dedup: DeduplicationCache,
    router: Arc<EventRouter>,
    orchestrator: Option<Arc<Orchestrator>>,
    counters: Arc<InboundCounters>,
}

impl InboundProcessor {
    async fn run(self, mut raw: mpsc::UnboundedReceiver<Bytes>, mut shutdown: watch::Receiver<bool>) {
        let mut decoder = FrameDecoder::new();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                bytes = raw.recv() => {
                    let Some(bytes) = bytes else { break };
                    decoder.push(&bytes);
                    while let Some(result) = decoder.next_frame() {
                        match result {
                            Ok(message) => self.process(message),
                            Err(e) => {
                                self.counters.codec_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %e, "Dropping malformed frame");
                            }
                        }
                    }
                }

                _ = housekeeping.tick() => self.housekeeping(),
            }
        }
        debug!("Inbound processing stopped");
    }

    fn housekeeping(&self) {
        for id in self.registry.mark_stale(Utc::now()) {
            debug!(node = %node_id_string(id), "Node went stale");
            if let Some(node) = self.registry.get_node(id) {
                self.router.publish(BridgeEvent::NodeUpdated {
                    node,
                    created: false,
                });
            }
        }
        let expired = self.dedup.expire_old_entries();
        if expired > 0 {
            trace!(expired, "Dedup entries expired");
        }
    }

    fn process(&self, message: ProtocolMessage) {
        self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);

        if let Some(header) = message.header() {
            let key = PacketKey::new(header.from, header.packet_id);
            if !self.dedup.check(key, PacketOrigin::Received) {
                trace!(packet = %key, "Duplicate packet suppressed");
                return;
            }
        }

        if let Some(obs) = Observation::from_message(&message) {
            let (node, created) = self.registry.upsert_node(&obs);
            if created {
                info!(node = %node_id_string(node.id), name = %node.display_name(), "Node discovered");
            }
            self.router.publish(BridgeEvent::NodeUpdated { node, created });
        }

        match message {
            ProtocolMessage::Text { header, text } => {
                let message = Message {
                    id: self.registry.next_message_id(),
                    packet_id: header.packet_id,
                    from: header.from,
                    to: header.to,
                    channel: header.channel,
                    payload: text.as_bytes().to_vec(),
                    text,
                    timestamp: Utc::now(),
                    delivery: DeliveryState::Received,
                };
                if let Err(e) = self.registry.append_message(message.clone()) {
                    warn!(error = %e, "Inbound message not recorded");
                    return;
                }
                self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                debug!(
                    from = %node_id_string(message.from),
                    channel = message.channel,
                    "Message received"
                );
                self.router.publish(BridgeEvent::MessageReceived {
                    message: message.clone(),
                });
                if let Some(orchestrator) = &self.orchestrator {
                    if let Some(request) = orchestrator.handle_message(&message) {
                        debug!(request, message = message.id, "AI request queued");
                    }
                }
            }
            ProtocolMessage::Telemetry { header, telemetry } => {
                self.router.publish(BridgeEvent::TelemetryReceived {
                    node: header.from,
                    telemetry,
                });
            }
            ProtocolMessage::Ack {
                request_id,
                error_code,
            } => self.acknowledge(request_id, error_code),
            ProtocolMessage::MyInfo { node_num } => {
                info!(node = %node_id_string(node_num), "Local node identified");
                self.registry.set_local_node(node_num);
            }
            ProtocolMessage::Unknown { tag, body } => {
                trace!(tag, len = body.len(), "Ignoring unknown frame");
            }
            ProtocolMessage::NodeInfo { .. } | ProtocolMessage::Position { .. } => {}
        }
    }

    fn acknowledge(&self, packet_id: u32, error_code: u8) {
        let Some(sent) = self.registry.find_sent_packet(packet_id) else {
            trace!(packet_id, "Ack for unknown packet");
            return;
        };
        self.counters.acks_received.fetch_add(1, Ordering::Relaxed);

        let next = if error_code == 0 {
            DeliveryState::Acked
        } else {
            DeliveryState::Failed
        };
        match self.registry.update_delivery(sent.id, next) {
            Ok(message) if error_code == 0 => {
                debug!(message = message.id, "Message acknowledged");
                self.router.publish(BridgeEvent::MessageAcked { message });
            }
            Ok(message) => {
                warn!(message = message.id, error_code, "Mesh reported delivery failure");
                self.router.publish(BridgeEvent::MessageFailed {
                    message,
                    reason: format!("routing error {}", error_code),
                });
            }
            Err(e) => debug!(error = %e, "Ack not applied"),
        }
    }
}
