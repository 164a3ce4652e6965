//! Node and channel registry
//!
//! Live state of the mesh as seen through one radio: every node heard, the
//! channel table, and a bounded message history per channel that feeds the
//! AI prompt context.
//!
//! All state sits behind a single lock so a reader never observes a node
//! update and its message half-applied. Nodes are never removed; nodes that
//! go quiet are only marked stale.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::codec::{Position, ProtocolMessage, TelemetrySnapshot};
use crate::config::{ChannelSettings, RegistryConfig, BROADCAST_ADDR, MAX_CHANNELS};
use crate::error::{MeshError, Result};

/// Locally assigned message identifier
pub type MessageId = u64;

/// Format a node number the way Meshtastic displays it
pub fn node_id_string(node: u32) -> String {
    format!("!{:08x}", node)
}

/// A node heard on the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node number
    pub id: u32,
    /// Long display name
    pub long_name: Option<String>,
    /// Short display name
    pub short_name: Option<String>,
    /// Hardware model code
    pub hw_model: Option<u8>,
    /// Last reported position
    pub position: Option<Position>,
    /// Last reported telemetry
    pub telemetry: Option<TelemetrySnapshot>,
    /// Last receive SNR in dB
    pub snr: Option<f32>,
    /// Last receive RSSI in dBm
    pub rssi: Option<i16>,
    /// When first heard
    pub first_seen: DateTime<Utc>,
    /// When last heard
    pub last_seen: DateTime<Utc>,
    /// Packets heard from this node
    pub packets_heard: u64,
    /// Not heard within the staleness window
    pub stale: bool,
}

impl Node {
    fn new(id: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            long_name: None,
            short_name: None,
            hw_model: None,
            position: None,
            telemetry: None,
            snr: None,
            rssi: None,
            first_seen: now,
            last_seen: now,
            packets_heard: 0,
            stale: false,
        }
    }

    /// Best available name for display
    pub fn display_name(&self) -> String {
        self.long_name
            .clone()
            .or_else(|| self.short_name.clone())
            .unwrap_or_else(|| node_id_string(self.id))
    }

    fn apply(&mut self, obs: &Observation) {
        self.packets_heard += 1;
        self.first_seen = self.first_seen.min(obs.heard_at);
        // A late report must not pair older readings with a newer last_seen
        if obs.heard_at < self.last_seen {
            return;
        }
        self.last_seen = obs.heard_at;
        self.stale = false;
        if obs.snr.is_some() {
            self.snr = obs.snr;
        }
        if obs.rssi.is_some() {
            self.rssi = obs.rssi;
        }
        if let Some(name) = &obs.long_name {
            self.long_name = Some(name.clone());
        }
        if let Some(name) = &obs.short_name {
            self.short_name = Some(name.clone());
        }
        if obs.hw_model.is_some() {
            self.hw_model = obs.hw_model;
        }
        if obs.position.is_some() {
            self.position = obs.position;
        }
        if obs.telemetry.is_some() {
            self.telemetry = obs.telemetry;
        }
    }
}

/// What one packet told us about its sender
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Node number
    pub node: u32,
    /// When it was heard
    pub heard_at: DateTime<Utc>,
    /// Receive SNR
    pub snr: Option<f32>,
    /// Receive RSSI
    pub rssi: Option<i16>,
    /// Long name, from node info
    pub long_name: Option<String>,
    /// Short name, from node info
    pub short_name: Option<String>,
    /// Hardware model, from node info
    pub hw_model: Option<u8>,
    /// Position report
    pub position: Option<Position>,
    /// Telemetry report
    pub telemetry: Option<TelemetrySnapshot>,
}

impl Observation {
    /// Bare sighting of a node
    pub fn heard(node: u32) -> Self {
        Self {
            node,
            heard_at: Utc::now(),
            ..Default::default()
        }
    }

    /// Extract the sender observation from a decoded packet
    pub fn from_message(message: &ProtocolMessage) -> Option<Self> {
        let header = message.header()?;
        let mut obs = Self::heard(header.from);
        if header.rx_time != 0 {
            if let Some(t) = DateTime::from_timestamp(header.rx_time as i64, 0) {
                obs.heard_at = t;
            }
        }
        if header.snr_x4 != 0 || header.rssi != 0 {
            obs.snr = Some(header.snr());
            obs.rssi = Some(header.rssi);
        }

        match message {
            ProtocolMessage::NodeInfo {
                long_name,
                short_name,
                hw_model,
                ..
            } => {
                obs.long_name = Some(long_name.clone());
                obs.short_name = Some(short_name.clone());
                obs.hw_model = Some(*hw_model);
            }
            ProtocolMessage::Position { position, .. } => obs.position = Some(*position),
            ProtocolMessage::Telemetry { telemetry, .. } => obs.telemetry = Some(*telemetry),
            _ => {}
        }
        Some(obs)
    }
}

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Queued for transmission
    Pending,
    /// Written to the radio
    Sent,
    /// Acknowledged by the mesh
    Acked,
    /// Gave up
    Failed,
    /// Heard from the mesh
    Received,
}

impl DeliveryState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Acked | DeliveryState::Failed | DeliveryState::Received
        )
    }

    /// Check if `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        matches!(
            (self, next),
            (DeliveryState::Pending, DeliveryState::Sent)
                | (DeliveryState::Pending, DeliveryState::Failed)
                | (DeliveryState::Sent, DeliveryState::Acked)
                | (DeliveryState::Sent, DeliveryState::Failed)
        )
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Acked => "acked",
            DeliveryState::Failed => "failed",
            DeliveryState::Received => "received",
        };
        f.write_str(s)
    }
}

/// A text message on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Local identifier
    pub id: MessageId,
    /// Mesh packet id
    pub packet_id: u32,
    /// Sender node
    pub from: u32,
    /// Destination node (`BROADCAST_ADDR` for the whole channel)
    pub to: u32,
    /// Channel index
    pub channel: u8,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Decoded text
    pub text: String,
    /// When it was heard or queued
    pub timestamp: DateTime<Utc>,
    /// Delivery state
    pub delivery: DeliveryState,
}

impl Message {
    /// Check if this was sent to the whole channel
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }
}

/// A channel slot and its recent history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel index (0-7)
    pub index: u8,
    /// Channel name
    pub name: String,
    /// Opaque reference to the channel key
    pub key_ref: Option<String>,
    /// Answer every message on this channel
    pub auto_respond: bool,
    /// Recent messages, oldest first
    pub history: VecDeque<Message>,
}

impl Channel {
    fn new(index: u8) -> Self {
        Self {
            index,
            name: String::new(),
            key_ref: None,
            auto_respond: false,
            history: VecDeque::new(),
        }
    }

    /// Name for display, falling back to the index
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("channel {}", self.index)
        } else {
            self.name.clone()
        }
    }
}

/// Consistent view of the whole registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Known nodes, sorted by id
    pub nodes: Vec<Node>,
    /// Known channels, sorted by index
    pub channels: Vec<Channel>,
    /// The connected radio's node number
    pub local_node: Option<u32>,
}

#[derive(Debug, Default)]
struct RegistryState {
    nodes: HashMap<u32, Node>,
    channels: BTreeMap<u8, Channel>,
    local_node: Option<u32>,
}

impl RegistryState {
    fn channel_mut(&mut self, index: u8) -> Result<&mut Channel> {
        if index >= MAX_CHANNELS {
            return Err(MeshError::InvalidChannel(index));
        }
        Ok(self
            .channels
            .entry(index)
            .or_insert_with(|| Channel::new(index)))
    }

    fn find_message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.channels
            .values_mut()
            .flat_map(|c| c.history.iter_mut())
            .find(|m| m.id == id)
    }
}

/// Registry of nodes, channels and message history
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
    config: RegistryConfig,
    next_message_id: AtomicU64,
}

impl Registry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            config,
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Create a registry with the configured channel table
    pub fn with_channels(config: RegistryConfig, channels: &[ChannelSettings]) -> Result<Self> {
        let registry = Self::new(config);
        {
            let mut state = registry.state.write();
            for settings in channels {
                let channel = state.channel_mut(settings.index)?;
                channel.name = settings.name.clone();
                channel.key_ref = settings.key_ref.clone();
                channel.auto_respond = settings.auto_respond;
            }
        }
        Ok(registry)
    }

    /// Allocate a message id
    pub fn next_message_id(&self) -> MessageId {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a sighting, creating the node on first contact
    ///
    /// Returns the updated node and whether it was new.
    pub fn upsert_node(&self, obs: &Observation) -> (Node, bool) {
        let mut state = self.state.write();
        let created = !state.nodes.contains_key(&obs.node);
        let node = state
            .nodes
            .entry(obs.node)
            .or_insert_with(|| Node::new(obs.node, obs.heard_at));
        node.apply(obs);
        if created {
            debug!(node = %node_id_string(obs.node), "New node");
        }
        (node.clone(), created)
    }

    /// Get a node by number
    pub fn get_node(&self, id: u32) -> Option<Node> {
        self.state.read().nodes.get(&id).cloned()
    }

    /// All known nodes, sorted by id
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.state.read().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Count known nodes
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Mark nodes not heard within the staleness window; returns newly stale ids
    pub fn mark_stale(&self, now: DateTime<Utc>) -> Vec<u32> {
        let window = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        let cutoff = now - window;
        let local = self.local_node();

        let mut newly = Vec::new();
        let mut state = self.state.write();
        for node in state.nodes.values_mut() {
            if !node.stale && node.last_seen < cutoff && Some(node.id) != local {
                node.stale = true;
                newly.push(node.id);
            }
        }
        newly.sort_unstable();
        newly
    }

    /// Nodes currently marked stale
    pub fn stale_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .state
            .read()
            .nodes
            .values()
            .filter(|n| n.stale)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Set the connected radio's node number
    pub fn set_local_node(&self, id: u32) {
        let mut state = self.state.write();
        state.local_node = Some(id);
        state
            .nodes
            .entry(id)
            .or_insert_with(|| Node::new(id, Utc::now()));
    }

    /// The connected radio's node number, once reported
    pub fn local_node(&self) -> Option<u32> {
        self.state.read().local_node
    }

    /// Make sure a channel exists
    pub fn ensure_channel(&self, index: u8) -> Result<()> {
        self.state.write().channel_mut(index).map(|_| ())
    }

    /// Get a copy of a channel
    pub fn channel(&self, index: u8) -> Option<Channel> {
        self.state.read().channels.get(&index).cloned()
    }

    /// Toggle the auto-respond flag of a channel
    pub fn set_auto_respond(&self, index: u8, enabled: bool) -> Result<()> {
        let mut state = self.state.write();
        state.channel_mut(index)?.auto_respond = enabled;
        debug!(channel = index, enabled, "Auto-respond changed");
        Ok(())
    }

    /// Check if a channel answers every message
    pub fn is_auto_respond(&self, index: u8) -> bool {
        self.state
            .read()
            .channels
            .get(&index)
            .map(|c| c.auto_respond)
            .unwrap_or(false)
    }

    /// Append a message to its channel's history
    ///
    /// The sender must already be known. The oldest entry is evicted once
    /// the channel holds `history_capacity` messages.
    pub fn append_message(&self, message: Message) -> Result<()> {
        let capacity = self.config.history_capacity.max(1);
        let mut state = self.state.write();
        if !state.nodes.contains_key(&message.from) {
            return Err(MeshError::UnknownNode(message.from));
        }

        let channel = state.channel_mut(message.channel)?;
        while channel.history.len() >= capacity {
            if let Some(evicted) = channel.history.pop_front() {
                trace!(channel = channel.index, message = evicted.id, "History evicted");
            }
        }
        channel.history.push_back(message);
        Ok(())
    }

    /// The most recent `limit` messages of a channel, oldest first
    pub fn history(&self, channel: u8, limit: usize) -> Vec<Message> {
        let state = self.state.read();
        match state.channels.get(&channel) {
            Some(c) => {
                let skip = c.history.len().saturating_sub(limit);
                c.history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Advance the delivery state of a message in history
    pub fn update_delivery(&self, id: MessageId, next: DeliveryState) -> Result<Message> {
        let mut state = self.state.write();
        let message = state
            .find_message_mut(id)
            .ok_or(MeshError::UnknownMessage(id))?;

        if message.delivery == next {
            return Ok(message.clone());
        }
        if !message.delivery.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                from: message.delivery.to_string(),
                to: next.to_string(),
            });
        }
        message.delivery = next;
        Ok(message.clone())
    }

    /// Find the sent message carrying `packet_id`
    pub fn find_sent_packet(&self, packet_id: u32) -> Option<Message> {
        let state = self.state.read();
        state
            .channels
            .values()
            .flat_map(|c| c.history.iter())
            .find(|m| m.packet_id == packet_id && m.delivery == DeliveryState::Sent)
            .cloned()
    }

    /// Consistent copy of every node and channel
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        RegistrySnapshot {
            nodes,
            channels: state.channels.values().cloned().collect(),
            local_node: state.local_node,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
