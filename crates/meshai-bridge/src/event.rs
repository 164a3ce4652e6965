//! Bridge events
//!
//! Events published by a session for consumption by the presentation layer,
//! the node binary's logger and the AI orchestrator.

use serde::{Deserialize, Serialize};

use crate::codec::TelemetrySnapshot;
use crate::config::TransportKind;
use crate::interface::ConnectionState;
use crate::orchestrator::{AiRequestState, RequestId};
use crate::registry::{Message, MessageId, Node};

/// Events emitted by the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A node was heard (created or updated)
    NodeUpdated {
        /// Node state after the update
        node: Node,
        /// First time this node was heard
        created: bool,
    },

    /// A text message arrived from the mesh
    MessageReceived {
        /// The message as stored in history
        message: Message,
    },

    /// A message was written to the radio
    MessageSent {
        /// The message as stored in history
        message: Message,
    },

    /// The mesh acknowledged a sent message
    MessageAcked {
        /// The acknowledged message
        message: Message,
    },

    /// A message could not be delivered
    MessageFailed {
        /// The message in its failed state
        message: Message,
        /// Why it failed
        reason: String,
    },

    /// The session's link changed state
    ConnectionStateChanged {
        /// New state
        state: ConnectionState,
        /// Link kind
        transport: TransportKind,
        /// Port, address or host
        target: String,
        /// Error that caused the change, if any
        reason: Option<String>,
    },

    /// The AI produced a reply that was handed to the outbound queue
    AiReplyGenerated {
        /// Correlation id
        request_id: RequestId,
        /// Message that triggered the request
        source: MessageId,
        /// Channel the reply goes to
        channel: u8,
        /// Reply text as queued
        reply: String,
    },

    /// An AI request ended without a reply
    AiRequestFailed {
        /// Correlation id
        request_id: RequestId,
        /// Message that triggered the request
        source: MessageId,
        /// Channel of the trigger
        channel: u8,
        /// Terminal state (`Failed` or `TimedOut`)
        state: AiRequestState,
        /// Failure description
        reason: String,
    },

    /// A node reported device telemetry
    TelemetryReceived {
        /// Reporting node
        node: u32,
        /// Reported metrics
        telemetry: TelemetrySnapshot,
    },
}

/// Event discriminant used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// [`BridgeEvent::NodeUpdated`]
    NodeUpdated,
    /// [`BridgeEvent::MessageReceived`]
    MessageReceived,
    /// [`BridgeEvent::MessageSent`]
    MessageSent,
    /// [`BridgeEvent::MessageAcked`]
    MessageAcked,
    /// [`BridgeEvent::MessageFailed`]
    MessageFailed,
    /// [`BridgeEvent::ConnectionStateChanged`]
    ConnectionStateChanged,
    /// [`BridgeEvent::AiReplyGenerated`]
    AiReplyGenerated,
    /// [`BridgeEvent::AiRequestFailed`]
    AiRequestFailed,
    /// [`BridgeEvent::TelemetryReceived`]
    TelemetryReceived,
}

impl BridgeEvent {
    /// Discriminant of this event
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::NodeUpdated { .. } => EventKind::NodeUpdated,
            BridgeEvent::MessageReceived { .. } => EventKind::MessageReceived,
            BridgeEvent::MessageSent { .. } => EventKind::MessageSent,
            BridgeEvent::MessageAcked { .. } => EventKind::MessageAcked,
            BridgeEvent::MessageFailed { .. } => EventKind::MessageFailed,
            BridgeEvent::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            BridgeEvent::AiReplyGenerated { .. } => EventKind::AiReplyGenerated,
            BridgeEvent::AiRequestFailed { .. } => EventKind::AiRequestFailed,
            BridgeEvent::TelemetryReceived { .. } => EventKind::TelemetryReceived,
        }
    }
}
