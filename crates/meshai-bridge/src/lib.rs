//! Meshtastic Mesh Bridge with an AI Responder
//!
//! This crate connects to a Meshtastic LoRa radio over serial, TCP or
//! Bluetooth LE, keeps a live picture of the mesh (nodes, channels and
//! message history), and answers mesh messages with a locally hosted
//! language model.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Link** - Serial/TCP/BLE connection to the radio, owned by one task
//! 2. **Codec** - `0x94C3` framing, checksums and stream resynchronization
//! 3. **Session state** - Node and channel registry, dedup cache, events
//! 4. **Responders** - AI orchestrator and the paced outbound queue
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshai_bridge::{BridgeConfigBuilder, BridgeEvent, MeshBridge};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::new()
//!         .tcp("meshtastic.local", 4403)
//!         .ai_model("llama3.1")
//!         .build();
//!
//!     let (bridge, handle) = MeshBridge::with_defaults();
//!     tokio::spawn(bridge.run());
//!
//!     let mut events = handle.subscribe_all();
//!     handle.connect(config).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//! - `ble` - Bluetooth Low Energy interface (requires `btleplug`)
//! - `full` - Enable all interfaces
//!
//! TCP is always available.
//!
//! # Message Flow
//!
//! ## Mesh → AI
//!
//! 1. The link task reads raw bytes from the radio
//! 2. `FrameDecoder` splits and validates frames
//! 3. `DeduplicationCache` drops rebroadcasts
//! 4. `Registry` records the sender and the message
//! 5. `Orchestrator` decides whether to answer and queues a request
//!
//! ## AI → Mesh
//!
//! 1. A completion arrives from the `CompletionService`
//! 2. The reply is formatted as `@!sender answer` and queued
//! 3. `OutboundQueue` paces and writes it, retrying on failure
//! 4. A later Ack frame marks it delivered

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Link and wire format
pub mod codec;
pub mod config;
pub mod error;
pub mod interface;
pub mod link;

// Session state
pub mod cache;
pub mod event;
pub mod registry;
pub mod router;

// Responders
pub mod ollama;
pub mod orchestrator;
pub mod outbound;

// Controller
pub mod bridge;

// Testing utilities
pub mod test_utils;

pub use config::{
    AiConfig, BridgeConfig, BridgeConfigBuilder, ChannelSettings, ClosePolicy, DedupConfig,
    InterfaceConfig, OutboundConfig, OverflowPolicy, ReconnectConfig, RegistryConfig,
    RouterConfig, TransportKind,
};
pub use error::{MeshError, Result};
pub use interface::{
    create_interface, default_factory, ConnectionState, InterfaceFactory, LinkRead, MeshInterface,
    TcpInterface,
};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;

#[cfg(feature = "ble")]
pub use interface::BleInterface;

pub use cache::{CacheStats, DeduplicationCache, PacketKey, PacketOrigin};
pub use codec::{FrameDecoder, PacketHeader, Position, ProtocolMessage, TelemetrySnapshot};
pub use event::{BridgeEvent, EventKind};
pub use registry::{
    node_id_string, Channel, DeliveryState, Message, MessageId, Node, Observation, Registry,
    RegistrySnapshot,
};
pub use router::{EventRouter, Subscription};

pub use ollama::OllamaClient;
pub use orchestrator::{
    AiRequest, AiRequestState, CompletionService, Orchestrator, OrchestratorStats, ReplySink,
    RequestId, Trigger, TriggerKind,
};
pub use outbound::{FrameWriter, OutboundHandle, OutboundQueue, OutboundStats};

pub use bridge::{
    ollama_factory, BridgeCommand, BridgeHandle, BridgeStats, CompletionFactory, MeshBridge,
};

// Protocol constants re-exports
pub use config::{
    BROADCAST_ADDR, DEFAULT_BAUD_RATE, DEFAULT_HOP_LIMIT, DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS,
    MAX_CHANNELS, MAX_FRAME_PAYLOAD, MAX_TEXT_BYTES, MESHTASTIC_MAGIC,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
