//! Configuration types for the mesh bridge
//!
//! This module provides configuration structures for the link (serial, TCP
//! or BLE), channel table, registry, event router, AI orchestrator and
//! outbound pacing. Every section deserializes with defaults so a partial
//! JSON file is merged with the built-in values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MeshError, Result};

/// Frame delimiter (first 2 bytes of every frame)
pub const MESHTASTIC_MAGIC: u16 = 0x94C3;

/// Maximum frame payload accepted by the codec
pub const MAX_FRAME_PAYLOAD: usize = 512;

/// Maximum text message size the radio will transmit
pub const MAX_TEXT_BYTES: usize = 200;

/// Destination address for channel broadcasts
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Number of channel slots on a Meshtastic radio
pub const MAX_CHANNELS: u8 = 8;

/// Default baud rate for Meshtastic serial devices
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default TCP port of the Meshtastic network API
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default connection timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10000;

/// Default hop limit for outgoing messages
pub const DEFAULT_HOP_LIMIT: u8 = 3;

/// Default Ollama generate endpoint
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434/api/generate";

/// Default completion model
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1";

/// Default AI trigger prefix
pub const DEFAULT_AI_PREFIX: &str = "/AI";

/// Main configuration for the mesh bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Interface configuration (serial, TCP or BLE)
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Channels known before any traffic is observed
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,

    /// Node and channel registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Event router settings
    #[serde(default)]
    pub router: RouterConfig,

    /// AI orchestrator settings
    #[serde(default)]
    pub ai: AiConfig,

    /// Outbound queue settings
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Inbound duplicate suppression
    #[serde(default)]
    pub dedup: DedupConfig,
}

/// Kind of physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB serial
    Serial,
    /// TCP socket
    Tcp,
    /// Bluetooth Low Energy GATT
    Ble,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Ble => write!(f, "ble"),
        }
    }
}

/// Interface type for connecting to the radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// Serial port connection (most common)
    Serial {
        /// Path to serial port; `None` scans for a likely device
        #[serde(default)]
        port: Option<PathBuf>,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// TCP connection to a networked radio
    Tcp {
        /// Host address
        host: String,
        /// Port number
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    /// Bluetooth Low Energy connection
    Ble {
        /// Device address or advertised name
        address: String,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig::Serial {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl InterfaceConfig {
    /// The transport kind selected by this configuration
    pub fn kind(&self) -> TransportKind {
        match self {
            InterfaceConfig::Serial { .. } => TransportKind::Serial,
            InterfaceConfig::Tcp { .. } => TransportKind::Tcp,
            InterfaceConfig::Ble { .. } => TransportKind::Ble,
        }
    }

    /// Human-readable target, used in logs and connection events
    pub fn target(&self) -> String {
        match self {
            InterfaceConfig::Serial { port: Some(p), .. } => p.display().to_string(),
            InterfaceConfig::Serial { port: None, .. } => "auto".to_string(),
            InterfaceConfig::Tcp { host, port } => format!("{}:{}", host, port),
            InterfaceConfig::Ble { address } => address.clone(),
        }
    }

    /// Check connection parameters without touching any device
    pub fn validate(&self) -> Result<()> {
        match self {
            InterfaceConfig::Serial { baud_rate, .. } => {
                if *baud_rate == 0 {
                    return Err(MeshError::InvalidConfig(
                        "serial baud rate must be non-zero".to_string(),
                    ));
                }
            }
            InterfaceConfig::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err(MeshError::MissingConfig("TCP host not configured".to_string()));
                }
                if *port == 0 {
                    return Err(MeshError::InvalidConfig("TCP port must be non-zero".to_string()));
                }
            }
            InterfaceConfig::Ble { address } => {
                if address.trim().is_empty() {
                    return Err(MeshError::MissingConfig(
                        "BLE address not configured".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A channel slot known from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Channel index (0-7)
    pub index: u8,
    /// Channel name
    #[serde(default)]
    pub name: String,
    /// Opaque reference to the channel key held by the radio
    #[serde(default)]
    pub key_ref: Option<String>,
    /// Answer every text on this channel with the AI
    #[serde(default)]
    pub auto_respond: bool,
}

/// Node and channel registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Messages retained per channel
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Nodes not heard from within this window are marked stale
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,
}

fn default_history_capacity() -> usize {
    50
}

fn default_stale_after() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            stale_after: default_stale_after(),
        }
    }
}

/// What the router does when a subscriber falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep every event (unbounded per-subscriber buffer)
    Buffered,
    /// Keep at most `subscriber_capacity` events, dropping the oldest
    DropOldest,
}

/// Event router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Slow-subscriber policy
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,

    /// Per-subscriber buffer size under `DropOldest`
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::DropOldest
}

fn default_subscriber_capacity() -> usize {
    256
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            overflow: default_overflow(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

/// AI orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Enable AI replies
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Completion endpoint
    #[serde(default = "default_ollama_url")]
    pub url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,

    /// Trigger prefix, matched case-insensitively
    #[serde(default = "default_ai_prefix")]
    pub prefix: String,

    /// Answer direct messages addressed to the local node without a prefix
    #[serde(default = "default_true")]
    pub respond_to_direct: bool,

    /// Sampling temperature passed to the backend
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Completion wait timeout
    #[serde(with = "humantime_serde", default = "default_ai_timeout")]
    pub timeout: Duration,

    /// Retry a timed-out request once before giving up
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,

    /// Maximum simultaneous in-flight requests
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Prior channel messages included in the prompt
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Reply size limit in bytes
    #[serde(default = "default_reply_max_bytes")]
    pub reply_max_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_ollama_model() -> String {
    DEFAULT_OLLAMA_MODEL.to_string()
}

fn default_ai_prefix() -> String {
    DEFAULT_AI_PREFIX.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_ai_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_max_in_flight() -> usize {
    2
}

fn default_context_window() -> usize {
    10
}

fn default_reply_max_bytes() -> usize {
    MAX_TEXT_BYTES
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_ollama_url(),
            model: default_ollama_model(),
            prefix: default_ai_prefix(),
            respond_to_direct: true,
            temperature: default_temperature(),
            timeout: default_ai_timeout(),
            retry_on_timeout: true,
            max_in_flight: default_max_in_flight(),
            context_window: default_context_window(),
            reply_max_bytes: default_reply_max_bytes(),
        }
    }
}

/// What happens to queued transmissions when the session closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosePolicy {
    /// Fail every queued message with a notification
    #[default]
    Discard,
    /// Transmit everything queued (still paced) before closing
    Flush,
}

/// Outbound queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Minimum spacing between transmissions (airtime budget)
    #[serde(with = "humantime_serde", default = "default_min_spacing")]
    pub min_spacing: Duration,

    /// Write retries before a message is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between write retries (doubles each attempt)
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    /// How long to wait for the link to acknowledge a write
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,

    /// Queued messages on close
    #[serde(default)]
    pub close_policy: ClosePolicy,

    /// Upper bound on a flushing close; whatever is left is discarded
    #[serde(with = "humantime_serde", default = "default_flush_timeout")]
    pub flush_timeout: Duration,

    /// Hop limit stamped on outgoing packets
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,
}

fn default_min_spacing() -> Duration {
    Duration::from_secs(2)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_flush_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_hop_limit() -> u8 {
    DEFAULT_HOP_LIMIT
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            min_spacing: default_min_spacing(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            write_timeout: default_write_timeout(),
            close_policy: ClosePolicy::Discard,
            flush_timeout: default_flush_timeout(),
            hop_limit: default_hop_limit(),
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Timeout for a single connect attempt
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Initial delay before first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout: default_connect_timeout(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before reconnection attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Inbound duplicate suppression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Size of deduplication cache (number of packets)
    #[serde(default = "default_dedup_cache_size")]
    pub cache_size: usize,

    /// TTL for deduplication cache entries
    #[serde(with = "humantime_serde", default = "default_dedup_ttl")]
    pub ttl: Duration,
}

fn default_dedup_cache_size() -> usize {
    1000
}

fn default_dedup_ttl() -> Duration {
    Duration::from_secs(300)
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cache_size: default_dedup_cache_size(),
            ttl: default_dedup_ttl(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file, filling missing keys with defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: BridgeConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Save configuration as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }

    /// Check the whole configuration; called before any resource is acquired
    pub fn validate(&self) -> Result<()> {
        self.interface.validate()?;

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.index >= MAX_CHANNELS {
                return Err(MeshError::InvalidChannel(channel.index));
            }
            if !seen.insert(channel.index) {
                return Err(MeshError::InvalidConfig(format!(
                    "channel {} configured twice",
                    channel.index
                )));
            }
        }

        if self.registry.history_capacity == 0 {
            return Err(MeshError::InvalidConfig(
                "history capacity must be at least 1".to_string(),
            ));
        }
        if self.router.overflow == OverflowPolicy::DropOldest && self.router.subscriber_capacity == 0
        {
            return Err(MeshError::InvalidConfig(
                "subscriber capacity must be at least 1".to_string(),
            ));
        }

        if self.ai.enabled {
            if self.ai.max_in_flight == 0 {
                return Err(MeshError::InvalidConfig(
                    "max_in_flight must be at least 1".to_string(),
                ));
            }
            if self.ai.prefix.trim().is_empty() {
                return Err(MeshError::MissingConfig("AI trigger prefix".to_string()));
            }
            if self.ai.model.trim().is_empty() {
                return Err(MeshError::MissingConfig("AI model".to_string()));
            }
            reqwest::Url::parse(&self.ai.url).map_err(|e| {
                MeshError::InvalidConfig(format!("AI url '{}': {}", self.ai.url, e))
            })?;
            if self.ai.reply_max_bytes < 8 || self.ai.reply_max_bytes > MAX_TEXT_BYTES {
                return Err(MeshError::InvalidConfig(format!(
                    "reply_max_bytes must be between 8 and {}",
                    MAX_TEXT_BYTES
                )));
            }
        }

        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(MeshError::InvalidConfig(
                "reconnect initial_delay exceeds max_delay".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a serial port
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.interface = InterfaceConfig::Serial {
            port: Some(port.into()),
            baud_rate: DEFAULT_BAUD_RATE,
        };
        self
    }

    /// Use a TCP-connected radio
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.interface = InterfaceConfig::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    /// Use a BLE radio
    pub fn ble(mut self, address: impl Into<String>) -> Self {
        self.config.interface = InterfaceConfig::Ble {
            address: address.into(),
        };
        self
    }

    /// Add a configured channel
    pub fn channel(mut self, index: u8, name: impl Into<String>, auto_respond: bool) -> Self {
        self.config.channels.push(ChannelSettings {
            index,
            name: name.into(),
            key_ref: None,
            auto_respond,
        });
        self
    }

    /// Set per-channel history capacity
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.registry.history_capacity = capacity;
        self
    }

    /// Enable or disable AI replies
    pub fn ai_enabled(mut self, enabled: bool) -> Self {
        self.config.ai.enabled = enabled;
        self
    }

    /// Set the completion model
    pub fn ai_model(mut self, model: impl Into<String>) -> Self {
        self.config.ai.model = model.into();
        self
    }

    /// Set the completion endpoint
    pub fn ai_url(mut self, url: impl Into<String>) -> Self {
        self.config.ai.url = url.into();
        self
    }

    /// Set the trigger prefix
    pub fn ai_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.ai.prefix = prefix.into();
        self
    }

    /// Set the completion timeout
    pub fn ai_timeout(mut self, timeout: Duration) -> Self {
        self.config.ai.timeout = timeout;
        self
    }

    /// Set the in-flight request bound
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.config.ai.max_in_flight = n;
        self
    }

    /// Set the prompt context window
    pub fn context_window(mut self, n: usize) -> Self {
        self.config.ai.context_window = n;
        self
    }

    /// Set the minimum spacing between transmissions
    pub fn min_spacing(mut self, spacing: Duration) -> Self {
        self.config.outbound.min_spacing = spacing;
        self
    }

    /// Set outbound retry behavior
    pub fn outbound_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.config.outbound.max_retries = max_retries;
        self.config.outbound.retry_backoff = backoff;
        self
    }

    /// Set the close policy for queued messages
    pub fn close_policy(mut self, policy: ClosePolicy) -> Self {
        self.config.outbound.close_policy = policy;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
