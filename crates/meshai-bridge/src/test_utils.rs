//! Test utilities for running a bridge without a radio or a model
//!
//! - [`MockInterface`] simulates a radio link. Tests drive it through the
//!   paired [`MockHandle`]: inject inbound bytes, inspect writes, drop the
//!   link or make reconnects fail.
//! - [`MockWriter`] stands in for the link behind the outbound queue.
//! - [`MockCompletionService`] answers prompts with canned text after an
//!   optional delay, and records what it was asked.
//! - [`RecordingSink`] records replies handed to it by the orchestrator.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshai_bridge::test_utils::{text_frame, MockInterface};
//!
//! let (factory, radio) = MockInterface::factory();
//! let bridge = MeshBridge::with_factory(factory, completion);
//! bridge.handle().connect(config).await?;
//!
//! radio.inject(text_frame(0x1234_5678, BROADCAST_ADDR, 0, 1, "/AI hello"));
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::codec::{self, PacketHeader, Position, ProtocolMessage, TelemetrySnapshot};
use crate::config::{InterfaceConfig, TransportKind};
use crate::error::{MeshError, Result};
use crate::interface::{InterfaceFactory, LinkRead, MeshInterface};
use crate::orchestrator::{CompletionService, ReplySink};
use crate::outbound::FrameWriter;
use crate::registry::MessageId;

#[derive(Debug)]
enum MockRead {
    Data(Vec<u8>),
    Close,
    Fail(String),
}

#[derive(Debug, Default)]
struct MockShared {
    written: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    fail_connects: AtomicBool,
    fail_writes: AtomicUsize,
}

/// Simulated radio link
#[derive(Debug)]
pub struct MockInterface {
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRead>>>,
    shared: Arc<MockShared>,
    connected: bool,
}

/// Test-side control of a [`MockInterface`]
#[derive(Debug, Clone)]
pub struct MockHandle {
    tx: mpsc::UnboundedSender<MockRead>,
    shared: Arc<MockShared>,
}

impl MockInterface {
    /// Create a disconnected mock link and its control handle
    pub fn new() -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared::default());
        let iface = Self {
            inbound: Arc::new(tokio::sync::Mutex::new(rx)),
            shared: Arc::clone(&shared),
            connected: false,
        };
        (iface, MockHandle { tx, shared })
    }

    /// An interface factory whose links all share one control handle
    ///
    /// Every link the factory builds reads from the same injected stream, so
    /// a session can disconnect and connect again in the same test.
    pub fn factory() -> (InterfaceFactory, MockHandle) {
        let (template, handle) = Self::new();
        let inbound = template.inbound;
        let shared = template.shared;
        let factory: InterfaceFactory = Arc::new(move |config: &InterfaceConfig| {
            config.validate()?;
            Ok(Box::new(MockInterface {
                inbound: Arc::clone(&inbound),
                shared: Arc::clone(&shared),
                connected: false,
            }) as Box<dyn MeshInterface>)
        });
        (factory, handle)
    }
}

impl MockHandle {
    /// Deliver raw bytes as if read from the radio
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.tx.send(MockRead::Data(bytes.into()));
    }

    /// Encode and deliver a protocol message
    pub fn inject_message(&self, message: &ProtocolMessage) {
        if let Ok(frame) = codec::encode(message) {
            self.inject(frame.to_vec());
        }
    }

    /// Simulate the peer closing the link
    pub fn close_link(&self) {
        let _ = self.tx.send(MockRead::Close);
    }

    /// Simulate a read error
    pub fn fail_link(&self, reason: impl Into<String>) {
        let _ = self.tx.send(MockRead::Fail(reason.into()));
    }

    /// Make connect attempts fail
    pub fn fail_connects(&self, fail: bool) {
        self.shared.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail
    pub fn fail_writes(&self, n: usize) {
        self.shared.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Raw frames written to the link
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.written.lock().clone()
    }

    /// Written frames decoded back into protocol messages
    pub fn written_messages(&self) -> Vec<ProtocolMessage> {
        self.written()
            .iter()
            .filter_map(|f| codec::decode(f).ok())
            .collect()
    }

    /// Text of every written text message, in write order
    pub fn written_texts(&self) -> Vec<String> {
        self.written_messages()
            .into_iter()
            .filter_map(|m| match m {
                ProtocolMessage::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Whether the most recent link is open
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeshInterface for MockInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.shared.fail_connects.load(Ordering::SeqCst) {
            return Err(MeshError::OpenFailed {
                target: "mock".to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        self.connected = true;
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_frame(&mut self) -> Result<LinkRead> {
        if !self.connected {
            return Err(MeshError::NotConnected);
        }
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(MockRead::Data(bytes)) => Ok(LinkRead::Data(Bytes::from(bytes))),
            Some(MockRead::Close) => Ok(LinkRead::Closed),
            Some(MockRead::Fail(reason)) => Err(MeshError::ReadError(reason)),
            None => std::future::pending().await,
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(MeshError::NotConnected);
        }
        let failing = self
            .shared
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MeshError::WriteError("simulated failure".to_string()));
        }
        self.shared.written.lock().push(frame.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

/// Recording [`FrameWriter`] with scripted failures
#[derive(Debug, Default)]
pub struct MockWriter {
    frames: Mutex<Vec<Bytes>>,
    times: Mutex<Vec<Instant>>,
    attempts: AtomicUsize,
    fail_first: usize,
    delay: Duration,
}

impl MockWriter {
    /// A writer that accepts every frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` writes
    pub fn fail_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Take `delay` to complete each write
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Accepted frames in write order
    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    /// When each accepted frame was written
    pub fn write_times(&self) -> Vec<Instant> {
        self.times.lock().clone()
    }

    /// Write attempts, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn write_frame(&self, frame: Bytes) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if attempt < self.fail_first {
            return Err(MeshError::WriteError("simulated failure".to_string()));
        }
        self.frames.lock().push(frame);
        self.times.lock().push(Instant::now());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Script {
    suffix: String,
    delay: Duration,
    answer: String,
}

/// Canned completion service
#[derive(Debug)]
pub struct MockCompletionService {
    answer: String,
    failure: Option<String>,
    delay: Duration,
    scripts: Vec<Script>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
}

impl Default for MockCompletionService {
    fn default() -> Self {
        Self {
            answer: "mock answer".to_string(),
            failure: None,
            delay: Duration::ZERO,
            scripts: Vec::new(),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: AtomicUsize::new(0),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockCompletionService {
    /// Answers "mock answer" immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every prompt with `answer`
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = answer.into();
        self
    }

    /// Fail every prompt with a service error
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Take `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer prompts ending in `suffix` with `answer` after `delay`
    pub fn with_script(
        mut self,
        suffix: impl Into<String>,
        delay: Duration,
        answer: impl Into<String>,
    ) -> Self {
        self.scripts.push(Script {
            suffix: suffix.into(),
            delay,
            answer: answer.into(),
        });
        self
    }

    /// Prompts received, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Number of calls started
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for MockCompletionService {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(Arc::clone(&self.active));

        let (delay, answer) = self
            .scripts
            .iter()
            .find(|s| prompt.ends_with(s.suffix.as_str()))
            .map(|s| (s.delay, s.answer.clone()))
            .unwrap_or((self.delay, self.answer.clone()));

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(reason) => Err(MeshError::AiService(reason.clone())),
            None => Ok(answer),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Reply sink that records every reply
#[derive(Debug, Default)]
pub struct RecordingSink {
    replies: Mutex<Vec<(u8, u32, String)>>,
    next_id: AtomicU64,
}

impl RecordingSink {
    /// Replies as `(channel, to, text)`, in submission order
    pub fn replies(&self) -> Vec<(u8, u32, String)> {
        self.replies.lock().clone()
    }
}

impl ReplySink for RecordingSink {
    fn send_reply(&self, channel: u8, to: u32, text: String) -> Result<MessageId> {
        self.replies.lock().push((channel, to, text));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

fn header(from: u32, to: u32, channel: u8, packet_id: u32) -> PacketHeader {
    PacketHeader {
        from,
        to,
        packet_id,
        channel,
        hop_limit: 3,
        snr_x4: 24,
        rssi: -90,
        rx_time: 0,
    }
}

/// Encoded text frame as a radio would deliver it
pub fn text_frame(from: u32, to: u32, channel: u8, packet_id: u32, text: &str) -> Vec<u8> {
    frame(&ProtocolMessage::Text {
        header: header(from, to, channel, packet_id),
        text: text.to_string(),
    })
}

/// Encoded node info frame
pub fn node_info_frame(from: u32, packet_id: u32, long_name: &str, short_name: &str) -> Vec<u8> {
    frame(&ProtocolMessage::NodeInfo {
        header: header(from, crate::config::BROADCAST_ADDR, 0, packet_id),
        long_name: long_name.to_string(),
        short_name: short_name.to_string(),
        hw_model: 9,
    })
}

/// Encoded position frame
pub fn position_frame(from: u32, packet_id: u32, latitude: f64, longitude: f64) -> Vec<u8> {
    frame(&ProtocolMessage::Position {
        header: header(from, crate::config::BROADCAST_ADDR, 0, packet_id),
        position: Position {
            latitude_i: (latitude * 1e7) as i32,
            longitude_i: (longitude * 1e7) as i32,
            altitude: 0,
            time: 0,
        },
    })
}

/// Encoded telemetry frame
pub fn telemetry_frame(from: u32, packet_id: u32, battery_level: u8) -> Vec<u8> {
    frame(&ProtocolMessage::Telemetry {
        header: header(from, crate::config::BROADCAST_ADDR, 0, packet_id),
        telemetry: TelemetrySnapshot {
            battery_level,
            voltage_mv: 4000,
            channel_utilization_x100: 350,
            air_util_tx_x100: 120,
            uptime_seconds: 3600,
        },
    })
}

/// Encoded acknowledgement for `request_id`
pub fn ack_frame(request_id: u32, error_code: u8) -> Vec<u8> {
    frame(&ProtocolMessage::Ack {
        request_id,
        error_code,
    })
}

/// Encoded local node announcement
pub fn my_info_frame(node_num: u32) -> Vec<u8> {
    frame(&ProtocolMessage::MyInfo { node_num })
}

fn frame(message: &ProtocolMessage) -> Vec<u8> {
    codec::encode(message).map(|b| b.to_vec()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_interface_round_trip() {
        let (mut iface, handle) = MockInterface::new();
        assert!(iface.read_frame().await.is_err());

        iface.connect().await.unwrap();
        assert!(handle.is_connected());

        handle.inject(vec![9, 9]);
        assert_eq!(
            iface.read_frame().await.unwrap(),
            LinkRead::Data(Bytes::from_static(&[9, 9]))
        );

        handle.fail_writes(1);
        assert!(iface.write_frame(b"a").await.is_err());
        iface.write_frame(b"b").await.unwrap();
        assert_eq!(handle.written(), vec![b"b".to_vec()]);

        handle.close_link();
        assert_eq!(iface.read_frame().await.unwrap(), LinkRead::Closed);
    }

    #[tokio::test]
    async fn test_factory_links_share_handle() {
        let (factory, handle) = MockInterface::factory();
        let config = InterfaceConfig::Tcp {
            host: "mock".to_string(),
            port: 4403,
        };
        let mut first = factory(&config).unwrap();
        first.connect().await.unwrap();
        first.disconnect().await.unwrap();

        let mut second = factory(&config).unwrap();
        second.connect().await.unwrap();
        handle.inject(text_frame(1, 2, 0, 3, "hello"));
        assert!(matches!(second.read_frame().await.unwrap(), LinkRead::Data(_)));
        assert_eq!(handle.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_completion_scripts() {
        let service = MockCompletionService::new()
            .with_answer("default")
            .with_script("ping", Duration::ZERO, "pong");

        assert_eq!(service.complete("say ping").await.unwrap(), "pong");
        assert_eq!(service.complete("other").await.unwrap(), "default");
        assert_eq!(service.calls(), 2);
        assert_eq!(service.max_concurrent(), 1);
        assert_eq!(service.prompts(), vec!["say ping", "other"]);
    }

    #[test]
    fn test_frame_builders_decode() {
        for frame in [
            text_frame(1, 2, 0, 3, "hi"),
            node_info_frame(1, 4, "Alpha", "A"),
            position_frame(1, 5, 52.5, 13.4),
            telemetry_frame(1, 6, 80),
            ack_frame(3, 0),
            my_info_frame(1),
        ] {
            assert!(codec::decode(&frame).is_ok());
        }
    }
}
