//! Integration tests for the mesh bridge
//!
//! These tests drive a full session through the public handle:
//! - Mock radio link feeding encoded frames
//! - AI responder with a scripted completion service
//! - Outbound pacing, retries and acknowledgements
//! - Session teardown with work outstanding

use meshai_bridge::test_utils::{
    ack_frame, my_info_frame, node_info_frame, telemetry_frame, text_frame,
    MockCompletionService, MockHandle, MockInterface,
};
use meshai_bridge::{
    AiRequestState, BridgeConfig, BridgeConfigBuilder, BridgeEvent, BridgeHandle,
    CompletionFactory, CompletionService, ConnectionState, DeliveryState, EventKind, MeshBridge,
    MeshError, RouterConfig, Subscription, BROADCAST_ADDR,
};
use std::sync::Arc;
use std::time::Duration;

const LOCAL: u32 = 0x0A0B_0C0D;
const ALICE: u32 = 0x1111_2222;
const BOB: u32 = 0x3333_4444;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    handle: BridgeHandle,
    radio: MockHandle,
    service: Arc<MockCompletionService>,
    events: Subscription,
}

async fn start(service: MockCompletionService, config: BridgeConfig) -> Harness {
    let (interfaces, radio) = MockInterface::factory();
    let service = Arc::new(service);
    let shared: Arc<dyn CompletionService> = service.clone();
    let completions: CompletionFactory = Arc::new(move |_| Ok(Arc::clone(&shared)));

    let (bridge, handle) = MeshBridge::new(RouterConfig::default(), interfaces, completions);
    tokio::spawn(bridge.run());

    let events = handle.subscribe_all();
    handle.connect(config).await.expect("connect");

    radio.inject(my_info_frame(LOCAL));
    wait_for_local_node(&handle).await;

    Harness {
        handle,
        radio,
        service,
        events,
    }
}

fn base_config() -> BridgeConfigBuilder {
    BridgeConfigBuilder::new()
        .tcp("radio.local", 4403)
        .min_spacing(Duration::from_millis(5))
        .ai_timeout(Duration::from_secs(5))
}

async fn wait_for_local_node(handle: &BridgeHandle) {
    for _ in 0..200 {
        if let Ok(Some(snapshot)) = handle.snapshot().await {
            if snapshot.local_node == Some(LOCAL) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("local node never reported");
}

async fn next_of(events: &mut Subscription, kind: EventKind) -> BridgeEvent {
    let wait = async {
        loop {
            let event = events.recv().await.expect("router closed");
            if event.kind() == kind {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("no {:?} event", kind))
}

async fn collect(events: &mut Subscription, kind: EventKind, n: usize) -> Vec<BridgeEvent> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(next_of(events, kind).await);
    }
    out
}

/// Gather failure notifications until the session reports Disconnected
async fn settle_after_disconnect(
    events: &mut Subscription,
) -> (Vec<BridgeEvent>, Vec<BridgeEvent>) {
    let wait = async {
        let (mut ai, mut sends) = (Vec::new(), Vec::new());
        loop {
            match events.recv().await.expect("router closed") {
                event @ BridgeEvent::AiRequestFailed { .. } => ai.push(event),
                event @ BridgeEvent::MessageFailed { .. } => sends.push(event),
                BridgeEvent::ConnectionStateChanged {
                    state: ConnectionState::Disconnected,
                    ..
                } => return (ai, sends),
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("session never reported Disconnected")
}

fn failed_ids(sends: &[BridgeEvent]) -> Vec<u64> {
    sends
        .iter()
        .map(|e| match e {
            BridgeEvent::MessageFailed { message, reason } => {
                assert!(reason.contains("discarded"), "reason: {}", reason);
                message.id
            }
            other => panic!("unexpected {:?}", other),
        })
        .collect()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// End-to-End AI Flow
// ============================================================================

#[tokio::test]
async fn test_summarize_channel_end_to_end() {
    let config = base_config()
        .ai_prefix("@ai")
        .context_window(5)
        .channel(0, "LongFast", false)
        .build();
    let mut h = start(
        MockCompletionService::new().with_answer("Alice and Bob are planning a hike."),
        config,
    )
    .await;

    h.radio.inject(node_info_frame(ALICE, 1, "Alice", "ALC"));
    h.radio.inject(text_frame(ALICE, BROADCAST_ADDR, 0, 2, "hike tomorrow at 9?"));
    h.radio.inject(text_frame(BOB, BROADCAST_ADDR, 0, 3, "sure, meet at the trailhead"));
    h.radio.inject(text_frame(BOB, BROADCAST_ADDR, 0, 4, "@ai summarize channel"));

    let reply = match next_of(&mut h.events, EventKind::AiReplyGenerated).await {
        BridgeEvent::AiReplyGenerated { channel, reply, .. } => {
            assert_eq!(channel, 0);
            reply
        }
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(reply, "@!33334444 Alice and Bob are planning a hike.");

    let sent = match next_of(&mut h.events, EventKind::MessageSent).await {
        BridgeEvent::MessageSent { message } => message,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(sent.text, reply);
    assert_eq!(sent.to, BROADCAST_ADDR);
    assert_eq!(sent.channel, 0);
    assert_eq!(h.radio.written_texts(), vec![reply.clone()]);

    let prompt = &h.service.prompts()[0];
    assert!(prompt.starts_with("Date and time: "));
    assert!(prompt.contains("Recent messages on channel 0:\nAlice: hike tomorrow at 9?\n"));
    assert!(prompt.contains("!33334444: sure, meet at the trailhead\n"));
    assert!(!prompt.contains("@ai summarize"));
    assert!(prompt.ends_with("Answer concisely in under 120 chars: summarize channel"));

    // The reply is part of the channel history
    let snapshot = h.handle.snapshot().await.unwrap().unwrap();
    let channel = snapshot.channels.iter().find(|c| c.index == 0).unwrap();
    assert_eq!(channel.name, "LongFast");
    let last = channel.history.back().unwrap();
    assert_eq!(last.from, LOCAL);
    assert_eq!(last.delivery, DeliveryState::Sent);
}

#[tokio::test]
async fn test_direct_message_answered_privately() {
    let config = base_config().build();
    let mut h = start(MockCompletionService::new().with_answer("pong"), config).await;

    h.radio.inject(text_frame(ALICE, LOCAL, 0, 10, "/ai ping"));

    let sent = match next_of(&mut h.events, EventKind::MessageSent).await {
        BridgeEvent::MessageSent { message } => message,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(sent.to, ALICE);
    assert_eq!(sent.text, "@!11112222 pong");
}

#[tokio::test]
async fn test_auto_respond_channel_and_non_triggers() {
    let config = base_config().channel(3, "Bot", true).build();
    let mut h = start(MockCompletionService::new().with_answer("ok"), config).await;

    // Plain chatter elsewhere is ignored
    h.radio.inject(text_frame(ALICE, BROADCAST_ADDR, 1, 20, "just chatting"));
    // Every message on an auto-respond channel is answered
    h.radio.inject(text_frame(ALICE, BROADCAST_ADDR, 3, 21, "what is LoRa?"));

    match next_of(&mut h.events, EventKind::AiReplyGenerated).await {
        BridgeEvent::AiReplyGenerated { channel, .. } => assert_eq!(channel, 3),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.service.calls(), 1);

    h.handle.set_auto_respond(3, false).await.unwrap();
    h.radio.inject(text_frame(ALICE, BROADCAST_ADDR, 3, 22, "still there?"));
    match next_of(&mut h.events, EventKind::MessageReceived).await {
        BridgeEvent::MessageReceived { message } => assert_eq!(message.text, "still there?"),
        other => panic!("unexpected {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.service.calls(), 1);
}

#[tokio::test]
async fn test_rebroadcast_answered_once() {
    let config = base_config().build();
    let mut h = start(MockCompletionService::new(), config).await;

    let frame = text_frame(ALICE, BROADCAST_ADDR, 0, 30, "/AI weather?");
    h.radio.inject(frame.clone());
    h.radio.inject(frame.clone());
    h.radio.inject(frame);

    next_of(&mut h.events, EventKind::MessageSent).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.service.calls(), 1);
    assert_eq!(h.handle.stats().await.unwrap().duplicates_blocked, 2);
}

#[tokio::test]
async fn test_service_error_surfaces_as_notification() {
    let config = base_config().build();
    let mut h = start(MockCompletionService::new().failing("model crashed"), config).await;

    h.radio.inject(text_frame(ALICE, BROADCAST_ADDR, 0, 40, "/AI hi"));
    match next_of(&mut h.events, EventKind::AiRequestFailed).await {
        BridgeEvent::AiRequestFailed { state, reason, .. } => {
            assert_eq!(state, AiRequestState::Failed);
            assert!(reason.contains("model crashed"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.service.calls(), 1);
    assert!(h.radio.written().is_empty());
}

// ============================================================================
// Concurrency and Ordering
// ============================================================================

#[tokio::test]
async fn test_ai_concurrency_bound() {
    let config = base_config().max_in_flight(2).build();
    let mut h = start(
        MockCompletionService::new().with_delay(Duration::from_millis(100)),
        config,
    )
    .await;

    for i in 0..5u32 {
        h.radio
            .inject(text_frame(ALICE, BROADCAST_ADDR, 0, 100 + i, &format!("/AI q{}", i)));
    }

    collect(&mut h.events, EventKind::AiReplyGenerated, 5).await;
    assert_eq!(h.service.calls(), 5);
    assert_eq!(h.service.max_concurrent(), 2);
    assert_eq!(h.handle.stats().await.unwrap().ai.peak_in_flight, 2);
}

#[tokio::test]
async fn test_same_channel_replies_in_completion_order() {
    let config = base_config().max_in_flight(2).build();
    let service = MockCompletionService::new()
        .with_script("slow question", Duration::from_millis(300), "slow answer")
        .with_script("fast question", Duration::from_millis(20), "fast answer");
    let mut h = start(service, config).await;

    h.radio
        .inject(text_frame(ALICE, BROADCAST_ADDR, 0, 200, "/AI slow question"));
    h.radio
        .inject(text_frame(BOB, BROADCAST_ADDR, 0, 201, "/AI fast question"));

    let sent = collect(&mut h.events, EventKind::MessageSent, 2).await;
    let texts: Vec<String> = sent
        .into_iter()
        .map(|e| match e {
            BridgeEvent::MessageSent { message } => message.text,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(texts, vec!["@!33334444 fast answer", "@!11112222 slow answer"]);
    assert_eq!(
        h.radio.written_texts(),
        vec!["@!33334444 fast answer", "@!11112222 slow answer"]
    );
}

#[tokio::test]
async fn test_outbound_keeps_submission_order() {
    let config = base_config().min_spacing(Duration::from_millis(20)).build();
    let mut h = start(MockCompletionService::new(), config).await;

    for i in 0..4 {
        h.handle.send_message(1, format!("msg {}", i)).await.unwrap();
    }
    collect(&mut h.events, EventKind::MessageSent, 4).await;
    assert_eq!(
        h.radio.written_texts(),
        vec!["msg 0", "msg 1", "msg 2", "msg 3"]
    );
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_disconnect_mid_flight_fails_every_request() {
    let config = base_config().max_in_flight(2).build();
    let mut h = start(
        MockCompletionService::new().with_delay(Duration::from_secs(60)),
        config,
    )
    .await;

    for i in 0..5u32 {
        h.radio
            .inject(text_frame(ALICE, BROADCAST_ADDR, 0, 300 + i, &format!("/AI q{}", i)));
    }
    collect(&mut h.events, EventKind::MessageReceived, 5).await;
    let service = Arc::clone(&h.service);
    wait_until(|| service.calls() == 2).await;

    let started = tokio::time::Instant::now();
    h.handle.disconnect().await.unwrap();

    let failed = collect(&mut h.events, EventKind::AiRequestFailed, 5).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let mut ids = Vec::new();
    for event in failed {
        match event {
            BridgeEvent::AiRequestFailed {
                request_id,
                state,
                reason,
                ..
            } => {
                assert_eq!(state, AiRequestState::Failed);
                assert!(reason.contains("session closed"));
                ids.push(request_id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    match next_of(&mut h.events, EventKind::ConnectionStateChanged).await {
        BridgeEvent::ConnectionStateChanged { state, .. } => {
            assert_eq!(state, ConnectionState::Disconnected)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.radio.written().is_empty());
}

#[tokio::test]
async fn test_disconnect_settles_ai_requests_and_queued_sends() {
    let config = base_config()
        .max_in_flight(2)
        .min_spacing(Duration::from_secs(30))
        .build();
    let mut h = start(
        MockCompletionService::new().with_delay(Duration::from_secs(60)),
        config,
    )
    .await;

    for i in 0..2u32 {
        h.radio
            .inject(text_frame(ALICE, BROADCAST_ADDR, 0, 500 + i, &format!("/AI q{}", i)));
    }
    let service = Arc::clone(&h.service);
    wait_until(|| service.calls() == 2).await;

    // The first send takes the airtime slot; the next three wait behind it
    h.handle.send_message(1, "on air").await.unwrap();
    next_of(&mut h.events, EventKind::MessageSent).await;
    let mut queued = Vec::new();
    for i in 0..3 {
        queued.push(h.handle.send_message(1, format!("queued {}", i)).await.unwrap());
    }

    let started = tokio::time::Instant::now();
    h.handle.disconnect().await.unwrap();
    let (ai, sends) = settle_after_disconnect(&mut h.events).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(ai.len(), 2);
    for event in &ai {
        match event {
            BridgeEvent::AiRequestFailed { state, reason, .. } => {
                assert_eq!(*state, AiRequestState::Failed);
                assert!(reason.contains("session closed"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(failed_ids(&sends), queued);
    assert_eq!(h.radio.written_texts(), vec!["on air"]);
}

#[tokio::test]
async fn test_disconnect_while_link_degraded_fails_pending_sends() {
    let config = base_config().max_in_flight(2).build();
    let mut h = start(
        MockCompletionService::new().with_delay(Duration::from_secs(60)),
        config,
    )
    .await;

    for i in 0..2u32 {
        h.radio
            .inject(text_frame(ALICE, BROADCAST_ADDR, 0, 600 + i, &format!("/AI q{}", i)));
    }
    let service = Arc::clone(&h.service);
    wait_until(|| service.calls() == 2).await;

    // Radio drops and will not come back
    h.radio.fail_connects(true);
    h.radio.close_link();
    loop {
        if let BridgeEvent::ConnectionStateChanged {
            state: ConnectionState::Degraded,
            ..
        } = next_of(&mut h.events, EventKind::ConnectionStateChanged).await
        {
            break;
        }
    }

    let mut pending = Vec::new();
    for i in 0..3 {
        pending.push(h.handle.send_message(0, format!("pending {}", i)).await.unwrap());
    }
    // The head message is now stuck in its write and retry cycle
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = tokio::time::Instant::now();
    h.handle.disconnect().await.unwrap();
    let (ai, sends) = settle_after_disconnect(&mut h.events).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(ai.len(), 2);
    assert_eq!(failed_ids(&sends), pending);
    assert!(h.radio.written_texts().is_empty());
}

#[tokio::test]
async fn test_disconnect_discards_queued_sends_with_notification() {
    let config = base_config().min_spacing(Duration::from_secs(30)).build();
    let mut h = start(MockCompletionService::new(), config).await;

    let first = h.handle.send_message(0, "first").await.unwrap();
    let second = h.handle.send_message(0, "second").await.unwrap();
    let third = h.handle.send_message(0, "third").await.unwrap();
    next_of(&mut h.events, EventKind::MessageSent).await;

    h.handle.disconnect().await.unwrap();
    let failed = collect(&mut h.events, EventKind::MessageFailed, 2).await;
    let ids: Vec<u64> = failed
        .iter()
        .map(|e| match e {
            BridgeEvent::MessageFailed { message, reason } => {
                assert!(reason.contains("discarded"));
                message.id
            }
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(ids, vec![second, third]);
    assert_ne!(first, second);
    assert_eq!(h.radio.written_texts(), vec!["first"]);
}

// ============================================================================
// Registry and Delivery
// ============================================================================

#[tokio::test]
async fn test_channel_history_bound() {
    let config = base_config().history_capacity(3).ai_enabled(false).build();
    let mut h = start(MockCompletionService::new(), config).await;

    for i in 0..6u32 {
        h.radio
            .inject(text_frame(ALICE, BROADCAST_ADDR, 2, 400 + i, &format!("line {}", i)));
    }
    collect(&mut h.events, EventKind::MessageReceived, 6).await;

    let snapshot = h.handle.snapshot().await.unwrap().unwrap();
    let channel = snapshot.channels.iter().find(|c| c.index == 2).unwrap();
    let texts: Vec<&str> = channel.history.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["line 3", "line 4", "line 5"]);
    assert_eq!(h.service.calls(), 0);
}

#[tokio::test]
async fn test_telemetry_updates_node() {
    let config = base_config().build();
    let mut h = start(MockCompletionService::new(), config).await;

    h.radio.inject(telemetry_frame(BOB, 500, 64));
    match next_of(&mut h.events, EventKind::TelemetryReceived).await {
        BridgeEvent::TelemetryReceived { node, telemetry } => {
            assert_eq!(node, BOB);
            assert_eq!(telemetry.battery_level, 64);
        }
        other => panic!("unexpected {:?}", other),
    }
    let snapshot = h.handle.snapshot().await.unwrap().unwrap();
    let bob = snapshot.nodes.iter().find(|n| n.id == BOB).unwrap();
    assert_eq!(bob.telemetry.map(|t| t.battery_level), Some(64));
}

#[tokio::test]
async fn test_ack_and_routing_failure() {
    let config = base_config().build();
    let mut h = start(MockCompletionService::new(), config).await;

    h.handle.send_direct(0, BOB, "delivered?").await.unwrap();
    h.handle.send_message(0, "lost").await.unwrap();
    let sent = collect(&mut h.events, EventKind::MessageSent, 2).await;
    let packets: Vec<u32> = sent
        .iter()
        .map(|e| match e {
            BridgeEvent::MessageSent { message } => message.packet_id,
            other => panic!("unexpected {:?}", other),
        })
        .collect();

    h.radio.inject(ack_frame(packets[0], 0));
    match next_of(&mut h.events, EventKind::MessageAcked).await {
        BridgeEvent::MessageAcked { message } => assert_eq!(message.to, BOB),
        other => panic!("unexpected {:?}", other),
    }

    h.radio.inject(ack_frame(packets[1], 5));
    match next_of(&mut h.events, EventKind::MessageFailed).await {
        BridgeEvent::MessageFailed { message, reason } => {
            assert_eq!(message.delivery, DeliveryState::Failed);
            assert!(reason.contains("routing error 5"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_write_failures_exhaust_retries() {
    let config = base_config()
        .outbound_retries(2, Duration::from_millis(5))
        .build();
    let mut h = start(MockCompletionService::new(), config).await;

    h.radio.fail_writes(100);
    let id = h.handle.send_message(0, "never arrives").await.unwrap();
    match next_of(&mut h.events, EventKind::MessageFailed).await {
        BridgeEvent::MessageFailed { message, .. } => assert_eq!(message.id, id),
        other => panic!("unexpected {:?}", other),
    }
    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.outbound.retries, 2);
    assert_eq!(stats.outbound.failed, 1);
}

#[tokio::test]
async fn test_send_rejects_oversized_text() {
    let config = base_config().build();
    let h = start(MockCompletionService::new(), config).await;

    let err = h.handle.send_message(0, "x".repeat(201)).await.unwrap_err();
    assert!(matches!(err, MeshError::MessageTooLarge { size: 201, max: 200 }));
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_connect_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meshtastic-ai-config.json");
    std::fs::write(
        &path,
        r#"{
            "interface": { "type": "tcp", "host": "radio.local", "port": 4403 },
            "ai": { "model": "mistral", "prefix": "@bot", "timeout": "30s" },
            "outbound": { "min_spacing": "10ms" }
        }"#,
    )
    .unwrap();

    let config = BridgeConfig::load(&path).unwrap();
    assert_eq!(config.ai.model, "mistral");
    assert_eq!(config.ai.timeout, Duration::from_secs(30));
    assert_eq!(config.outbound.min_spacing, Duration::from_millis(10));

    let mut h = start(MockCompletionService::new().with_answer("hi"), config).await;
    h.radio.inject(text_frame(ALICE, BROADCAST_ADDR, 0, 600, "@BOT hello"));
    match next_of(&mut h.events, EventKind::AiReplyGenerated).await {
        BridgeEvent::AiReplyGenerated { reply, .. } => assert_eq!(reply, "@!11112222 hi"),
        other => panic!("unexpected {:?}", other),
    }
}
