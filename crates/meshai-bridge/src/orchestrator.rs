//! AI response orchestrator
//!
//! Decides which inbound messages deserve an AI reply, builds a bounded
//! prompt from channel history and runs completions without ever blocking
//! the mesh read path.
//!
//! # Request lifecycle
//!
//! ```text
//! Queued ──> InFlight ──> Completed
//!                    ├──> TimedOut   (after at most one retry)
//!                    └──> Failed     (service error or cancellation)
//! ```
//!
//! At most `max_in_flight` requests run at once; further triggers wait in
//! FIFO order. Replies are handed to the outbound queue in **completion
//! order**: a quick answer to a later question is sent before a slow answer
//! to an earlier one, even on the same channel.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AiConfig, BROADCAST_ADDR};
use crate::error::{MeshError, Result};
use crate::event::BridgeEvent;
use crate::registry::{node_id_string, Message, MessageId, Registry};
use crate::router::EventRouter;

/// AI request correlation id, unique for the process lifetime
pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reply used when the model returns nothing
pub const EMPTY_ANSWER: &str = "No response.";

/// A text completion backend
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Complete `prompt`, returning the model's answer
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Backend name (for logging)
    fn name(&self) -> &str;
}

/// Where finished replies go
pub trait ReplySink: Send + Sync {
    /// Queue `text` for transmission on `channel` to `to`
    fn send_reply(&self, channel: u8, to: u32, text: String) -> Result<MessageId>;
}

/// State of an AI request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiRequestState {
    /// Waiting for a free slot
    Queued,
    /// Completion running
    InFlight,
    /// Reply produced
    Completed,
    /// No answer within the timeout
    TimedOut,
    /// Service error or cancellation
    Failed,
}

impl AiRequestState {
    /// Check if the request has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AiRequestState::Completed | AiRequestState::TimedOut | AiRequestState::Failed
        )
    }
}

/// Why a message triggered the AI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Text started with the trigger prefix
    Prefix,
    /// Direct message to the local node
    Direct,
    /// Channel answers everything
    AutoRespond,
}

/// A decision to answer a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Why
    pub kind: TriggerKind,
    /// Question text sent to the model
    pub question: String,
    /// Reply destination (`BROADCAST_ADDR` for the channel)
    pub reply_to: u32,
}

/// One AI request
#[derive(Debug, Clone)]
pub struct AiRequest {
    /// Correlation id
    pub id: RequestId,
    /// Triggering message
    pub source: Message,
    /// Trigger decision
    pub trigger: Trigger,
    /// Full prompt
    pub prompt: String,
    /// Current state
    pub state: AiRequestState,
    /// Completion attempts made
    pub attempts: u32,
}

/// Orchestrator counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Requests created
    pub triggered: u64,
    /// Replies produced
    pub completed: u64,
    /// Requests that timed out
    pub timed_out: u64,
    /// Requests that failed (including cancellations)
    pub failed: u64,
    /// Timeouts retried
    pub retries: u64,
    /// Highest simultaneous in-flight count observed
    pub peak_in_flight: usize,
}

enum Outcome {
    Completed(String),
    TimedOut(String),
    Failed(String),
}

struct Active {
    request: AiRequest,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<AiRequest>,
    active: HashMap<RequestId, Active>,
    closed: bool,
    stats: OrchestratorStats,
}

/// Check `text` for the trigger prefix, returning the trimmed question
pub fn strip_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let text = text.trim_start();
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(text[prefix.len()..].trim())
    } else {
        None
    }
}

/// Build the model prompt
pub fn build_prompt(
    now: NaiveDateTime,
    channel: u8,
    context: &[(String, String)],
    question: &str,
) -> String {
    let mut prompt = format!("Date and time: {}.\n", now.format("%A, %Y-%m-%d %H:%M:%S"));
    if !context.is_empty() {
        prompt.push_str(&format!("Recent messages on channel {}:\n", channel));
        for (sender, text) in context {
            prompt.push_str(&format!("{}: {}\n", sender, text));
        }
    }
    prompt.push_str(&format!(
        "Answer concisely in under 120 chars: {}",
        question
    ));
    prompt
}

/// Cut `text` to at most `max_bytes`, ending in `...` when shortened
pub fn truncate_reply(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

/// Build the reply sent to the mesh
pub fn format_reply(sender: u32, answer: &str, max_bytes: usize) -> String {
    let answer = answer.trim();
    let answer = if answer.is_empty() { EMPTY_ANSWER } else { answer };
    truncate_reply(&format!("@{} {}", node_id_string(sender), answer), max_bytes)
}

/// AI response orchestrator
pub struct Orchestrator {
    config: AiConfig,
    service: Arc<dyn CompletionService>,
    registry: Arc<Registry>,
    router: Arc<EventRouter>,
    sink: Arc<dyn ReplySink>,
    dispatch: Mutex<Dispatch>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("service", &self.service.name())
            .field("max_in_flight", &self.config.max_in_flight)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(
        config: AiConfig,
        service: Arc<dyn CompletionService>,
        registry: Arc<Registry>,
        router: Arc<EventRouter>,
        sink: Arc<dyn ReplySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            service,
            registry,
            router,
            sink,
            dispatch: Mutex::new(Dispatch::default()),
        })
    }

    /// Decide whether `message` should be answered
    pub fn evaluate(&self, message: &Message) -> Option<Trigger> {
        if !self.config.enabled {
            return None;
        }
        let local = self.registry.local_node();
        if Some(message.from) == local {
            return None;
        }

        let direct = !message.is_broadcast() && Some(message.to) == local;
        let reply_to = if direct { message.from } else { BROADCAST_ADDR };

        if let Some(question) = strip_prefix(&message.text, &self.config.prefix) {
            if question.is_empty() {
                debug!(message = message.id, "Trigger prefix without a question");
                return None;
            }
            return Some(Trigger {
                kind: TriggerKind::Prefix,
                question: question.to_string(),
                reply_to,
            });
        }

        let question = message.text.trim();
        if question.is_empty() {
            return None;
        }
        if direct && self.config.respond_to_direct {
            return Some(Trigger {
                kind: TriggerKind::Direct,
                question: question.to_string(),
                reply_to,
            });
        }
        if self.registry.is_auto_respond(message.channel) {
            return Some(Trigger {
                kind: TriggerKind::AutoRespond,
                question: question.to_string(),
                reply_to,
            });
        }
        None
    }

    /// Evaluate an inbound message and submit a request if it triggers
    pub fn handle_message(self: &Arc<Self>, message: &Message) -> Option<RequestId> {
        let trigger = self.evaluate(message)?;
        match self.submit(message.clone(), trigger) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(error = %e, "AI request not submitted");
                None
            }
        }
    }

    /// Queue a request for `source`
    pub fn submit(self: &Arc<Self>, source: Message, trigger: Trigger) -> Result<RequestId> {
        let context = self.context_for(&source);
        let prompt = build_prompt(
            chrono::Local::now().naive_local(),
            source.channel,
            &context,
            &trigger.question,
        );

        let request = AiRequest {
            id: next_request_id(),
            source,
            trigger,
            prompt,
            state: AiRequestState::Queued,
            attempts: 0,
        };
        let id = request.id;

        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.closed {
                return Err(MeshError::Cancelled("orchestrator closed".to_string()));
            }
            dispatch.stats.triggered += 1;
            info!(
                request = id,
                channel = request.source.channel,
                from = %node_id_string(request.source.from),
                kind = ?request.trigger.kind,
                "AI request queued"
            );
            dispatch.queue.push_back(request);
        }

        self.pump();
        Ok(id)
    }

    /// Prior channel messages for the prompt, excluding the trigger itself
    fn context_for(&self, source: &Message) -> Vec<(String, String)> {
        if self.config.context_window == 0 {
            return Vec::new();
        }
        let history = self
            .registry
            .history(source.channel, self.config.context_window + 1);
        let prior: Vec<&Message> = history.iter().filter(|m| m.id != source.id).collect();
        let skip = prior.len().saturating_sub(self.config.context_window);
        prior
            .into_iter()
            .skip(skip)
            .map(|m| {
                let sender = self
                    .registry
                    .get_node(m.from)
                    .map(|n| n.display_name())
                    .unwrap_or_else(|| node_id_string(m.from));
                (sender, m.text.clone())
            })
            .collect()
    }

    /// Start queued requests while slots are free
    fn pump(self: &Arc<Self>) {
        let mut dispatch = self.dispatch.lock();
        while !dispatch.closed && dispatch.active.len() < self.config.max_in_flight.max(1) {
            let Some(mut request) = dispatch.queue.pop_front() else {
                break;
            };
            request.state = AiRequestState::InFlight;
            let id = request.id;
            let prompt = request.prompt.clone();
            dispatch.active.insert(
                id,
                Active {
                    request,
                    task: None,
                },
            );
            let in_flight = dispatch.active.len();
            if in_flight > dispatch.stats.peak_in_flight {
                dispatch.stats.peak_in_flight = in_flight;
            }

            debug!(request = id, in_flight, "AI request in flight");
            let task = tokio::spawn(Arc::clone(self).run(id, prompt));
            if let Some(active) = dispatch.active.get_mut(&id) {
                active.task = Some(task);
            }
        }
    }

    async fn run(self: Arc<Self>, id: RequestId, prompt: String) {
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            if let Some(active) = self.dispatch.lock().active.get_mut(&id) {
                active.request.attempts = attempt;
            }

            let result = tokio::time::timeout(self.config.timeout, self.service.complete(&prompt))
                .await;
            match result {
                Ok(Ok(answer)) => break Outcome::Completed(answer),
                Ok(Err(MeshError::AiTimeout { .. })) | Err(_) => {}
                Ok(Err(e)) => break Outcome::Failed(e.to_string()),
            }

            if attempt == 1 && self.config.retry_on_timeout {
                warn!(request = id, "AI completion timed out, retrying once");
                self.dispatch.lock().stats.retries += 1;
                continue;
            }
            break Outcome::TimedOut(
                MeshError::AiTimeout {
                    duration_ms: self.config.timeout.as_millis() as u64,
                }
                .to_string(),
            );
        };

        self.finish(id, outcome);
    }

    fn finish(self: &Arc<Self>, id: RequestId, outcome: Outcome) {
        {
            let mut dispatch = self.dispatch.lock();
            // Cancelled requests were already reported
            let Some(active) = dispatch.active.remove(&id) else {
                return;
            };
            let request = active.request;

            // Sink and events are fed under the lock so replies leave in
            // completion order
            match outcome {
                Outcome::Completed(answer) => {
                    let reply = format_reply(
                        request.source.from,
                        &answer,
                        self.config.reply_max_bytes,
                    );
                    match self.sink.send_reply(
                        request.source.channel,
                        request.trigger.reply_to,
                        reply.clone(),
                    ) {
                        Ok(_) => {
                            dispatch.stats.completed += 1;
                            info!(request = id, channel = request.source.channel, "AI reply queued");
                            self.router.publish(BridgeEvent::AiReplyGenerated {
                                request_id: id,
                                source: request.source.id,
                                channel: request.source.channel,
                                reply,
                            });
                        }
                        Err(e) => {
                            dispatch.stats.failed += 1;
                            self.publish_failure(&request, AiRequestState::Failed, e.to_string());
                        }
                    }
                }
                Outcome::TimedOut(reason) => {
                    dispatch.stats.timed_out += 1;
                    self.publish_failure(&request, AiRequestState::TimedOut, reason);
                }
                Outcome::Failed(reason) => {
                    dispatch.stats.failed += 1;
                    self.publish_failure(&request, AiRequestState::Failed, reason);
                }
            }
        }

        self.pump();
    }

    fn publish_failure(&self, request: &AiRequest, state: AiRequestState, reason: String) {
        warn!(request = request.id, state = ?state, reason = %reason, "AI request did not complete");
        self.router.publish(BridgeEvent::AiRequestFailed {
            request_id: request.id,
            source: request.source.id,
            channel: request.source.channel,
            state,
            reason,
        });
    }

    /// Fail every queued and in-flight request; later submissions are refused
    ///
    /// Emits one [`BridgeEvent::AiRequestFailed`] per request and returns
    /// how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut dispatch = self.dispatch.lock();
        dispatch.closed = true;

        let mut cancelled: Vec<AiRequest> = Vec::new();
        let mut active: Vec<Active> = dispatch.active.drain().map(|(_, a)| a).collect();
        active.sort_by_key(|a| a.request.id);
        for entry in active {
            if let Some(task) = entry.task {
                task.abort();
            }
            cancelled.push(entry.request);
        }
        cancelled.extend(dispatch.queue.drain(..));
        dispatch.stats.failed += cancelled.len() as u64;

        let reason = MeshError::Cancelled(reason.to_string()).to_string();
        for request in &cancelled {
            self.publish_failure(request, AiRequestState::Failed, reason.clone());
        }
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "AI requests cancelled");
        }
        cancelled.len()
    }

    /// State of a request that has not finished yet
    pub fn state_of(&self, id: RequestId) -> Option<AiRequestState> {
        let dispatch = self.dispatch.lock();
        if let Some(active) = dispatch.active.get(&id) {
            return Some(active.request.state);
        }
        dispatch
            .queue
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.state)
    }

    /// Requests currently running
    pub fn in_flight(&self) -> usize {
        self.dispatch.lock().active.len()
    }

    /// Requests waiting for a slot
    pub fn queued(&self) -> usize {
        self.dispatch.lock().queue.len()
    }

    /// Counters
    pub fn stats(&self) -> OrchestratorStats {
        self.dispatch.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelSettings, RegistryConfig};
    use crate::event::EventKind;
    use crate::registry::{DeliveryState, Observation};
    use crate::test_utils::{MockCompletionService, RecordingSink};
    use std::time::Duration;

    const LOCAL: u32 = 0x0000_AAAA;
    const ALICE: u32 = 0x1234_5678;

    fn setup(
        config: AiConfig,
        service: Arc<MockCompletionService>,
    ) -> (Arc<Orchestrator>, Arc<Registry>, Arc<EventRouter>, Arc<RecordingSink>) {
        let settings = vec![ChannelSettings {
            index: 5,
            name: "bots".to_string(),
            key_ref: None,
            auto_respond: true,
        }];
        let registry =
            Arc::new(Registry::with_channels(RegistryConfig::default(), &settings).unwrap());
        registry.set_local_node(LOCAL);
        registry.upsert_node(&Observation::heard(ALICE));
        let router = Arc::new(EventRouter::default());
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(
            config,
            service,
            Arc::clone(&registry),
            Arc::clone(&router),
            sink.clone(),
        );
        (orchestrator, registry, router, sink)
    }

    fn message(registry: &Registry, to: u32, channel: u8, text: &str) -> Message {
        let message = Message {
            id: registry.next_message_id(),
            packet_id: rand::random(),
            from: ALICE,
            to,
            channel,
            payload: text.as_bytes().to_vec(),
            text: text.to_string(),
            timestamp: chrono::Utc::now(),
            delivery: DeliveryState::Received,
        };
        registry.append_message(message.clone()).unwrap();
        message
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("/AI what time is it", "/AI"), Some("what time is it"));
        assert_eq!(strip_prefix("  /ai   hello  ", "/AI"), Some("hello"));
        assert_eq!(strip_prefix("/AI", "/AI"), Some(""));
        assert_eq!(strip_prefix("hello /AI", "/AI"), None);
        assert_eq!(strip_prefix("é", "/AI"), None);
    }

    #[test]
    fn test_build_prompt() {
        let now = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap();
        let context = vec![("Bob".to_string(), "trail is muddy".to_string())];
        let prompt = build_prompt(now, 2, &context, "should I go?");
        assert_eq!(
            prompt,
            "Date and time: Friday, 2024-03-01 14:05:09.\n\
             Recent messages on channel 2:\n\
             Bob: trail is muddy\n\
             Answer concisely in under 120 chars: should I go?"
        );

        let bare = build_prompt(now, 2, &[], "hi");
        assert!(!bare.contains("Recent messages"));
    }

    #[test]
    fn test_reply_truncation() {
        assert_eq!(format_reply(ALICE, "  ", 200), "@!12345678 No response.");

        let long = "ü".repeat(150);
        let reply = format_reply(ALICE, &long, 200);
        assert!(reply.len() <= 200);
        assert!(reply.ends_with("..."));
        assert!(reply.starts_with("@!12345678 ü"));

        assert_eq!(truncate_reply("short", 200), "short");
    }

    #[tokio::test]
    async fn test_trigger_policy() {
        let service = Arc::new(MockCompletionService::new());
        let (orch, registry, _, _) = setup(AiConfig::default(), service);

        let m = message(&registry, BROADCAST_ADDR, 1, "/ai weather?");
        let t = orch.evaluate(&m).unwrap();
        assert_eq!(t.kind, TriggerKind::Prefix);
        assert_eq!(t.question, "weather?");
        assert_eq!(t.reply_to, BROADCAST_ADDR);

        // Empty question is ignored
        assert!(orch.evaluate(&message(&registry, BROADCAST_ADDR, 1, "/AI   ")).is_none());
        // Plain chatter is ignored
        assert!(orch.evaluate(&message(&registry, BROADCAST_ADDR, 1, "hello")).is_none());

        // Direct message to us is answered directly
        let t = orch.evaluate(&message(&registry, LOCAL, 0, "ping")).unwrap();
        assert_eq!(t.kind, TriggerKind::Direct);
        assert_eq!(t.reply_to, ALICE);

        // Auto-respond channel
        let t = orch.evaluate(&message(&registry, BROADCAST_ADDR, 5, "anyone?")).unwrap();
        assert_eq!(t.kind, TriggerKind::AutoRespond);

        // Our own messages never trigger
        let mut own = message(&registry, BROADCAST_ADDR, 1, "/AI loop?");
        own.from = LOCAL;
        assert!(orch.evaluate(&own).is_none());
    }

    #[tokio::test]
    async fn test_disabled_never_triggers() {
        let service = Arc::new(MockCompletionService::new());
        let config = AiConfig {
            enabled: false,
            ..Default::default()
        };
        let (orch, registry, _, _) = setup(config, service);
        assert!(orch.evaluate(&message(&registry, BROADCAST_ADDR, 5, "/AI hi")).is_none());
    }

    #[tokio::test]
    async fn test_reply_reaches_sink() {
        let service = Arc::new(MockCompletionService::new().with_answer("42"));
        let (orch, registry, router, sink) = setup(AiConfig::default(), service.clone());
        let mut events = router.subscribe([EventKind::AiReplyGenerated]);

        message(&registry, BROADCAST_ADDR, 1, "earlier context");
        let m = message(&registry, BROADCAST_ADDR, 1, "/AI meaning of life?");
        let id = orch.handle_message(&m).unwrap();

        match events.recv().await.unwrap() {
            BridgeEvent::AiReplyGenerated {
                request_id,
                source,
                reply,
                ..
            } => {
                assert_eq!(request_id, id);
                assert_eq!(source, m.id);
                assert_eq!(reply, "@!12345678 42");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sink.replies(), vec![(1, BROADCAST_ADDR, "@!12345678 42".to_string())]);

        let prompts = service.prompts();
        assert!(prompts[0].contains("earlier context"));
        assert!(!prompts[0].contains("/AI meaning"));
        assert!(prompts[0].ends_with("Answer concisely in under 120 chars: meaning of life?"));
        assert_eq!(orch.state_of(id), None);
    }

    #[tokio::test]
    async fn test_service_error_fails_without_retry() {
        let service = Arc::new(MockCompletionService::new().failing("model exploded"));
        let (orch, registry, router, sink) = setup(AiConfig::default(), service.clone());
        let mut events = router.subscribe([EventKind::AiRequestFailed]);

        orch.handle_message(&message(&registry, BROADCAST_ADDR, 1, "/AI hi")).unwrap();
        match events.recv().await.unwrap() {
            BridgeEvent::AiRequestFailed { state, reason, .. } => {
                assert_eq!(state, AiRequestState::Failed);
                assert!(reason.contains("model exploded"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(service.calls(), 1);
        assert!(sink.replies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_once() {
        let service = Arc::new(MockCompletionService::new().with_delay(Duration::from_secs(60)));
        let config = AiConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (orch, registry, router, _) = setup(config, service.clone());
        let mut events = router.subscribe([EventKind::AiRequestFailed]);

        orch.handle_message(&message(&registry, BROADCAST_ADDR, 1, "/AI slow")).unwrap();
        match events.recv().await.unwrap() {
            BridgeEvent::AiRequestFailed { state, .. } => {
                assert_eq!(state, AiRequestState::TimedOut)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(service.calls(), 2);
        assert_eq!(orch.stats().retries, 1);
        assert_eq!(orch.stats().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_and_fifo() {
        let service = Arc::new(MockCompletionService::new().with_delay(Duration::from_millis(100)));
        let config = AiConfig {
            max_in_flight: 2,
            ..Default::default()
        };
        let (orch, registry, router, _) = setup(config, service.clone());
        let mut events = router.subscribe([EventKind::AiReplyGenerated]);

        let ids: Vec<_> = (0..6)
            .map(|i| {
                let m = message(&registry, BROADCAST_ADDR, 1, &format!("/AI q{}", i));
                orch.handle_message(&m).unwrap()
            })
            .collect();
        assert_eq!(orch.in_flight(), 2);
        assert_eq!(orch.queued(), 4);
        assert_eq!(orch.state_of(ids[0]), Some(AiRequestState::InFlight));
        assert_eq!(orch.state_of(ids[5]), Some(AiRequestState::Queued));

        for _ in 0..6 {
            events.recv().await.unwrap();
        }
        assert_eq!(service.max_concurrent(), 2);
        assert_eq!(orch.stats().peak_in_flight, 2);

        // Queued requests were started in FIFO order, two at a time
        let prompts = service.prompts();
        assert_eq!(prompts.len(), 6);
        for (i, prompt) in prompts.iter().enumerate() {
            let wave = i / 2;
            let expected = [format!("q{}", wave * 2), format!("q{}", wave * 2 + 1)];
            assert!(
                expected.iter().any(|q| prompt.ends_with(q.as_str())),
                "prompt {} started out of order",
                i
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_in_completion_order() {
        let service = Arc::new(
            MockCompletionService::new()
                .with_script("slow", Duration::from_millis(300), "slow answer")
                .with_script("fast", Duration::from_millis(10), "fast answer"),
        );
        let (orch, registry, router, sink) = setup(AiConfig::default(), service);
        let mut events = router.subscribe([EventKind::AiReplyGenerated]);

        orch.handle_message(&message(&registry, BROADCAST_ADDR, 1, "/AI slow")).unwrap();
        orch.handle_message(&message(&registry, BROADCAST_ADDR, 1, "/AI fast")).unwrap();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        let texts: Vec<String> = sink.replies().into_iter().map(|(_, _, t)| t).collect();
        assert_eq!(texts, vec!["@!12345678 fast answer", "@!12345678 slow answer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_reports_every_request() {
        let service = Arc::new(MockCompletionService::new().with_delay(Duration::from_secs(30)));
        let config = AiConfig {
            max_in_flight: 2,
            ..Default::default()
        };
        let (orch, registry, router, sink) = setup(config, service);
        let mut events = router.subscribe([EventKind::AiRequestFailed]);

        for i in 0..5 {
            orch.handle_message(&message(&registry, BROADCAST_ADDR, 1, &format!("/AI {}", i)));
        }
        assert_eq!(orch.in_flight(), 2);
        assert_eq!(orch.queued(), 3);

        assert_eq!(orch.cancel_all("session closed"), 5);
        for _ in 0..5 {
            match events.recv().await.unwrap() {
                BridgeEvent::AiRequestFailed { state, reason, .. } => {
                    assert_eq!(state, AiRequestState::Failed);
                    assert!(reason.contains("session closed"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(events.try_next().is_none());

        // Aborted tasks never produce a late reply
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(events.try_next().is_none());
        assert!(sink.replies().is_empty());

        // Closed orchestrator refuses new work
        assert!(orch
            .handle_message(&message(&registry, BROADCAST_ADDR, 1, "/AI again"))
            .is_none());
    }
}
