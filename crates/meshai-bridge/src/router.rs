//! Event router
//!
//! Fans published [`BridgeEvent`]s out to subscribers. Each subscriber owns
//! its own queue, so a slow consumer only ever loses its own events (under
//! [`OverflowPolicy::DropOldest`]) and the publisher never waits.
//!
//! Publishing is serialized, so every subscriber observes events in the
//! same order they were published.

use futures::task::AtomicWaker;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{trace, warn};

use crate::config::{OverflowPolicy, RouterConfig};
use crate::event::{BridgeEvent, EventKind};

#[derive(Debug)]
struct Subscriber {
    id: u64,
    kinds: Option<HashSet<EventKind>>,
    queue: Mutex<VecDeque<BridgeEvent>>,
    waker: AtomicWaker,
    dropped: AtomicU64,
    unsubscribed: AtomicBool,
    router_closed: AtomicBool,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

/// Event router with per-subscriber queues
#[derive(Debug)]
pub struct EventRouter {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    config: RouterConfig,
    next_id: AtomicU64,
    published: AtomicU64,
    closed: AtomicBool,
}

impl EventRouter {
    /// Create a router
    pub fn new(config: RouterConfig) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            config,
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to the given event kinds
    pub fn subscribe(&self, kinds: impl IntoIterator<Item = EventKind>) -> Subscription {
        self.add_subscriber(Some(kinds.into_iter().collect()))
    }

    /// Subscribe to every event
    pub fn subscribe_all(&self) -> Subscription {
        self.add_subscriber(None)
    }

    fn add_subscriber(&self, kinds: Option<HashSet<EventKind>>) -> Subscription {
        let shared = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kinds,
            queue: Mutex::new(VecDeque::new()),
            waker: AtomicWaker::new(),
            dropped: AtomicU64::new(0),
            unsubscribed: AtomicBool::new(false),
            router_closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
        });
        self.subscribers.lock().push(Arc::clone(&shared));
        trace!(subscriber = shared.id, "Subscriber added");
        Subscription { shared }
    }

    /// Deliver an event to every interested subscriber
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        if self.closed.load(Ordering::Acquire) {
            trace!(kind = ?event.kind(), "Router closed, event discarded");
            return 0;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.unsubscribed.load(Ordering::Acquire));

        let mut delivered = 0;
        for sub in subscribers.iter().filter(|s| s.wants(kind)) {
            {
                let mut queue = sub.queue.lock();
                if self.config.overflow == OverflowPolicy::DropOldest
                    && queue.len() >= self.config.subscriber_capacity
                {
                    queue.pop_front();
                    let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total.is_power_of_two() {
                        warn!(subscriber = sub.id, dropped = total, "Slow subscriber, dropping oldest events");
                    }
                }
                queue.push_back(event.clone());
            }
            sub.waker.wake();
            delivered += 1;
        }
        delivered
    }

    /// End every subscription once its queue drains
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for sub in self.subscribers.lock().iter() {
            sub.router_closed.store(true, Ordering::Release);
            sub.waker.wake();
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| !s.unsubscribed.load(Ordering::Acquire))
            .count()
    }

    /// Total events published
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Total events dropped across all live subscribers
    pub fn dropped_count(&self) -> u64 {
        self.subscribers
            .lock()
            .iter()
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

/// A lazy, per-subscriber sequence of events
///
/// Ends when the router is closed and every queued event was consumed.
#[derive(Debug)]
pub struct Subscription {
    shared: Arc<Subscriber>,
}

impl Subscription {
    /// Take the next event without waiting
    pub fn try_next(&mut self) -> Option<BridgeEvent> {
        self.shared.queue.lock().pop_front()
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        futures::StreamExt::next(self).await
    }

    /// Events this subscriber lost to the overflow policy
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Events waiting to be consumed
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Stream for Subscription {
    type Item = BridgeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let shared = &self.shared;
        if let Some(event) = shared.queue.lock().pop_front() {
            return Poll::Ready(Some(event));
        }

        shared.waker.register(cx.waker());

        // Re-check after registering so a concurrent publish is not missed
        if let Some(event) = shared.queue.lock().pop_front() {
            return Poll::Ready(Some(event));
        }
        if shared.router_closed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.unsubscribed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::interface::ConnectionState;
    use futures::StreamExt;

    fn state_event(n: usize) -> BridgeEvent {
        BridgeEvent::ConnectionStateChanged {
            state: ConnectionState::Connected,
            transport: TransportKind::Tcp,
            target: format!("host-{}", n),
            reason: None,
        }
    }

    fn telemetry_event(node: u32) -> BridgeEvent {
        BridgeEvent::TelemetryReceived {
            node,
            telemetry: crate::codec::TelemetrySnapshot {
                battery_level: 50,
                voltage_mv: 3900,
                channel_utilization_x100: 0,
                air_util_tx_x100: 0,
                uptime_seconds: 1,
            },
        }
    }

    fn target(event: &BridgeEvent) -> String {
        match event {
            BridgeEvent::ConnectionStateChanged { target, .. } => target.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_matches_publish_order() {
        let router = EventRouter::default();
        let mut a = router.subscribe_all();
        let mut b = router.subscribe_all();

        for n in 0..10 {
            router.publish(state_event(n));
        }
        for n in 0..10 {
            assert_eq!(target(&a.recv().await.unwrap()), format!("host-{}", n));
        }
        // b is independent of a
        assert_eq!(b.pending(), 10);
        assert_eq!(target(&b.next().await.unwrap()), "host-0");
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let router = EventRouter::default();
        let mut telemetry = router.subscribe([EventKind::TelemetryReceived]);

        router.publish(state_event(1));
        router.publish(telemetry_event(9));

        assert_eq!(telemetry.recv().await.unwrap().kind(), EventKind::TelemetryReceived);
        assert!(telemetry.try_next().is_none());
    }

    #[test]
    fn test_drop_oldest_never_blocks_publisher() {
        let router = EventRouter::new(RouterConfig {
            overflow: OverflowPolicy::DropOldest,
            subscriber_capacity: 3,
        });
        let mut slow = router.subscribe_all();

        for n in 0..10 {
            router.publish(state_event(n));
        }
        assert_eq!(slow.pending(), 3);
        assert_eq!(slow.dropped(), 7);
        assert_eq!(router.dropped_count(), 7);
        assert_eq!(target(&slow.try_next().unwrap()), "host-7");
    }

    #[test]
    fn test_buffered_keeps_everything() {
        let router = EventRouter::new(RouterConfig {
            overflow: OverflowPolicy::Buffered,
            subscriber_capacity: 1,
        });
        let slow = router.subscribe_all();
        for n in 0..100 {
            router.publish(state_event(n));
        }
        assert_eq!(slow.pending(), 100);
        assert_eq!(slow.dropped(), 0);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let router = EventRouter::default();
        let sub = router.subscribe_all();
        let _keep = router.subscribe_all();
        assert_eq!(router.subscriber_count(), 2);

        drop(sub);
        assert_eq!(router.publish(state_event(0)), 1);
        assert_eq!(router.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_stream_after_drain() {
        let router = Arc::new(EventRouter::default());
        let mut sub = router.subscribe_all();

        let waiter = tokio::spawn(async move {
            let mut seen = 0;
            while sub.next().await.is_some() {
                seen += 1;
            }
            seen
        });

        router.publish(state_event(0));
        router.publish(state_event(1));
        tokio::task::yield_now().await;
        router.close();
        assert_eq!(router.publish(state_event(2)), 0);

        assert_eq!(waiter.await.unwrap(), 2);
    }
}
