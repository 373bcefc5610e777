//! Channel-keyed pub/sub fan-out.
//!
//! Publishers enqueue onto one bounded ingress queue; a single dispatcher
//! task fans each event out to the channel's subscribers with a non-blocking
//! send. **A subscriber whose queue is full has the event dropped silently.**
//! That drop is the delivery contract, not an accident: there is no retry
//! and no buffering beyond each subscriber's bounded queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Capacity of the ingress queue. Publishers block once it is full.
pub const INGRESS_CAPACITY: usize = 256;

/// Capacity of each subscriber's event queue.
pub const SUBSCRIBER_CAPACITY: usize = 16;

/// One published event as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEvent {
    pub channel: String,
    pub event: String,
    /// JSON-serialized payload.
    pub data: Vec<u8>,
}

struct SubscriberEntry {
    tx: mpsc::Sender<HubEvent>,
    done: oneshot::Sender<()>,
}

type ChannelMap = HashMap<String, HashMap<u64, SubscriberEntry>>;

/// A registered subscriber's receiving side.
///
/// Events arrive in publish order, minus any the subscriber was too slow to
/// take. The termination signal fires when [`EventHub::unsubscribe`] removes
/// this handle; only the hub closes it.
pub struct Subscription {
    id: u64,
    channel: String,
    events: mpsc::Receiver<HubEvent>,
    done: Option<oneshot::Receiver<()>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The next event, or `None` once the subscription is terminated.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        let Some(mut done) = self.done.take() else {
            return None;
        };
        tokio::select! {
            event = self.events.recv() => {
                self.done = Some(done);
                event
            }
            _ = &mut done => None,
        }
    }

    /// A pending event, if one is queued right now.
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.events.try_recv().ok()
    }
}

/// The pub/sub hub. Create once at startup; runs until process exit.
pub struct EventHub {
    subscribers: Arc<RwLock<ChannelMap>>,
    ingress: mpsc::Sender<HubEvent>,
    next_id: AtomicU64,
}

impl EventHub {
    /// Creates the hub and starts its dispatcher task.
    pub fn new() -> Self {
        let (ingress, mut ingress_rx) = mpsc::channel::<HubEvent>(INGRESS_CAPACITY);
        let subscribers: Arc<RwLock<ChannelMap>> = Arc::new(RwLock::new(HashMap::new()));

        let fanout = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(event) = ingress_rx.recv().await {
                let map = fanout.read();
                if let Some(subs) = map.get(&event.channel) {
                    for entry in subs.values() {
                        // Slow subscribers lose the event, nothing blocks.
                        let _ = entry.tx.try_send(event.clone());
                    }
                }
            }
        });

        Self {
            subscribers,
            ingress,
            next_id: AtomicU64::new(0),
        }
    }

    /// JSON-encodes `payload` and enqueues it for fan-out. Returns once the
    /// event is on the ingress queue, blocking while that queue is full.
    /// Payloads that fail to encode are logged and dropped.
    pub async fn publish<T: Serialize>(&self, channel: &str, event: &str, payload: &T) {
        let data = match serde_json::to_vec(payload) {
            Ok(data) => data,
            Err(err) => {
                warn!(channel, error = %err, "dropping event that failed to encode");
                return;
            }
        };

        let event = HubEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            data,
        };
        if self.ingress.send(event).await.is_err() {
            warn!("event hub dispatcher is gone, event dropped");
        }
    }

    /// Registers a subscriber on `channel` and returns its handle.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();

        self.subscribers
            .write()
            .entry(channel.to_string())
            .or_default()
            .insert(id, SubscriberEntry { tx, done: done_tx });

        Subscription {
            id,
            channel: channel.to_string(),
            events,
            done: Some(done_rx),
        }
    }

    /// Removes subscriber `id` from `channel` and fires its termination
    /// signal. The channel entry disappears with its last subscriber.
    /// Unknown ids are a no-op.
    pub fn unsubscribe(&self, channel: &str, id: u64) {
        let mut map = self.subscribers.write();
        if let Some(subs) = map.get_mut(channel) {
            if let Some(entry) = subs.remove(&id) {
                let _ = entry.done.send(());
            }
            if subs.is_empty() {
                map.remove(channel);
            }
        }
    }

    /// Number of subscribers currently registered on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .read()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        // Give the dispatcher task a chance to drain the ingress queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("jobs");

        hub.publish("jobs", "started", &serde_json::json!({"id": 7}))
            .await;

        let event = sub.recv().await.expect("event should arrive");
        assert_eq!(event.channel, "jobs");
        assert_eq!(event.event, "started");
        assert_eq!(event.data, br#"{"id":7}"#);
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("jobs");

        for i in 0..5 {
            hub.publish("jobs", "tick", &i).await;
        }
        settle().await;

        for i in 0..5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.data, i.to_string().as_bytes());
        }
    }

    #[tokio::test]
    async fn events_only_reach_their_channel() {
        let hub = EventHub::new();
        let mut jobs = hub.subscribe("jobs");
        let mut builds = hub.subscribe("builds");

        hub.publish("jobs", "started", &1).await;
        settle().await;

        assert!(jobs.try_recv().is_some());
        assert!(builds.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_excess_events() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("firehose");

        // Never consume while publishing well past the queue depth.
        for i in 0..(SUBSCRIBER_CAPACITY * 3) {
            hub.publish("firehose", "tick", &i).await;
        }
        settle().await;

        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_CAPACITY);

        // The first events won; the overflow was dropped with no gap marker.
        let mut sub2 = hub.subscribe("firehose");
        hub.publish("firehose", "after", &0).await;
        settle().await;
        assert!(sub2.try_recv().is_some());
    }

    #[tokio::test]
    async fn fanout_reaches_every_subscriber() {
        let hub = EventHub::new();
        let mut a = hub.subscribe("jobs");
        let mut b = hub.subscribe("jobs");

        hub.publish("jobs", "started", &1).await;
        settle().await;

        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_some());
    }

    #[tokio::test]
    async fn unsubscribe_fires_termination_signal() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("jobs");

        hub.unsubscribe("jobs", sub.id());

        assert!(sub.recv().await.is_none());
        // Terminated subscriptions stay terminated.
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_empty_channel() {
        let hub = EventHub::new();
        let a = hub.subscribe("jobs");
        let b = hub.subscribe("jobs");
        assert_eq!(hub.subscriber_count("jobs"), 2);

        hub.unsubscribe("jobs", a.id());
        assert_eq!(hub.subscriber_count("jobs"), 1);

        hub.unsubscribe("jobs", b.id());
        assert_eq!(hub.subscriber_count("jobs"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_is_noop() {
        let hub = EventHub::new();
        let _sub = hub.subscribe("jobs");
        hub.unsubscribe("jobs", 999);
        hub.unsubscribe("ghosts", 0);
        assert_eq!(hub.subscriber_count("jobs"), 1);
    }

    #[tokio::test]
    async fn publish_to_channel_without_subscribers_is_fine() {
        let hub = EventHub::new();
        hub.publish("nobody-home", "tick", &1).await;
        settle().await;
    }
}
