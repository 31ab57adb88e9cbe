//! Broadcast hub: the registry of live subscribers and the fan-out path for
//! every outbound event.
//!
//! Each subscriber owns a bounded outbox. Delivery is `try_send`, so a slow or
//! closed subscriber never holds up the others; it is dropped from the
//! registry on its first failed delivery.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::event::{Event, Topic};

/// Outbox depth per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 256;

const WELCOME: &str = "Connected to greenhouse hub";

pub type SubscriberId = u64;

struct Subscriber {
    tx: mpsc::Sender<Arc<str>>,
    connected_at: OffsetDateTime,
    topics: HashSet<Topic>,
}

impl Subscriber {
    fn wants(&self, topic: Topic) -> bool {
        topic == Topic::System || self.topics.is_empty() || self.topics.contains(&topic)
    }
}

/// Handle returned by [`BroadcastHub::register`]. The outbox already holds
/// the connection handshake.
pub struct Subscription {
    pub id: SubscriberId,
    pub outbox: mpsc::Receiver<Arc<str>>,
}

#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, outbox) = mpsc::channel(SUBSCRIBER_QUEUE);

        let hello = Event::Connection {
            message: WELCOME.to_string(),
        };
        if let Some(payload) = encode(&hello) {
            // fresh queue, cannot be full
            let _ = tx.try_send(payload);
        }

        let mut subs = self.inner.subscribers.lock();
        subs.insert(
            id,
            Subscriber {
                tx,
                connected_at: OffsetDateTime::now_utc(),
                topics: HashSet::new(),
            },
        );
        info!(subscriber = id, total = subs.len(), "subscriber connected");
        Subscription { id, outbox }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut subs = self.inner.subscribers.lock();
        let removed = subs.remove(&id);
        if let Some(sub) = &removed {
            let secs = (OffsetDateTime::now_utc() - sub.connected_at).whole_seconds();
            info!(subscriber = id, connected_secs = secs, total = subs.len(), "subscriber disconnected");
        }
        removed.is_some()
    }

    /// Deliver `event` to every interested subscriber. Returns how many
    /// accepted it; failed subscribers are removed along the way.
    pub fn publish(&self, event: &Event) -> usize {
        let Some(payload) = encode(event) else {
            return 0;
        };
        let topic = event.topic();
        let mut delivered = 0;

        self.inner.subscribers.lock().retain(|id, sub| {
            if sub.tx.is_closed() {
                debug!(subscriber = *id, event = event.kind(), "dropping closed subscriber");
                return false;
            }
            if !sub.wants(topic) {
                return true;
            }
            match sub.tx.try_send(Arc::clone(&payload)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    debug!(subscriber = *id, event = event.kind(), error = %e, "dropping subscriber");
                    false
                }
            }
        });
        delivered
    }

    /// Send `event` to one subscriber only, regardless of its filters.
    pub fn send_to(&self, id: SubscriberId, event: &Event) -> bool {
        let Some(payload) = encode(event) else {
            return false;
        };
        let mut subs = self.inner.subscribers.lock();
        let Some(sub) = subs.get(&id) else {
            return false;
        };
        if let Err(e) = sub.tx.try_send(payload) {
            debug!(subscriber = id, error = %e, "dropping subscriber");
            subs.remove(&id);
            return false;
        }
        true
    }

    /// Handle one inbound text frame from a subscriber. Replies go to that
    /// subscriber's outbox.
    pub fn handle_message(&self, id: SubscriberId, text: &str) {
        let reply = match text.strip_prefix("subscribe:") {
            Some(topic) => self.subscribe(id, topic.trim()),
            None => match serde_json::from_str::<Value>(text) {
                Err(_) => Event::error("Invalid JSON format"),
                Ok(msg) => match msg.get("type").and_then(Value::as_str) {
                    Some("ping") => Event::Pong {},
                    Some("subscribe") => {
                        let topic = msg.get("subscription").and_then(Value::as_str).unwrap_or("");
                        self.subscribe(id, topic)
                    }
                    Some(other) => Event::error(format!("Unknown message type: {other}")),
                    None => Event::error("Unknown message type: null"),
                },
            },
        };
        self.send_to(id, &reply);
    }

    fn subscribe(&self, id: SubscriberId, topic: &str) -> Event {
        let topic = match topic.parse::<Topic>() {
            Ok(t) => t,
            Err(msg) => return Event::error(msg),
        };
        if let Some(sub) = self.inner.subscribers.lock().get_mut(&id) {
            sub.topics.insert(topic);
        }
        Event::SubscriptionConfirmed {
            subscription: topic,
        }
    }

    pub fn count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

fn encode(event: &Event) -> Option<Arc<str>> {
    match event.to_wire() {
        Ok(s) => Some(s.into()),
        Err(e) => {
            error!(event = event.kind(), error = %e, "failed to encode event");
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, Category, Severity};
    use crate::reading::{Measurements, Reading};

    fn recv_json(sub: &mut Subscription) -> Value {
        let msg = sub.outbox.try_recv().expect("expected a message");
        serde_json::from_str(&msg).unwrap()
    }

    fn drain_handshake(sub: &mut Subscription) {
        assert_eq!(recv_json(sub)["type"], "connection");
    }

    fn telemetry() -> Event {
        Event::TelemetryUpdate(
            Reading::new(Measurements {
                temperature: 22.0,
                humidity: 55.0,
                soil_moisture: 0.5,
                co2_level: 700.0,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    // -- Registration --------------------------------------------------------

    #[test]
    fn register_sends_handshake_first() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register();
        let v = recv_json(&mut sub);
        assert_eq!(v["type"], "connection");
        assert_eq!(v["data"]["message"], WELCOME);
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = BroadcastHub::new();
        let sub = hub.register();
        assert!(hub.unregister(sub.id));
        assert!(!hub.unregister(sub.id));
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let hub = BroadcastHub::new();
        let a = hub.register();
        let b = hub.register();
        assert_ne!(a.id, b.id);
    }

    // -- Fan-out -------------------------------------------------------------

    #[test]
    fn publish_removes_closed_subscribers() {
        let hub = BroadcastHub::new();
        let subs: Vec<Subscription> = (0..5).map(|_| hub.register()).collect();
        let mut kept = Vec::new();
        for (i, s) in subs.into_iter().enumerate() {
            if i % 2 == 0 {
                drop(s); // closes the outbox
            } else {
                kept.push(s);
            }
        }
        let delivered = hub.publish(&telemetry());
        assert_eq!(delivered, 2);
        assert_eq!(hub.count(), 2);
    }

    #[test]
    fn closed_subscriber_removed_even_when_filtered_out() {
        let hub = BroadcastHub::new();
        let narrow = hub.register();
        let mut wide = hub.register();
        drain_handshake(&mut wide);

        hub.handle_message(narrow.id, "subscribe:alerts");
        drop(narrow);

        assert_eq!(hub.publish(&telemetry()), 1);
        assert_eq!(hub.count(), 1);
        assert_eq!(recv_json(&mut wide)["type"], "telemetry_update");
    }

    #[test]
    fn full_outbox_counts_as_failure() {
        let hub = BroadcastHub::new();
        let _slow = hub.register();
        let mut fast = hub.register();
        // handshake already occupies one slot
        for _ in 0..SUBSCRIBER_QUEUE - 1 {
            hub.publish(&telemetry());
            let _ = fast.outbox.try_recv();
        }
        hub.publish(&telemetry());
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn alert_batch_arrives_as_one_message() {
        let hub = BroadcastHub::new();
        let mut a = hub.register();
        let mut b = hub.register();
        drain_handshake(&mut a);
        drain_handshake(&mut b);

        let now = OffsetDateTime::now_utc();
        let alerts = (0..3)
            .map(|i| Alert::new(Severity::Critical, Category::Watering, format!("a{i}"), "m", now))
            .collect();
        hub.publish(&Event::new_alerts(alerts));

        for sub in [&mut a, &mut b] {
            let v = recv_json(sub);
            assert_eq!(v["type"], "new_alerts");
            assert_eq!(v["data"]["alerts"].as_array().unwrap().len(), 3);
            assert!(sub.outbox.try_recv().is_err());
        }
    }

    // -- Inbound messages ----------------------------------------------------

    #[test]
    fn ping_gets_pong() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register();
        drain_handshake(&mut sub);
        hub.handle_message(sub.id, r#"{"type":"ping"}"#);
        assert_eq!(recv_json(&mut sub)["type"], "pong");
    }

    #[test]
    fn invalid_json_reports_error() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register();
        drain_handshake(&mut sub);
        hub.handle_message(sub.id, "{not json");
        let v = recv_json(&mut sub);
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"]["message"], "Invalid JSON format");
    }

    #[test]
    fn unknown_type_reports_error() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register();
        drain_handshake(&mut sub);
        hub.handle_message(sub.id, r#"{"type":"dance"}"#);
        assert_eq!(
            recv_json(&mut sub)["data"]["message"],
            "Unknown message type: dance"
        );
    }

    #[test]
    fn subscription_filters_topics() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register();
        drain_handshake(&mut sub);

        hub.handle_message(sub.id, r#"{"type":"subscribe","subscription":"alerts"}"#);
        let v = recv_json(&mut sub);
        assert_eq!(v["type"], "subscription_confirmed");
        assert_eq!(v["data"]["subscription"], "alerts");

        // filtered out, but not removed
        assert_eq!(hub.publish(&telemetry()), 0);
        assert!(sub.outbox.try_recv().is_err());
        assert_eq!(hub.count(), 1);

        // system events always get through
        hub.publish(&Event::SystemError {
            job: None,
            error: "x".into(),
        });
        assert_eq!(recv_json(&mut sub)["type"], "system_error");

        hub.handle_message(sub.id, "subscribe:telemetry");
        assert_eq!(recv_json(&mut sub)["data"]["subscription"], "telemetry");
        assert_eq!(hub.publish(&telemetry()), 1);
    }

    #[test]
    fn reply_to_unknown_subscriber_is_dropped() {
        let hub = BroadcastHub::new();
        hub.handle_message(42, r#"{"type":"ping"}"#);
        assert_eq!(hub.count(), 0);
    }

    // -- Concurrency ---------------------------------------------------------

    #[test]
    fn concurrent_register_and_publish() {
        let hub = BroadcastHub::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let sub = hub.register();
                        hub.publish(&Event::Pong {});
                        hub.unregister(sub.id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hub.count(), 0);
    }
}
