//! Alert bus — in-process FIFO notification queue with subscriber fan-out.
//!
//! Operators and watchers push notifications here; the coordinator drains
//! them with `take_all`. Within a single process every enqueued notification
//! is delivered in FIFO order to exactly one `take_all` call and to all
//! subscribers alive at push time. Notifications are not durable: consumers
//! must treat them as best-effort.

pub mod forwarder;

pub use forwarder::{ClusterForwarder, ClusterTransport, LoopbackTransport};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use beamlens_core::telemetry::{TelemetryBus, TelemetryEvent};
use beamlens_core::Notification;

/// Message delivered to bus subscribers on every push.
#[derive(Debug, Clone)]
pub enum AlertEvent {
    AlertAvailable(Notification),
}

struct BusInner {
    queue: VecDeque<Notification>,
    subscribers: Vec<mpsc::UnboundedSender<AlertEvent>>,
    /// Optional queue cap; oldest entries are dropped on overflow.
    capacity: Option<usize>,
}

/// The in-process alert queue.
pub struct AlertBus {
    inner: Mutex<BusInner>,
    telemetry: Arc<TelemetryBus>,
}

impl AlertBus {
    pub fn new(telemetry: Arc<TelemetryBus>) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                queue: VecDeque::new(),
                subscribers: Vec::new(),
                capacity: None,
            }),
            telemetry,
        }
    }

    /// Cap the queue; on overflow the oldest notification is dropped.
    pub fn with_capacity(self, capacity: usize) -> Self {
        self.inner.lock().unwrap().capacity = Some(capacity);
        self
    }

    /// Enqueue a notification and notify all live subscribers.
    pub fn push(&self, notification: Notification) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(cap) = inner.capacity {
            while inner.queue.len() >= cap {
                let dropped = inner.queue.pop_front();
                debug!(id = ?dropped.map(|n| n.id), "Alert queue full, dropping oldest");
            }
        }
        inner.queue.push_back(notification.clone());

        // Dead subscribers are detected by the failed send and pruned, the
        // in-process equivalent of automatic unsubscribe on termination.
        inner
            .subscribers
            .retain(|tx| tx.send(AlertEvent::AlertAvailable(notification.clone())).is_ok());

        self.telemetry
            .publish(TelemetryEvent::AlertFired { notification });
    }

    /// Atomically drain all pending notifications in FIFO order.
    pub fn take_all(&self) -> Vec<Notification> {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.drain(..).collect()
    }

    /// Whether any notifications are pending.
    pub fn pending(&self) -> bool {
        !self.inner.lock().unwrap().queue.is_empty()
    }

    /// How many notifications are pending.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Register a subscriber. The subscription ends when the returned
    /// receiver is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AlertEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Number of live subscribers (prunes dead ones first).
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamlens_core::{Severity, SkillId};

    fn note(tag: &str) -> Notification {
        Notification::new(
            SkillId::new("beam"),
            tag,
            Severity::Warning,
            "ctx",
            "obs",
            "node-a",
        )
    }

    fn bus() -> AlertBus {
        AlertBus::new(Arc::new(TelemetryBus::default()))
    }

    #[test]
    fn take_all_preserves_fifo_order() {
        let bus = bus();
        bus.push(note("a_x"));
        bus.push(note("b_x"));
        bus.push(note("c_x"));

        let drained = bus.take_all();
        let tags: Vec<_> = drained.iter().map(|n| n.anomaly_type.as_str()).collect();
        assert_eq!(tags, vec!["a_x", "b_x", "c_x"]);

        assert!(!bus.pending());
        assert_eq!(bus.count(), 0);
        assert!(bus.take_all().is_empty());
    }

    #[test]
    fn take_all_returns_pushes_since_previous_drain() {
        let bus = bus();
        bus.push(note("a_x"));
        bus.push(note("b_x"));
        assert_eq!(bus.take_all().len(), 2);

        bus.push(note("c_x"));
        let drained = bus.take_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].anomaly_type, "c_x");
    }

    #[tokio::test]
    async fn subscribers_receive_every_push() {
        let bus = bus();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.push(note("mem_high"));

        for rx in [&mut rx1, &mut rx2] {
            let AlertEvent::AlertAvailable(n) = rx.recv().await.unwrap();
            assert_eq!(n.anomaly_type, "mem_high");
        }

        // The queue still holds the notification for take_all
        assert_eq!(bus.count(), 1);
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let bus = bus();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        bus.push(note("mem_high"));
        assert_eq!(bus.subscriber_count(), 0);

        // Pushing with no subscribers is fine
        bus.push(note("gc_pressure"));
        assert_eq!(bus.count(), 2);
    }

    #[test]
    fn capacity_drops_oldest() {
        let bus = bus().with_capacity(2);
        bus.push(note("a_x"));
        bus.push(note("b_x"));
        bus.push(note("c_x"));

        let tags: Vec<_> = bus
            .take_all()
            .iter()
            .map(|n| n.anomaly_type.clone())
            .collect();
        assert_eq!(tags, vec!["b_x", "c_x"]);
    }

    #[tokio::test]
    async fn push_emits_alert_fired_telemetry() {
        let telemetry = Arc::new(TelemetryBus::new(16));
        let mut events = telemetry.subscribe();
        let bus = AlertBus::new(telemetry.clone());

        bus.push(note("mem_high"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "alert_handler.alert_fired");
    }
}
