// Event Bus
// In-process pub/sub plus a bounded ring of recent history for late
// subscribers. Publishers never block: a slow subscriber loses its oldest
// buffered events and sees a dropped_event marker in their place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::broadcast;

use agentbus_types::{BusEvent, EventType};

/// Ring and subscriber-buffer sizing.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Replay bound per job
    pub per_job: usize,
    /// Total ring capacity
    pub global: usize,
    /// Per-subscriber broadcast buffer
    pub subscriber_buffer: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            per_job: 1000,
            global: 10_000,
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub job_id: Option<String>,
}

impl EventFilter {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
        }
    }

    fn matches(&self, event: &BusEvent) -> bool {
        match &self.job_id {
            Some(job_id) => event.job_id.as_deref() == Some(job_id),
            None => true,
        }
    }
}

struct Inner {
    ring: RwLock<VecDeque<BusEvent>>,
    next_id: AtomicU64,
    config: EventBusConfig,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.subscriber_buffer.max(1));
        Self {
            tx,
            inner: Arc::new(Inner {
                ring: RwLock::new(VecDeque::with_capacity(config.global.min(1024))),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Stamp, record, and fan out an event. Non-blocking; the stamped event
    /// is returned so callers can forward it to the audit log.
    pub fn publish(&self, mut event: BusEvent) -> BusEvent {
        event.event_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        event.timestamp = chrono::Utc::now();

        {
            let mut ring = self.inner.ring.write();
            ring.push_back(event.clone());
            while ring.len() > self.inner.config.global {
                ring.pop_front();
            }
        }

        // No receivers is fine
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Recent matching events from the ring, oldest first. Bounded by the
    /// per-job replay cap and the caller's limit; not a durable audit log.
    pub fn history(&self, job_id: Option<&str>, limit: usize) -> Vec<BusEvent> {
        let cap = match job_id {
            Some(_) => limit.min(self.inner.config.per_job),
            None => limit,
        };
        let ring = self.inner.ring.read();
        let mut matching: Vec<BusEvent> = ring
            .iter()
            .filter(|event| match job_id {
                Some(job_id) => event.job_id.as_deref() == Some(job_id),
                None => true,
            })
            .cloned()
            .collect();
        if matching.len() > cap {
            matching.drain(..matching.len() - cap);
        }
        matching
    }

    /// Ring events newer than `since_id` that match the filter; used for SSE
    /// reconnects carrying Last-Event-ID.
    pub fn replay_since(&self, since_id: u64, filter: &EventFilter) -> Vec<BusEvent> {
        let ring = self.inner.ring.read();
        ring.iter()
            .filter(|event| event.event_id > since_id && filter.matches(event))
            .cloned()
            .collect()
    }

    pub fn last_event_id(&self) -> u64 {
        self.inner.next_id.load(Ordering::Relaxed).saturating_sub(1)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

/// A live, filtered view of the bus. Dropped events (subscriber fell behind
/// the bounded buffer) surface as a `dropped_event` marker carrying the
/// count, in place of the lost events.
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!(count, "subscriber lagged, dropping oldest events");
                    return Some(
                        BusEvent::new(EventType::DroppedEvent, json!({ "dropped": count })),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for drain loops.
    pub fn try_next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    return Some(
                        BusEvent::new(EventType::DroppedEvent, json!({ "dropped": count })),
                    );
                }
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use agentbus_types::Stage;

    fn bus_with(subscriber_buffer: usize, global: usize, per_job: usize) -> EventBus {
        EventBus::new(EventBusConfig {
            per_job,
            global,
            subscriber_buffer,
        })
    }

    fn event_for(job_id: &str, event_type: EventType) -> BusEvent {
        BusEvent::new(event_type, json!({})).with_job(job_id)
    }

    #[tokio::test]
    async fn publish_stamps_monotonic_ids() {
        let bus = EventBus::default();
        let first = bus.publish(event_for("j1", EventType::JobCreated));
        let second = bus.publish(event_for("j1", EventType::JobStarted));
        assert!(second.event_id > first.event_id);
        assert_eq!(bus.last_event_id(), second.event_id);
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_publish_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(EventFilter::default());
        bus.publish(event_for("j1", EventType::JobCreated));
        bus.publish(event_for("j1", EventType::StageStarted));

        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(first.event_type, EventType::JobCreated);
        assert_eq!(second.event_type, EventType::StageStarted);
    }

    #[tokio::test]
    async fn filter_restricts_to_job() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(EventFilter::for_job("j2"));
        bus.publish(event_for("j1", EventType::JobCreated));
        bus.publish(event_for("j2", EventType::JobCreated));

        let event = sub.next().await.unwrap();
        assert_eq!(event.job_id.as_deref(), Some("j2"));
    }

    #[tokio::test]
    async fn lagged_subscriber_gets_dropped_marker() {
        let bus = bus_with(2, 100, 100);
        let mut sub = bus.subscribe(EventFilter::default());
        for _ in 0..5 {
            bus.publish(event_for("j1", EventType::AgentEvent));
        }

        let first = sub.next().await.unwrap();
        assert_eq!(first.event_type, EventType::DroppedEvent);
        assert_eq!(first.data["dropped"], 3);

        // The remainder still arrive in order
        let second = sub.next().await.unwrap();
        assert_eq!(second.event_type, EventType::AgentEvent);
    }

    #[tokio::test]
    async fn history_is_bounded_and_filtered() {
        let bus = bus_with(16, 10, 3);
        for i in 0..12 {
            let job = if i % 2 == 0 { "j1" } else { "j2" };
            bus.publish(event_for(job, EventType::AgentEvent));
        }

        // Global ring keeps only the newest 10
        assert_eq!(bus.history(None, 100).len(), 10);

        let j1 = bus.history(Some("j1"), 100);
        assert!(j1.len() <= 3);
        assert!(j1.iter().all(|e| e.job_id.as_deref() == Some("j1")));

        let limited = bus.history(Some("j1"), 1);
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn replay_since_returns_newer_matching() {
        let bus = EventBus::default();
        let first = bus.publish(event_for("j1", EventType::JobCreated));
        bus.publish(event_for("j2", EventType::JobCreated));
        let third = bus.publish(
            BusEvent::new(EventType::StageStarted, json!({}))
                .with_job("j1")
                .with_stage(Stage::PrdGeneration),
        );

        let replay = bus.replay_since(first.event_id, &EventFilter::for_job("j1"));
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event_id, third.event_id);
    }
}
