use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::types::{should_store, split_event, DomainEvent, EventEnvelope, EventSource};
use crate::constants;
use crate::storage::EventStore;

enum WriterCommand {
    Store(EventEnvelope),
    Flush(oneshot::Sender<()>),
}

struct BusInner {
    tx: broadcast::Sender<EventEnvelope>,
    writers: Option<Arc<SessionWriters>>,
}

/// In-process event fan-out.
///
/// Each subscriber gets its own bounded queue; a subscriber that falls behind
/// loses its oldest buffered events without affecting anyone else. Persistable
/// events go to a per-session writer task, so producers never wait on the
/// database and a slow write in one session never holds up another.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Live-only bus, nothing is persisted
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner { tx, writers: None }),
        }
    }

    /// Bus backed by an event store. Must be called inside a tokio runtime.
    pub fn with_store(capacity: usize, store: Arc<EventStore>, alert_threshold: usize) -> Self {
        Self::backed(
            capacity,
            store,
            alert_threshold,
            Duration::from_secs(constants::events::WRITER_IDLE_SECS),
        )
    }

    fn backed(
        capacity: usize,
        store: Arc<EventStore>,
        alert_threshold: usize,
        writer_idle: Duration,
    ) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let writers = SessionWriters {
            queues: DashMap::new(),
            store,
            runtime: Handle::current(),
            idle: writer_idle,
            consecutive_failures: AtomicUsize::new(0),
            alert_threshold: alert_threshold.max(1),
        };
        Self {
            inner: Arc::new(BusInner {
                tx,
                writers: Some(Arc::new(writers)),
            }),
        }
    }

    /// Publish an event. Never blocks.
    pub fn publish(
        &self,
        session_id: &str,
        event_type: impl Into<String>,
        payload: Value,
        source: EventSource,
    ) {
        let envelope = EventEnvelope {
            session_id: session_id.to_string(),
            event_type: event_type.into(),
            payload,
            source,
            timestamp: Utc::now(),
        };

        if let Some(writers) = &self.inner.writers {
            if should_store(&envelope.event_type) {
                writers.enqueue(&envelope);
            }
        }

        // No receivers is fine; the store is the source of truth
        let _ = self.inner.tx.send(envelope);
    }

    /// Publish a typed domain event
    pub fn emit<E: DomainEvent>(&self, session_id: &str, event: &E) {
        match split_event(event) {
            Some((event_type, payload)) => {
                self.publish(session_id, event_type, payload, event.source())
            }
            None => tracing::error!(session_id = %session_id, "Failed to serialize event"),
        }
    }

    /// Subscribe to every session's events
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.inner.tx.subscribe(),
            session_id: None,
        }
    }

    /// Subscribe to one session's events
    pub fn subscribe_session(&self, session_id: &str) -> EventSubscription {
        EventSubscription {
            rx: self.inner.tx.subscribe(),
            session_id: Some(session_id.to_string()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Wait until every event published so far, in any session, has been
    /// handed to the store
    pub async fn flush(&self) {
        let Some(writers) = &self.inner.writers else {
            return;
        };
        let pending: Vec<oneshot::Receiver<()>> = writers
            .queues
            .iter()
            .filter_map(|queue| {
                let (done_tx, done_rx) = oneshot::channel();
                queue.value().send(WriterCommand::Flush(done_tx)).ok()?;
                Some(done_rx)
            })
            .collect();
        futures::future::join_all(pending).await;
    }

    #[cfg(test)]
    fn active_writers(&self) -> usize {
        self.inner.writers.as_ref().map_or(0, |w| w.queues.len())
    }
}

/// One storage queue and writer task per session with pending writes.
///
/// Senders are only used while holding the map entry, and a writer retires
/// only after removing its entry with an empty queue, so a session never has
/// two writers at once and its events are stored in publish order.
struct SessionWriters {
    queues: DashMap<String, mpsc::UnboundedSender<WriterCommand>>,
    store: Arc<EventStore>,
    runtime: Handle,
    idle: Duration,
    /// Failures in a row across all sessions
    consecutive_failures: AtomicUsize,
    alert_threshold: usize,
}

impl SessionWriters {
    fn enqueue(self: &Arc<Self>, envelope: &EventEnvelope) {
        let queue = self
            .queues
            .entry(envelope.session_id.clone())
            .or_insert_with(|| self.spawn_writer(&envelope.session_id));
        if queue.send(WriterCommand::Store(envelope.clone())).is_err() {
            tracing::error!(
                session_id = %envelope.session_id,
                event_type = %envelope.event_type,
                "Event writer has stopped, event not persisted"
            );
        }
    }

    fn spawn_writer(self: &Arc<Self>, session_id: &str) -> mpsc::UnboundedSender<WriterCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime.spawn(run_writer(self.clone(), session_id.to_string(), rx));
        tracing::trace!(session_id = %session_id, "Started event writer");
        tx
    }

    /// Remove the session's queue if nothing is buffered; otherwise hand back
    /// the next command.
    fn retire(
        &self,
        session_id: &str,
        rx: &mut mpsc::UnboundedReceiver<WriterCommand>,
    ) -> Option<WriterCommand> {
        match self.queues.entry(session_id.to_string()) {
            Entry::Occupied(entry) => match rx.try_recv() {
                Ok(command) => Some(command),
                Err(_) => {
                    entry.remove();
                    None
                }
            },
            Entry::Vacant(_) => rx.try_recv().ok(),
        }
    }

    async fn store(&self, envelope: EventEnvelope) {
        let result = self
            .store
            .store(
                &envelope.session_id,
                &envelope.event_type,
                &envelope.payload,
                envelope.source,
            )
            .await;
        match result {
            Ok(seq) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                tracing::trace!(
                    session_id = %envelope.session_id,
                    event_type = %envelope.event_type,
                    seq,
                    "Stored event"
                );
            }
            Err(e) => {
                let consecutive_failures =
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    session_id = %envelope.session_id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to store event"
                );
                if consecutive_failures == self.alert_threshold {
                    tracing::error!(
                        consecutive_failures,
                        error = %e,
                        "Event store is failing repeatedly, events are being lost"
                    );
                }
            }
        }
    }
}

async fn run_writer(
    writers: Arc<SessionWriters>,
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    loop {
        let command = match tokio::time::timeout(writers.idle, rx.recv()).await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(_) => match writers.retire(&session_id, &mut rx) {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            WriterCommand::Store(envelope) => writers.store(envelope).await,
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::trace!(session_id = %session_id, "Event writer stopped");
}

/// A live subscription, optionally filtered to one session
pub struct EventSubscription {
    rx: broadcast::Receiver<EventEnvelope>,
    session_id: Option<String>,
}

impl EventSubscription {
    /// Next matching event, or `None` once the bus is gone.
    ///
    /// Events dropped because this subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        session_id = self.session_id.as_deref().unwrap_or("*"),
                        skipped,
                        "Subscriber lagged, dropped oldest events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &EventEnvelope) -> bool {
        self.session_id
            .as_deref()
            .map_or(true, |id| id == event.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn temp_store() -> (tempfile::TempDir, Arc<EventStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(&dir.path().join("events.db")).unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("s1", "task_started", json!({"task_id": "t1"}), EventSource::Task);

        let ea = timeout(Duration::from_millis(200), a.recv()).await.unwrap().unwrap();
        let eb = timeout(Duration::from_millis(200), b.recv()).await.unwrap().unwrap();
        assert_eq!(ea.event_type, "task_started");
        assert_eq!(eb.payload["task_id"], "t1");
    }

    #[tokio::test]
    async fn session_subscription_filters_other_sessions() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe_session("s2");

        bus.publish("s1", "delta", json!({"delta": "a"}), EventSource::Session);
        bus.publish("s2", "delta", json!({"delta": "b"}), EventSource::Session);

        let event = timeout(Duration::from_millis(200), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.session_id, "s2");
        assert_eq!(event.payload["delta"], "b");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.publish("s1", "ping", json!({}), EventSource::Session);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_only_its_own_oldest_events() {
        let (_dir, store) = temp_store();
        let bus = EventBus::with_store(4, store.clone(), 3);
        let mut slow = bus.subscribe_session("s1");

        for i in 0..10 {
            bus.publish("s1", "task_started", json!({"n": i}), EventSource::Task);
        }

        // The slow subscriber only sees the newest events that fit its queue
        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(100), slow.recv()).await {
            seen.push(event.payload["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![6, 7, 8, 9]);

        // The store still got every event
        bus.flush().await;
        let stored = store.get_events("s1", None).await.unwrap();
        assert_eq!(stored.len(), 10);
        assert_eq!(stored[0].payload["n"], 0);
        assert_eq!(stored[9].payload["n"], 9);
    }

    #[tokio::test]
    async fn only_allow_listed_events_reach_the_store() {
        let (_dir, store) = temp_store();
        let bus = EventBus::with_store(16, store.clone(), 3);

        bus.publish("s1", "delta", json!({"delta": "x"}), EventSource::Session);
        bus.publish("s1", "agent_progress", json!({}), EventSource::Task);
        bus.publish("s1", "tool_call", json!({"name": "read"}), EventSource::Task);
        bus.publish("s1", "made_up", json!({}), EventSource::Session);
        bus.flush().await;

        let stored = store.get_events("s1", None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_type, "tool_call");
        assert_eq!(stored[0].seq, 1);
    }

    #[tokio::test]
    async fn each_session_keeps_its_own_order_and_flush_covers_all() {
        let (_dir, store) = temp_store();
        let bus = EventBus::with_store(16, store.clone(), 3);

        for i in 0..20 {
            for session in ["s1", "s2", "s3", "s4"] {
                bus.publish(session, "tool_call", json!({"n": i}), EventSource::Task);
            }
        }
        assert_eq!(bus.active_writers(), 4);
        bus.flush().await;

        for session in ["s1", "s2", "s3", "s4"] {
            let stored = store.get_events(session, None).await.unwrap();
            let order: Vec<i64> = stored
                .iter()
                .map(|e| e.payload["n"].as_i64().unwrap())
                .collect();
            assert_eq!(order, (0..20).collect::<Vec<_>>(), "{session}");
            assert_eq!(stored.last().unwrap().seq, 20);
        }
    }

    #[tokio::test]
    async fn idle_writer_retires_and_a_new_one_continues_the_log() {
        let (_dir, store) = temp_store();
        let bus = EventBus::backed(16, store.clone(), 3, Duration::from_millis(20));

        bus.publish("s1", "tool_call", json!({"n": 0}), EventSource::Task);
        bus.publish("s1", "tool_call", json!({"n": 1}), EventSource::Task);
        bus.flush().await;

        for _ in 0..50 {
            if bus.active_writers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.active_writers(), 0);

        bus.publish("s1", "tool_call", json!({"n": 2}), EventSource::Task);
        bus.flush().await;

        let stored = store.get_events("s1", None).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].seq, 3);
        assert_eq!(stored[2].payload["n"], 2);
    }
}
