//! In-process event bus.
//!
//! Producers publish [`OwnedEvent`]s onto a bounded channel. The consumer
//! routes each event to a per-owner worker with its own bounded queue, and
//! the worker hands it to every handler subscribed to its kind. Events of
//! one owner are handled in publish order; owners progress independently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use claw_core::{EventKind, OwnedEvent};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &OwnedEvent);
}

struct Subscription {
    name: String,
    handler: Arc<dyn EventHandler>,
}

/// Routes events to subscribers by kind. Subscriptions are keyed by
/// subscriber name, so subscribing twice under one name is a no-op.
#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: RwLock<HashMap<EventKind, Vec<Subscription>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many of `kinds` were newly subscribed.
    pub async fn subscribe(
        &self,
        name: &str,
        kinds: &[EventKind],
        handler: Arc<dyn EventHandler>,
    ) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let mut added = 0;
        for kind in kinds {
            let subs = subscriptions.entry(*kind).or_default();
            if subs.iter().any(|s| s.name == name) {
                continue;
            }
            subs.push(Subscription {
                name: name.to_string(),
                handler: Arc::clone(&handler),
            });
            added += 1;
        }
        if added > 0 {
            tracing::debug!("Subscriber '{}' added to {} event kinds", name, added);
        }
        added
    }

    pub async fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .await
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver to every subscriber of the event's kind, in subscription
    /// order. Returns the number of handlers invoked.
    pub async fn dispatch(&self, event: &OwnedEvent) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscriptions
            .read()
            .await
            .get(&event.event.kind())
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler.handle(event).await;
        }
        handlers.len()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("event bus is full")]
    Full,
    #[error("event bus is closed")]
    Closed,
}

/// Producer side of the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<OwnedEvent>,
}

/// Consumer side of the bus. Run it once.
pub struct EventStream {
    rx: mpsc::Receiver<OwnedEvent>,
    /// Queue depth of each owner's worker.
    owner_capacity: usize,
}

impl EventBus {
    pub fn channel(capacity: usize) -> (EventBus, EventStream) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            EventBus { tx },
            EventStream {
                rx,
                owner_capacity: capacity,
            },
        )
    }

    /// Waits for capacity.
    pub async fn publish(&self, event: OwnedEvent) -> Result<(), PublishError> {
        self.tx.send(event).await.map_err(|_| PublishError::Closed)
    }

    pub fn try_publish(&self, event: OwnedEvent) -> Result<(), PublishError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::Full,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }
}

impl EventStream {
    /// Dispatch events until every [`EventBus`] handle is dropped and
    /// every owner worker has drained. Returns the number of events processed.
    pub async fn run(mut self, dispatcher: Arc<EventDispatcher>) -> u64 {
        let capacity = self.owner_capacity;
        let mut owners: HashMap<String, mpsc::Sender<OwnedEvent>> = HashMap::new();
        let mut workers: Vec<JoinHandle<u64>> = Vec::new();

        while let Some(event) = self.rx.recv().await {
            let lane = owners.entry(event.owner_id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(capacity);
                workers.push(tokio::spawn(drain_owner(rx, Arc::clone(&dispatcher))));
                tx
            });
            if let Err(mpsc::error::SendError(lost)) = lane.send(event).await {
                tracing::error!("Event worker for {} is gone, event dropped", lost.owner_id);
            }
        }

        // Closing the owner queues lets each worker finish its backlog.
        drop(owners);
        let mut processed = 0;
        for worker in workers {
            match worker.await {
                Ok(count) => processed += count,
                Err(e) => tracing::error!("Event worker failed: {}", e),
            }
        }
        tracing::info!("Event stream closed after {} events", processed);
        processed
    }
}

async fn drain_owner(mut rx: mpsc::Receiver<OwnedEvent>, dispatcher: Arc<EventDispatcher>) -> u64 {
    let mut processed = 0;
    while let Some(event) = rx.recv().await {
        let handlers = dispatcher.dispatch(&event).await;
        if handlers == 0 {
            tracing::trace!("No subscribers for {}", event.event.event_type());
        }
        processed += 1;
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use claw_core::DomainEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _event: &OwnedEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_per_name() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(Counter::default());
        assert_eq!(dispatcher.subscribe("engine", &EventKind::ALL, counter.clone()).await, 6);
        assert_eq!(dispatcher.subscribe("engine", &EventKind::ALL, counter.clone()).await, 0);
        assert_eq!(dispatcher.subscriber_count(EventKind::Tick).await, 1);

        dispatcher.dispatch(&OwnedEvent::new("a", DomainEvent::Tick)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_only_to_matching_kind() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(Counter::default());
        dispatcher.subscribe("ticks", &[EventKind::Tick], counter.clone()).await;

        let heartbeat = OwnedEvent::new("a", DomainEvent::HeartbeatReceived { peer_id: "p".into() });
        assert_eq!(dispatcher.dispatch(&heartbeat).await, 0);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bus_backpressure_and_drain() {
        let (bus, stream) = EventBus::channel(1);
        bus.try_publish(OwnedEvent::new("a", DomainEvent::Tick)).unwrap();
        assert_eq!(
            bus.try_publish(OwnedEvent::new("a", DomainEvent::Tick)),
            Err(PublishError::Full)
        );

        let dispatcher = Arc::new(EventDispatcher::new());
        let counter = Arc::new(Counter::default());
        dispatcher.subscribe("c", &[EventKind::Tick], counter.clone()).await;

        let run = tokio::spawn(stream.run(dispatcher));
        bus.publish(OwnedEvent::new("a", DomainEvent::Tick)).await.unwrap();
        drop(bus);
        assert_eq!(run.await.unwrap(), 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    /// Records heartbeat peers in handling order; earlier peers sleep longer.
    #[derive(Default)]
    struct SlowRecorder(std::sync::Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl EventHandler for SlowRecorder {
        async fn handle(&self, event: &OwnedEvent) {
            if let DomainEvent::HeartbeatReceived { peer_id } = &event.event {
                let delay: u64 = peer_id.trim_start_matches('p').parse().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(100 - delay * 10)).await;
                self.0.lock().unwrap().push((event.owner_id.clone(), peer_id.clone()));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_order_kept_while_owners_run_concurrently() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let recorder = Arc::new(SlowRecorder::default());
        dispatcher
            .subscribe("recorder", &[EventKind::HeartbeatReceived], recorder.clone())
            .await;

        let (bus, stream) = EventBus::channel(8);
        let run = tokio::spawn(stream.run(dispatcher));
        for (owner, peer) in [("a", "p0"), ("b", "p5"), ("a", "p1"), ("a", "p2")] {
            let event = DomainEvent::HeartbeatReceived { peer_id: peer.into() };
            bus.publish(OwnedEvent::new(owner, event)).await.unwrap();
        }
        drop(bus);
        assert_eq!(run.await.unwrap(), 4);

        let seen = recorder.0.lock().unwrap().clone();
        let a: Vec<&str> = seen
            .iter()
            .filter(|(o, _)| o == "a")
            .map(|(_, p)| p.as_str())
            .collect();
        assert_eq!(a, ["p0", "p1", "p2"]);
        // b's short handler finishes before a's first, slower one
        assert_eq!(seen[0], ("b".to_string(), "p5".to_string()));
    }
}
