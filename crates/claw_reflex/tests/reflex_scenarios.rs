//! End-to-end reflex engine scenarios
//!
//! Engine wired to the in-memory store (and SQLite in-memory for the
//! query push-down case), with recording heartbeat and host adapters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use proptest::prelude::*;

use claw_core::{
    AlertType, BatchConfig, Behavior, DomainEvent, EventKind, ExecutionQuery, ExecutionRecord,
    ExecutionResult, ExecutionStats, ExecutionStore, FriendshipStatus, HeartbeatSender,
    HostNotifier, NewReflex, OverflowPolicy, OwnedEvent, ReflexBatch, ReflexConfig, ReflexError,
    ReflexFilter, ReflexStore, RelationshipLayer, TriggerLayer, ValueLayer,
};
use claw_reflex::builtins::{AUDIT_BEHAVIOR_LOG, KEEPALIVE_HEARTBEAT, RELATIONSHIP_DECAY_ALERT};
use claw_reflex::{
    EventBus, EventDispatcher, NoopHostNotifier, ReflexBatchProcessor, ReflexEngine,
    ReflexEngineDeps,
};
use claw_store::{InMemoryStore, SqliteStore};

// ============================================================================
// Test adapters
// ============================================================================

#[derive(Default)]
struct RecordingHeartbeat {
    sent: Mutex<Vec<String>>,
}

impl RecordingHeartbeat {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl HeartbeatSender for RecordingHeartbeat {
    async fn send_heartbeat(&self, owner_id: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(owner_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingHost {
    unavailable: AtomicBool,
    batches: Mutex<Vec<ReflexBatch>>,
}

impl RecordingHost {
    fn batches(&self) -> Vec<ReflexBatch> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostNotifier for RecordingHost {
    async fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn notify(&self, batch: &ReflexBatch) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Heartbeat sender that stalls for one owner.
#[derive(Default)]
struct StallingHeartbeat {
    stalled_owner: String,
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl HeartbeatSender for StallingHeartbeat {
    async fn send_heartbeat(&self, owner_id: &str) -> anyhow::Result<()> {
        if owner_id == self.stalled_owner {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        }
        self.sent.lock().unwrap().push(owner_id.to_string());
        Ok(())
    }
}

/// Execution store whose writes always fail.
struct BrokenAudit;

#[async_trait]
impl ExecutionStore for BrokenAudit {
    async fn insert_execution(&self, _record: &ExecutionRecord) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    async fn recent_executions(&self, _owner_id: &str, _limit: usize) -> anyhow::Result<Vec<ExecutionRecord>> {
        Ok(Vec::new())
    }

    async fn query_executions(
        &self,
        _owner_id: &str,
        _query: &ExecutionQuery,
    ) -> anyhow::Result<Vec<ExecutionRecord>> {
        Ok(Vec::new())
    }

    async fn execution_stats(
        &self,
        _owner_id: &str,
        _since: Option<chrono::DateTime<Utc>>,
    ) -> anyhow::Result<ExecutionStats> {
        Ok(ExecutionStats::default())
    }

    async fn delete_older_than(&self, _cutoff: chrono::DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(0)
    }
}

struct Harness {
    engine: Arc<ReflexEngine>,
    store: Arc<InMemoryStore>,
    heartbeat: Arc<RecordingHeartbeat>,
    host: Arc<RecordingHost>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let heartbeat = Arc::new(RecordingHeartbeat::default());
    let host = Arc::new(RecordingHost::default());
    let deps = ReflexEngineDeps {
        reflexes: store.clone(),
        executions: store.clone(),
        heartbeat: heartbeat.clone(),
        host: host.clone(),
    };
    Harness {
        engine: Arc::new(ReflexEngine::new(deps, ReflexConfig::default())),
        store,
        heartbeat,
        host,
    }
}

fn batch_config(batch_size: usize) -> BatchConfig {
    BatchConfig {
        batch_size,
        max_wait_ms: 60_000,
        max_queue_size: 100,
        overflow_policy: OverflowPolicy::RejectNew,
    }
}

fn friend_request(peer: &str) -> DomainEvent {
    DomainEvent::FriendshipChanged {
        peer_id: peer.into(),
        old_status: None,
        new_status: FriendshipStatus::Pending,
    }
}

fn records_of<'a>(records: &'a [ExecutionRecord], reflex_id: &str) -> Vec<&'a ExecutionRecord> {
    records.iter().filter(|r| r.reflex_id == reflex_id).collect()
}

// ============================================================================
// Layer 0
// ============================================================================

#[tokio::test]
async fn test_tick_sends_one_heartbeat() {
    let h = harness();
    let seeded = h.engine.seed_builtins("A").await.unwrap();
    let keepalive = seeded.iter().find(|r| r.name == KEEPALIVE_HEARTBEAT).unwrap();

    let report = h.engine.handle_event("A", &DomainEvent::Tick).await.unwrap();

    assert_eq!(h.heartbeat.sent(), vec!["A".to_string()]);
    let keepalive_records = records_of(&report.records, &keepalive.id);
    assert_eq!(keepalive_records.len(), 1);
    assert_eq!(keepalive_records[0].execution_result, ExecutionResult::Executed);

    // Persisted too, alongside the audit reflex's record
    let recent = h.engine.get_recent_executions("A", None).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|r| r.execution_result == ExecutionResult::Executed));
}

#[tokio::test]
async fn test_relationship_downgrade_alerts_once() {
    let h = harness();
    let seeded = h.engine.seed_builtins("B").await.unwrap();
    let decay = seeded.iter().find(|r| r.name == RELATIONSHIP_DECAY_ALERT).unwrap();

    let event = DomainEvent::RelationshipChanged {
        peer_id: "peer".into(),
        old_layer: RelationshipLayer::Active,
        new_layer: RelationshipLayer::Casual,
    };
    let report = h.engine.handle_event("B", &event).await.unwrap();

    let alerts = records_of(&report.records, &decay.id);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].execution_result, ExecutionResult::Executed);
    assert_eq!(alerts[0].details.alert_type, Some(AlertType::RelationshipDowngrade));
    assert_eq!(alerts[0].trigger_data["new_layer"], "casual");
    assert!(!report.blocked);
    assert!(h.heartbeat.sent().is_empty());
}

#[tokio::test]
async fn test_disabled_reflex_does_not_fire() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();
    h.engine.disable_reflex("A", KEEPALIVE_HEARTBEAT).await.unwrap();

    let report = h.engine.handle_event("A", &DomainEvent::Tick).await.unwrap();
    assert_eq!(report.records.len(), 1, "only the audit reflex fires");
    assert!(h.heartbeat.sent().is_empty());

    h.engine.enable_reflex("A", KEEPALIVE_HEARTBEAT).await.unwrap();
    h.engine.handle_event("A", &DomainEvent::Tick).await.unwrap();
    assert_eq!(h.heartbeat.sent().len(), 1);
}

#[tokio::test]
async fn test_disable_audit_is_forbidden_in_any_state() {
    let h = harness();
    // Before seeding
    let err = h.engine.disable_reflex("A", AUDIT_BEHAVIOR_LOG).await.unwrap_err();
    assert!(err.is_forbidden());

    h.engine.seed_builtins("A").await.unwrap();
    let err = h.engine.disable_reflex("A", AUDIT_BEHAVIOR_LOG).await.unwrap_err();
    assert!(err.is_forbidden());

    let audit = h.store.find_reflex("A", AUDIT_BEHAVIOR_LOG).await.unwrap().unwrap();
    assert!(audit.enabled, "no mutation on forbidden disable");
}

#[tokio::test]
async fn test_unknown_reflex_is_not_found() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();
    assert!(h.engine.disable_reflex("A", "nope").await.unwrap_err().is_not_found());
    assert!(h.engine.enable_reflex("A", "nope").await.unwrap_err().is_not_found());
    // Reflexes are owner-scoped
    assert!(matches!(
        h.engine.enable_reflex("Z", KEEPALIVE_HEARTBEAT).await.unwrap_err(),
        ReflexError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_audit_failure_does_not_undo_side_effects() {
    let store = Arc::new(InMemoryStore::new());
    let heartbeat = Arc::new(RecordingHeartbeat::default());
    let host = Arc::new(RecordingHost::default());
    let engine = ReflexEngine::new(
        ReflexEngineDeps {
            reflexes: store.clone(),
            executions: Arc::new(BrokenAudit),
            heartbeat: heartbeat.clone(),
            host: host.clone(),
        },
        ReflexConfig::default(),
    );
    engine.seed_builtins("A").await.unwrap();
    engine.activate_layer1(ReflexBatchProcessor::new(batch_config(1), host.clone()));

    let report = engine.handle_event("A", &DomainEvent::Tick).await.unwrap();
    assert_eq!(report.audit_failures, 2);
    assert_eq!(heartbeat.sent().len(), 1);

    let report = engine.handle_event("A", &friend_request("p")).await.unwrap();
    assert!(report.audit_failures > 0);
    assert_eq!(host.batches().len(), 1, "queued entry is not un-queued");
}

// ============================================================================
// Layer 1
// ============================================================================

#[tokio::test]
async fn test_layer1_before_activation_is_recommended() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();
    assert!(!h.engine.is_layer1_active());

    let report = h.engine.handle_event("A", &friend_request("p")).await.unwrap();
    assert!(report
        .records
        .iter()
        .all(|r| r.execution_result != ExecutionResult::QueuedForL1));
    assert!(h.host.batches().is_empty());
}

#[tokio::test]
async fn test_activate_layer1_is_idempotent() {
    let h = harness();
    assert!(h.engine.activate_layer1(ReflexBatchProcessor::new(batch_config(3), h.host.clone())));
    assert!(!h.engine.activate_layer1(ReflexBatchProcessor::new(batch_config(3), h.host.clone())));
    assert!(h.engine.is_layer1_active());
}

#[tokio::test]
async fn test_acknowledge_three_entry_batch() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();
    h.engine
        .activate_layer1(ReflexBatchProcessor::new(batch_config(3), h.host.clone()));

    for peer in ["p1", "p2"] {
        h.engine.handle_event("A", &friend_request(peer)).await.unwrap();
    }
    assert!(h.host.batches().is_empty(), "below batch size never flushes");

    let report = h.engine.handle_event("A", &friend_request("p3")).await.unwrap();
    let queued: Vec<_> = report
        .records
        .iter()
        .filter(|r| r.execution_result == ExecutionResult::QueuedForL1)
        .collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].details.proposed_result, Some(ExecutionResult::Recommended));

    let batches = h.host.batches();
    assert_eq!(batches.len(), 1, "the third enqueue flushes exactly once");
    assert_eq!(batches[0].entries.len(), 3);

    let before = h.engine.get_pending_l1_status("A").await;
    assert_eq!(before.queue_size, 3);
    assert!(before.host_available);
    assert!(before.oldest_entry.is_some());

    let ack = h.engine.acknowledge_reflex_batch(&batches[0].batch_id).await;
    assert_eq!(ack.acknowledged_count, 3);
    let after = h.engine.get_pending_l1_status("A").await;
    assert_eq!(after.queue_size, before.queue_size - 3);

    // Double acknowledgement is a no-op
    let again = h.engine.acknowledge_reflex_batch(&batches[0].batch_id).await;
    assert_eq!(again.acknowledged_count, 0);
}

#[tokio::test]
async fn test_host_unavailable_leaves_queue_unchanged() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();
    let processor = ReflexBatchProcessor::new(batch_config(2), h.host.clone());
    h.engine.activate_layer1(processor.clone());
    h.host.unavailable.store(true, Ordering::SeqCst);

    h.engine.handle_event("A", &friend_request("p1")).await.unwrap();
    h.engine.handle_event("A", &friend_request("p2")).await.unwrap();
    let size = h.engine.get_pending_l1_status("A").await.queue_size;
    assert_eq!(size, 2);

    let flush = processor.flush("A").await;
    assert_eq!(flush.delivered, 0);
    assert_eq!(h.engine.get_pending_l1_status("A").await.queue_size, size);
    assert!(h.host.batches().is_empty());

    h.host.unavailable.store(false, Ordering::SeqCst);
    assert_eq!(processor.flush("A").await.delivered, 2);
    processor.shutdown().await;
}

#[tokio::test]
async fn test_queue_full_falls_back_to_recommendation() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();
    let mut cfg = batch_config(10);
    cfg.max_queue_size = 1;
    h.engine
        .activate_layer1(ReflexBatchProcessor::new(cfg, h.host.clone()));

    h.engine.handle_event("A", &friend_request("p1")).await.unwrap();
    let report = h.engine.handle_event("A", &friend_request("p2")).await.unwrap();
    let review = report
        .records
        .iter()
        .find(|r| r.details.action == "review_friend_request")
        .unwrap();
    assert_eq!(review.execution_result, ExecutionResult::Recommended);
    assert_eq!(review.details.deferral.as_deref(), Some("l1_queue_full"));
    assert_eq!(h.engine.shutdown().await, 1);
}

// ============================================================================
// Queries and dispatch
// ============================================================================

#[tokio::test]
async fn test_filtered_executions_pushed_down() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = ReflexEngine::new(
        ReflexEngineDeps {
            reflexes: store.clone(),
            executions: store.clone(),
            heartbeat: Arc::new(RecordingHeartbeat::default()),
            host: Arc::new(NoopHostNotifier),
        },
        ReflexConfig::default(),
    );
    engine.seed_builtins("A").await.unwrap();
    engine
        .register_reflex(
            "A",
            NewReflex {
                name: "block_spam".into(),
                trigger_layer: TriggerLayer::Immediate,
                value_layer: ValueLayer::Cognitive,
                behavior: Behavior::Block,
                enabled: true,
                confidence: 0.9,
                config: serde_json::json!({
                    "triggers": ["spam_report"],
                    "outcome": "blocked"
                }),
            },
        )
        .await
        .unwrap();

    let spam = DomainEvent::Custom { event_type: "spam_report".into(), payload: serde_json::json!({}) };
    engine.handle_event("A", &spam).await.unwrap();
    engine.handle_event("A", &spam).await.unwrap();
    for _ in 0..10 {
        engine.handle_event("A", &DomainEvent::Tick).await.unwrap();
    }

    let recent = engine.get_recent_executions("A", Some(5)).await.unwrap();
    assert!(recent.iter().all(|r| r.execution_result == ExecutionResult::Executed));

    let blocked = engine
        .get_filtered_executions("A", ExecutionResult::Blocked, None, Some(5))
        .await
        .unwrap();
    assert_eq!(blocked.len(), 2);
    assert!(blocked.iter().all(|r| r.event_type == "spam_report"));

    let limited = engine
        .get_filtered_executions("A", ExecutionResult::Executed, Some(Utc::now() - Duration::hours(1)), Some(3))
        .await
        .unwrap();
    assert_eq!(limited.len(), 3);
    assert!(limited.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let stats = engine.get_execution_stats("A", None).await.unwrap();
    assert_eq!(stats.blocked, 2);
    assert_eq!(engine.global_counters().blocked, 2);
}

#[tokio::test]
async fn test_bus_drives_engine_once_per_event() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();

    let dispatcher = Arc::new(EventDispatcher::new());
    assert_eq!(h.engine.initialize(&dispatcher).await, EventKind::ALL.len());
    assert_eq!(h.engine.initialize(&dispatcher).await, 0);

    let (bus, stream) = EventBus::channel(8);
    let run = tokio::spawn(stream.run(dispatcher.clone()));
    bus.publish(OwnedEvent::new("A", DomainEvent::Tick)).await.unwrap();
    drop(bus);
    assert_eq!(run.await.unwrap(), 1);

    // Re-initializing did not double-register the handler
    assert_eq!(h.heartbeat.sent().len(), 1);
    assert_eq!(h.store.execution_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_owner_does_not_hold_up_others() {
    let store = Arc::new(InMemoryStore::new());
    let heartbeat = Arc::new(StallingHeartbeat {
        stalled_owner: "A".into(),
        ..Default::default()
    });
    let deps = ReflexEngineDeps {
        reflexes: store.clone(),
        executions: store.clone(),
        heartbeat: heartbeat.clone(),
        host: Arc::new(NoopHostNotifier),
    };
    let engine = Arc::new(ReflexEngine::new(deps, ReflexConfig::default()));
    engine.seed_builtins("A").await.unwrap();
    engine.seed_builtins("B").await.unwrap();

    let dispatcher = Arc::new(EventDispatcher::new());
    engine.initialize(&dispatcher).await;
    let (bus, stream) = EventBus::channel(8);
    let run = tokio::spawn(stream.run(dispatcher));
    bus.publish(OwnedEvent::new("A", DomainEvent::Tick)).await.unwrap();
    bus.publish(OwnedEvent::new("B", DomainEvent::Tick)).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    // B's keepalive and audit records landed while A's heartbeat is stuck
    assert_eq!(engine.get_recent_executions("B", None).await.unwrap().len(), 2);
    assert_eq!(*heartbeat.sent.lock().unwrap(), vec!["B".to_string()]);
    assert!(engine.get_recent_executions("A", None).await.unwrap().len() < 2);

    drop(bus);
    assert_eq!(run.await.unwrap(), 2);
    assert_eq!(heartbeat.sent.lock().unwrap().len(), 2);
    assert_eq!(engine.get_recent_executions("A", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_list_reflexes_filters() {
    let h = harness();
    h.engine.seed_builtins("A").await.unwrap();
    h.engine.disable_reflex("A", KEEPALIVE_HEARTBEAT).await.unwrap();

    let all = h.engine.list_reflexes("A", &ReflexFilter::default()).await.unwrap();
    assert_eq!(all.len(), 4);
    let enabled = h.engine.list_reflexes("A", &ReflexFilter::enabled()).await.unwrap();
    assert_eq!(enabled.len(), 3);
    let supervised = h
        .engine
        .list_reflexes("A", &ReflexFilter { layer: Some(TriggerLayer::Supervised), enabled_only: false })
        .await
        .unwrap();
    assert_eq!(supervised.len(), 1);
}

// ============================================================================
// Properties
// ============================================================================

const EVENT_TYPES: [&str; 3] = ["alpha", "beta", "gamma"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Each enabled matching immediate reflex yields exactly one record.
    #[test]
    fn prop_one_record_per_matching_reflex(
        triggers in prop::collection::vec(0usize..3, 0..8),
        fired in 0usize..3,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (records, expected) = rt.block_on(async {
            let h = harness();
            h.engine.seed_builtins("A").await.unwrap();
            for (i, t) in triggers.iter().enumerate() {
                h.engine
                    .register_reflex(
                        "A",
                        NewReflex {
                            name: format!("rule_{}", i),
                            trigger_layer: TriggerLayer::Immediate,
                            value_layer: ValueLayer::Expression,
                            behavior: Behavior::Execute,
                            enabled: true,
                            confidence: 1.0,
                            config: serde_json::json!({"triggers": [EVENT_TYPES[*t]], "outcome": "executed"}),
                        },
                    )
                    .await
                    .unwrap();
            }
            let event = DomainEvent::Custom {
                event_type: EVENT_TYPES[fired].into(),
                payload: serde_json::Value::Null,
            };
            let report = h.engine.handle_event("A", &event).await.unwrap();
            // +1 for the audit reflex
            let expected = triggers.iter().filter(|t| **t == fired).count() + 1;
            (report.records, expected)
        });

        prop_assert_eq!(records.len(), expected);
        let mut ids: Vec<_> = records.iter().map(|r| r.reflex_id.clone()).collect();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), records.len());
    }
}
