//! Reflex Engine - turns domain events into audited decisions
//!
//! For every event, each enabled reflex of the owner that matches is
//! evaluated independently and yields exactly one execution record:
//! - Layer 0 (immediate): the decision takes effect now
//! - Layer 1 (supervised): the decision is queued for host review when
//!   the batch processor is active, otherwise only recommended
//!
//! Audit records are append-only. A failed audit write is logged and
//! counted, never rolled back into the decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use claw_core::{
    AcknowledgeOutcome, AggregateCounters, AggregateOutcome, DomainEvent, EventKind,
    ExecutionDetails, ExecutionQuery, ExecutionRecord, ExecutionResult, ExecutionStats,
    ExecutionStore, HeartbeatSender, HostNotifier, NewReflex, OwnedEvent, PendingL1Entry,
    PendingL1Status, Reflex, ReflexConfig, ReflexError, ReflexFilter, ReflexResult, ReflexStore,
    TriggerLayer,
};

use crate::batch::ReflexBatchProcessor;
use crate::builtins::{self, AUDIT_BEHAVIOR_LOG};
use crate::dispatcher::{EventDispatcher, EventHandler};
use crate::evaluate::{gate_confidence, Decision, ReflexProgram, SideEffect};

/// Subscriber name used on the dispatcher.
pub const SUBSCRIBER_NAME: &str = "reflex_engine";
pub const DEFAULT_RECENT_LIMIT: usize = 50;
pub const DEFAULT_FILTERED_LIMIT: usize = 100;

pub const DEFERRAL_LAYER1_INACTIVE: &str = "layer1_inactive";
pub const DEFERRAL_QUEUE_FULL: &str = "l1_queue_full";

/// Everything the engine is wired to.
#[derive(Clone)]
pub struct ReflexEngineDeps {
    pub reflexes: Arc<dyn ReflexStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub heartbeat: Arc<dyn HeartbeatSender>,
    /// Reported in layer-1 status while no batch processor is active.
    pub host: Arc<dyn HostNotifier>,
}

/// Result of handling one event.
#[derive(Debug, Clone, Default)]
pub struct EventReport {
    /// One record per matching reflex, in evaluation order.
    pub records: Vec<ExecutionRecord>,
    /// Some immediate reflex blocked the event.
    pub blocked: bool,
    /// Records that could not be written to the audit store.
    pub audit_failures: usize,
}

impl EventReport {
    /// Overall outcome for the event: any block wins, then any escalation.
    pub fn outcome(&self) -> AggregateOutcome {
        let outcomes = self.records.iter().map(|r| AggregateOutcome::from(r.execution_result));
        let mut overall = AggregateOutcome::Allowed;
        for outcome in outcomes {
            match outcome {
                AggregateOutcome::Blocked => return AggregateOutcome::Blocked,
                AggregateOutcome::Escalated => overall = AggregateOutcome::Escalated,
                AggregateOutcome::Allowed => {}
            }
        }
        overall
    }
}

#[derive(Default)]
struct AggregateTally {
    allowed: AtomicU64,
    blocked: AtomicU64,
    escalated: AtomicU64,
}

impl AggregateTally {
    fn record(&self, result: ExecutionResult) {
        let counter = match AggregateOutcome::from(result) {
            AggregateOutcome::Allowed => &self.allowed,
            AggregateOutcome::Blocked => &self.blocked,
            AggregateOutcome::Escalated => &self.escalated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AggregateCounters {
        AggregateCounters {
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
        }
    }
}

pub struct ReflexEngine {
    deps: ReflexEngineDeps,
    config: ReflexConfig,
    layer1: ArcSwapOption<ReflexBatchProcessor>,
    tally: AggregateTally,
}

impl ReflexEngine {
    pub fn new(deps: ReflexEngineDeps, config: ReflexConfig) -> Self {
        Self {
            deps,
            config,
            layer1: ArcSwapOption::empty(),
            tally: AggregateTally::default(),
        }
    }

    pub fn config(&self) -> &ReflexConfig {
        &self.config
    }

    /// Subscribe to every event kind. Safe to call more than once.
    pub async fn initialize(self: &Arc<Self>, dispatcher: &EventDispatcher) -> usize {
        let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
        let added = dispatcher
            .subscribe(SUBSCRIBER_NAME, &EventKind::ALL, handler)
            .await;
        if added > 0 {
            tracing::info!("Reflex engine subscribed to {} event kinds", added);
        }
        added
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    /// Evaluate every enabled reflex of `owner_id` against `event`.
    ///
    /// Fails with [`ReflexError::ReservedEventType`] for a custom event
    /// posing as a built-in kind; nothing is evaluated or audited then.
    pub async fn handle_event(&self, owner_id: &str, event: &DomainEvent) -> ReflexResult<EventReport> {
        if event.has_reserved_type() {
            return Err(ReflexError::ReservedEventType(event.event_type().into_owned()));
        }
        let reflexes = self
            .deps
            .reflexes
            .list_reflexes(owner_id, &ReflexFilter::enabled())
            .await?;

        let snapshot = event.snapshot();
        let event_type = event.event_type().into_owned();
        let mut report = EventReport::default();

        for reflex in &reflexes {
            let program = ReflexProgram::for_reflex(reflex);
            if !program.matches(event, &snapshot) {
                continue;
            }
            let decision = self.gate(reflex, program.decide(event));

            let (result, details) = match reflex.trigger_layer {
                TriggerLayer::Immediate => self.apply_immediate(owner_id, decision).await,
                TriggerLayer::Supervised => {
                    self.route_supervised(reflex, &event_type, &snapshot, decision)
                        .await
                }
            };

            let record = ExecutionRecord::new(reflex, &event_type, snapshot.clone(), result, details);
            self.tally.record(result);
            if let Err(e) = self.deps.executions.insert_execution(&record).await {
                tracing::error!(
                    "Failed to audit {} decision of '{}' for {}: {:#}",
                    result,
                    reflex.name,
                    owner_id,
                    e
                );
                report.audit_failures += 1;
            }
            if result == ExecutionResult::Blocked {
                report.blocked = true;
            }
            report.records.push(record);
        }

        tracing::debug!(
            "Event {} for {}: {} of {} reflexes matched",
            event_type,
            owner_id,
            report.records.len(),
            reflexes.len()
        );
        Ok(report)
    }

    /// Evaluate one reflex without side effects or auditing. The
    /// confidence gate applies; layer routing does not.
    pub fn evaluate(&self, reflex: &Reflex, event: &DomainEvent) -> Option<Decision> {
        crate::evaluate::evaluate(reflex, event).map(|d| self.gate(reflex, d))
    }

    /// Protected reflexes always decide at full strength.
    fn gate(&self, reflex: &Reflex, decision: Decision) -> Decision {
        if builtins::is_protected(&reflex.name) {
            return decision;
        }
        gate_confidence(decision, reflex.confidence, self.config.min_binding_confidence)
    }

    async fn apply_immediate(&self, owner_id: &str, decision: Decision) -> (ExecutionResult, ExecutionDetails) {
        let Decision { result, mut details, effect } = decision;
        if result == ExecutionResult::Executed && effect == Some(SideEffect::SendHeartbeat) {
            if let Err(e) = self.deps.heartbeat.send_heartbeat(owner_id).await {
                tracing::warn!("Keepalive heartbeat for {} failed: {:#}", owner_id, e);
                details.error = Some(format!("{:#}", e));
            }
        }
        (result, details)
    }

    async fn route_supervised(
        &self,
        reflex: &Reflex,
        event_type: &str,
        snapshot: &serde_json::Value,
        decision: Decision,
    ) -> (ExecutionResult, ExecutionDetails) {
        let Decision { result, mut details, .. } = decision;
        let proposed = details.proposed_result.unwrap_or(result);
        details.proposed_result = Some(proposed);

        let Some(processor) = self.layer1.load_full() else {
            details.deferral = Some(DEFERRAL_LAYER1_INACTIVE.to_string());
            return (ExecutionResult::Recommended, details);
        };

        let entry = PendingL1Entry {
            owner_id: reflex.owner_id.clone(),
            reflex_id: reflex.id.clone(),
            reflex_name: reflex.name.clone(),
            event_type: event_type.to_string(),
            trigger_data: snapshot.clone(),
            proposed_result: proposed,
            details: details.clone(),
            enqueued_at: Utc::now(),
        };

        match processor.enqueue(entry).await {
            Ok(report) => {
                if let Some(evicted) = report.evicted {
                    tracing::warn!(
                        "Evicted queued '{}' decision for {} to make room",
                        evicted.reflex_name,
                        evicted.owner_id
                    );
                }
                (ExecutionResult::QueuedForL1, details)
            }
            Err(e) => {
                tracing::warn!("'{}' not queued for review: {}", reflex.name, e);
                details.deferral = Some(DEFERRAL_QUEUE_FULL.to_string());
                (ExecutionResult::Recommended, details)
            }
        }
    }

    // ========================================================================
    // Layer 1
    // ========================================================================

    /// Attach the batch processor. The first activation wins; later calls
    /// keep the existing processor and return false.
    pub fn activate_layer1(&self, processor: ReflexBatchProcessor) -> bool {
        let candidate = Arc::new(processor);
        let previous = self.layer1.rcu(|current| match current {
            Some(existing) => Some(Arc::clone(existing)),
            None => Some(Arc::clone(&candidate)),
        });
        let activated = previous.is_none();
        if activated {
            tracing::info!("Layer-1 batch review activated");
        }
        activated
    }

    pub fn is_layer1_active(&self) -> bool {
        self.layer1.load().is_some()
    }

    pub async fn acknowledge_reflex_batch(&self, batch_id: &str) -> AcknowledgeOutcome {
        match self.layer1.load_full() {
            Some(processor) => processor.acknowledge(batch_id).await,
            None => AcknowledgeOutcome::default(),
        }
    }

    pub async fn get_pending_l1_status(&self, owner_id: &str) -> PendingL1Status {
        match self.layer1.load_full() {
            Some(processor) => processor.status(owner_id).await,
            None => PendingL1Status {
                queue_size: 0,
                host_available: self.deps.host.is_available().await,
                oldest_entry: None,
            },
        }
    }

    /// Stop layer-1 timers. Returns the number of undelivered entries abandoned.
    pub async fn shutdown(&self) -> usize {
        match self.layer1.load_full() {
            Some(processor) => processor.shutdown().await,
            None => 0,
        }
    }

    // ========================================================================
    // Reflex management
    // ========================================================================

    /// Insert or refresh the builtin reflexes for `owner_id`. Enablement
    /// and confidence of existing rows are kept, except that the audit
    /// reflex is always re-enabled.
    pub async fn seed_builtins(&self, owner_id: &str) -> ReflexResult<Vec<Reflex>> {
        let mut seeded = Vec::new();
        for reflex in builtins::seed_reflexes(owner_id) {
            let mut stored = self.deps.reflexes.upsert_builtin(&reflex).await?;
            if stored.name == AUDIT_BEHAVIOR_LOG && !stored.enabled {
                tracing::warn!("Re-enabling {} for {}", AUDIT_BEHAVIOR_LOG, owner_id);
                self.deps.reflexes.set_enabled(owner_id, AUDIT_BEHAVIOR_LOG, true).await?;
                stored.enabled = true;
            }
            seeded.push(stored);
        }
        tracing::debug!("Seeded {} builtin reflexes for {}", seeded.len(), owner_id);
        Ok(seeded)
    }

    /// Create a custom reflex. Names are unique per owner and may not
    /// shadow a builtin.
    pub async fn register_reflex(&self, owner_id: &str, new: NewReflex) -> ReflexResult<Reflex> {
        if !claw_core::reflex::is_valid_name(&new.name) {
            return Err(ReflexError::InvalidName(new.name));
        }
        validate_confidence(new.confidence)?;
        if builtins::BuiltinReflex::from_name(&new.name).is_some()
            || self.deps.reflexes.find_reflex(owner_id, &new.name).await?.is_some()
        {
            return Err(ReflexError::AlreadyExists {
                owner_id: owner_id.to_string(),
                name: new.name,
            });
        }

        let reflex = Reflex::from_new(owner_id, new);
        self.deps.reflexes.insert_reflex(&reflex).await?;
        tracing::info!("Registered reflex '{}' for {}", reflex.name, owner_id);
        Ok(reflex)
    }

    pub async fn enable_reflex(&self, owner_id: &str, name: &str) -> ReflexResult<()> {
        if !self.deps.reflexes.set_enabled(owner_id, name, true).await? {
            return Err(ReflexError::not_found(owner_id, name));
        }
        tracing::info!("Enabled reflex '{}' for {}", name, owner_id);
        Ok(())
    }

    /// Fails with [`ReflexError::Forbidden`] for the audit reflex.
    pub async fn disable_reflex(&self, owner_id: &str, name: &str) -> ReflexResult<()> {
        if builtins::is_protected(name) {
            return Err(ReflexError::Forbidden { name: name.to_string() });
        }
        if !self.deps.reflexes.set_enabled(owner_id, name, false).await? {
            return Err(ReflexError::not_found(owner_id, name));
        }
        tracing::info!("Disabled reflex '{}' for {}", name, owner_id);
        Ok(())
    }

    pub async fn update_confidence(&self, owner_id: &str, name: &str, confidence: f32) -> ReflexResult<()> {
        validate_confidence(confidence)?;
        if !self.deps.reflexes.set_confidence(owner_id, name, confidence).await? {
            return Err(ReflexError::not_found(owner_id, name));
        }
        Ok(())
    }

    pub async fn list_reflexes(&self, owner_id: &str, filter: &ReflexFilter) -> ReflexResult<Vec<Reflex>> {
        Ok(self.deps.reflexes.list_reflexes(owner_id, filter).await?)
    }

    // ========================================================================
    // Audit queries
    // ========================================================================

    pub async fn get_recent_executions(
        &self,
        owner_id: &str,
        limit: Option<usize>,
    ) -> ReflexResult<Vec<ExecutionRecord>> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT);
        Ok(self.deps.executions.recent_executions(owner_id, limit).await?)
    }

    /// Newest first, filtered by result (and optionally age) before the limit.
    pub async fn get_filtered_executions(
        &self,
        owner_id: &str,
        result: ExecutionResult,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> ReflexResult<Vec<ExecutionRecord>> {
        let query = ExecutionQuery {
            result,
            since,
            limit: limit.unwrap_or(DEFAULT_FILTERED_LIMIT),
        };
        Ok(self.deps.executions.query_executions(owner_id, &query).await?)
    }

    pub async fn get_execution_stats(
        &self,
        owner_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> ReflexResult<ExecutionStats> {
        Ok(self.deps.executions.execution_stats(owner_id, since).await?)
    }

    /// Process-wide counters since startup, in the aggregate taxonomy.
    pub fn global_counters(&self) -> AggregateCounters {
        self.tally.snapshot()
    }

    /// Delete audit records older than `max_age`.
    pub async fn prune_executions(&self, max_age: chrono::Duration) -> ReflexResult<u64> {
        let cutoff = Utc::now() - max_age;
        let removed = self.deps.executions.delete_older_than(cutoff).await?;
        if removed > 0 {
            tracing::info!("Pruned {} execution records older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}

fn validate_confidence(confidence: f32) -> ReflexResult<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ReflexError::InvalidConfidence(confidence))
    }
}

#[async_trait]
impl EventHandler for ReflexEngine {
    async fn handle(&self, event: &OwnedEvent) {
        if let Err(e) = self.handle_event(&event.owner_id, &event.event).await {
            tracing::error!(
                "Reflex evaluation failed for {} ({}): {}",
                event.owner_id,
                event.event.event_type(),
                e
            );
        }
    }
}
