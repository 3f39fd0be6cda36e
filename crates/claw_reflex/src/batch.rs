//! Layer-1 batch processor
//!
//! Supervised decisions queue per owner and reach the host in batches:
//! as soon as `batch_size` undelivered entries have accumulated, or
//! `max_wait` after the first entry, whichever comes first. A delivered
//! batch stays counted in the owner's queue until the host acknowledges it.
//!
//! Each owner has one lane, locked for the whole of a flush, so a size
//! flush and a timer flush never deliver the same entries twice. Every
//! armed timer carries a processor-wide generation number. A flush that
//! empties the lane aborts the armed timer and clears it from the lane.
//! A timer task that wakes to find no timer armed, or one armed with
//! another generation, is stale and does nothing.
//!
//! A lane with nothing undelivered and no timer armed is removed from the
//! map once no caller holds it, so the map only tracks owners with work
//! in progress. Delivered batches live in `delivered`, not in the lane.
//!
//! Lock order: `lanes` map, then one lane, then `delivered`.
//! Acknowledgement only ever takes `delivered`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use claw_core::{
    AcknowledgeOutcome, BatchConfig, HostNotifier, OverflowPolicy, PendingL1Entry,
    PendingL1Status, ReflexBatch, ReflexError, ReflexResult,
};

/// What a flush did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batch_ids: Vec<String>,
    /// Entries handed to the host.
    pub delivered: usize,
    /// Undelivered entries left in the lane afterwards.
    pub remaining: usize,
}

/// What an enqueue did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueReport {
    /// Entry evicted under [`OverflowPolicy::DropOldest`].
    pub evicted: Option<PendingL1Entry>,
    /// Present when this entry crossed the size threshold.
    pub flush: Option<FlushReport>,
}

struct FlushTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct OwnerLane {
    pending: VecDeque<PendingL1Entry>,
    timer: Option<FlushTimer>,
}

impl OwnerLane {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.timer.is_none()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

struct DeliveredBatch {
    owner_id: String,
    entries: Vec<PendingL1Entry>,
}

struct Inner {
    config: BatchConfig,
    host: Arc<dyn HostNotifier>,
    lanes: Mutex<HashMap<String, Arc<Mutex<OwnerLane>>>>,
    /// Delivered, unacknowledged batches keyed by batch id.
    delivered: Mutex<HashMap<String, DeliveredBatch>>,
    /// Shared by all lanes so a released and recreated lane never reuses one.
    next_generation: AtomicU64,
    closed: AtomicBool,
}

/// Cheap to clone; all clones share the same queues.
#[derive(Clone)]
pub struct ReflexBatchProcessor {
    inner: Arc<Inner>,
}

impl ReflexBatchProcessor {
    pub fn new(config: BatchConfig, host: Arc<dyn HostNotifier>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                host,
                lanes: Mutex::new(HashMap::new()),
                delivered: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queue a layer-1 decision for host review.
    ///
    /// Fails with [`ReflexError::QueueFull`] when the owner's queue is at
    /// capacity and the overflow policy is `RejectNew` (or nothing
    /// undelivered is left to evict).
    pub async fn enqueue(&self, entry: PendingL1Entry) -> ReflexResult<EnqueueReport> {
        let owner_id = entry.owner_id.clone();
        let outcome = {
            let lane = self.inner.lane(&owner_id).await;
            let mut lane = lane.lock().await;
            let outcome = self.inner.enqueue_locked(&owner_id, &mut lane, entry).await;
            outcome
        };
        self.inner.release_idle_lane(&owner_id).await;
        outcome
    }

    /// Deliver whatever is waiting for `owner_id` now.
    pub async fn flush(&self, owner_id: &str) -> FlushReport {
        let Some(lane) = self.inner.existing_lane(owner_id).await else {
            return FlushReport::default();
        };
        let report = {
            let mut lane = lane.lock().await;
            let report = self.inner.flush_locked(owner_id, &mut lane).await;
            report
        };
        drop(lane);
        self.inner.release_idle_lane(owner_id).await;
        report
    }

    /// Release a delivered batch. Unknown or already-acknowledged ids
    /// acknowledge nothing.
    pub async fn acknowledge(&self, batch_id: &str) -> AcknowledgeOutcome {
        let removed = self.inner.delivered.lock().await.remove(batch_id);
        match removed {
            Some(batch) => {
                tracing::debug!(
                    "Acknowledged layer-1 batch {} for {} ({} entries)",
                    batch_id,
                    batch.owner_id,
                    batch.entries.len()
                );
                AcknowledgeOutcome {
                    acknowledged_count: batch.entries.len(),
                }
            }
            None => AcknowledgeOutcome::default(),
        }
    }

    pub async fn status(&self, owner_id: &str) -> PendingL1Status {
        let (undelivered, oldest_pending) = match self.inner.existing_lane(owner_id).await {
            Some(lane) => {
                let lane = lane.lock().await;
                (lane.pending.len(), lane.pending.front().map(|e| e.enqueued_at))
            }
            None => (0, None),
        };
        let (in_flight, oldest_delivered) = self.inner.delivered_summary(owner_id).await;
        PendingL1Status {
            queue_size: undelivered + in_flight,
            host_available: self.inner.host.is_available().await,
            oldest_entry: [oldest_pending, oldest_delivered].into_iter().flatten().min(),
        }
    }

    /// Cancel every pending timer. Queued entries are abandoned; the
    /// number abandoned is returned. Later enqueues still flush on size.
    pub async fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let lanes: Vec<(String, Arc<Mutex<OwnerLane>>)> = self
            .inner
            .lanes
            .lock()
            .await
            .iter()
            .map(|(owner, lane)| (owner.clone(), Arc::clone(lane)))
            .collect();

        let mut abandoned = 0;
        for (owner_id, lane) in lanes {
            {
                let mut lane = lane.lock().await;
                lane.cancel_timer();
                if !lane.pending.is_empty() {
                    tracing::warn!(
                        "Shutting down with {} undelivered layer-1 entries for {}",
                        lane.pending.len(),
                        owner_id
                    );
                    abandoned += lane.pending.len();
                }
            }
            drop(lane);
            self.inner.release_idle_lane(&owner_id).await;
        }
        abandoned
    }
}

impl Inner {
    async fn lane(&self, owner_id: &str) -> Arc<Mutex<OwnerLane>> {
        let mut lanes = self.lanes.lock().await;
        Arc::clone(lanes.entry(owner_id.to_string()).or_default())
    }

    async fn existing_lane(&self, owner_id: &str) -> Option<Arc<Mutex<OwnerLane>>> {
        self.lanes.lock().await.get(owner_id).cloned()
    }

    /// Drop the owner's lane if it is idle and nobody else holds it.
    /// Callers must have released their own handle to the lane.
    async fn release_idle_lane(&self, owner_id: &str) {
        let mut lanes = self.lanes.lock().await;
        let idle = match lanes.get(owner_id) {
            // With the map locked no new handle can be taken.
            Some(lane) if Arc::strong_count(lane) == 1 => {
                lane.try_lock().map_or(false, |lane| lane.is_idle())
            }
            _ => false,
        };
        if idle {
            lanes.remove(owner_id);
            tracing::trace!("Released idle layer-1 lane for {}", owner_id);
        }
    }

    async fn enqueue_locked(
        self: &Arc<Self>,
        owner_id: &str,
        lane: &mut OwnerLane,
        entry: PendingL1Entry,
    ) -> ReflexResult<EnqueueReport> {
        let (in_flight, _) = self.delivered_summary(owner_id).await;
        let capacity = self.config.max_queue_size;
        let mut report = EnqueueReport::default();

        if lane.pending.len() + in_flight >= capacity {
            match self.config.overflow_policy {
                OverflowPolicy::DropOldest if !lane.pending.is_empty() => {
                    report.evicted = lane.pending.pop_front();
                    tracing::warn!(
                        "Layer-1 queue for {} at capacity ({}), dropped oldest entry",
                        owner_id,
                        capacity
                    );
                }
                _ => {
                    return Err(ReflexError::QueueFull {
                        owner_id: owner_id.to_string(),
                        capacity,
                    })
                }
            }
        }

        lane.pending.push_back(entry);

        if lane.pending.len() >= self.config.batch_size.max(1) {
            report.flush = Some(self.flush_locked(owner_id, lane).await);
        } else {
            self.arm_timer(owner_id, lane);
        }
        Ok(report)
    }

    /// Entry count and oldest enqueue time across an owner's unacknowledged batches.
    async fn delivered_summary(&self, owner_id: &str) -> (usize, Option<DateTime<Utc>>) {
        let delivered = self.delivered.lock().await;
        delivered
            .values()
            .filter(|b| b.owner_id == owner_id)
            .flat_map(|b| b.entries.iter())
            .fold((0, None), |(count, oldest), entry| {
                let oldest = match oldest {
                    Some(t) if t <= entry.enqueued_at => Some(t),
                    _ => Some(entry.enqueued_at),
                };
                (count + 1, oldest)
            })
    }

    fn arm_timer(self: &Arc<Self>, owner_id: &str, lane: &mut OwnerLane) {
        if lane.timer.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let owner = owner_id.to_string();
        let wait = self.config.max_wait();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer(&owner, generation).await;
            }
        });
        lane.timer = Some(FlushTimer { generation, handle });
    }

    async fn on_timer(self: &Arc<Self>, owner_id: &str, generation: u64) {
        let Some(lane) = self.existing_lane(owner_id).await else {
            tracing::trace!("Flush timer for {} found no lane", owner_id);
            return;
        };
        let report = {
            let mut lane = lane.lock().await;
            match &lane.timer {
                Some(timer) if timer.generation == generation => {}
                _ => {
                    tracing::trace!("Stale flush timer for {} ignored", owner_id);
                    return;
                }
            }
            // Detach rather than abort: this task is the timer.
            lane.timer = None;
            let report = self.flush_locked(owner_id, &mut lane).await;
            report
        };
        drop(lane);
        self.release_idle_lane(owner_id).await;
        tracing::debug!(
            "Timed flush for {}: delivered {}, remaining {}",
            owner_id,
            report.delivered,
            report.remaining
        );
    }

    /// Deliver the lane's undelivered entries in `batch_size` chunks.
    /// Caller holds the lane lock.
    async fn flush_locked(self: &Arc<Self>, owner_id: &str, lane: &mut OwnerLane) -> FlushReport {
        let mut report = FlushReport::default();
        if lane.pending.is_empty() {
            lane.cancel_timer();
            return report;
        }

        if !self.host.is_available().await {
            tracing::debug!(
                "Host unavailable, keeping {} layer-1 entries for {}",
                lane.pending.len(),
                owner_id
            );
            report.remaining = lane.pending.len();
            self.arm_timer(owner_id, lane);
            return report;
        }

        let chunk = self.config.batch_size.max(1);
        while !lane.pending.is_empty() {
            let take = chunk.min(lane.pending.len());
            let batch = ReflexBatch {
                batch_id: Uuid::new_v4().to_string(),
                owner_id: owner_id.to_string(),
                entries: lane.pending.drain(..take).collect(),
                created_at: Utc::now(),
            };
            // Registered before notify so an acknowledgement may arrive first.
            self.delivered.lock().await.insert(
                batch.batch_id.clone(),
                DeliveredBatch {
                    owner_id: owner_id.to_string(),
                    entries: batch.entries.clone(),
                },
            );

            match self.host.notify(&batch).await {
                Ok(()) => {
                    tracing::info!(
                        "Delivered layer-1 batch {} for {} ({} entries)",
                        batch.batch_id,
                        owner_id,
                        batch.entries.len()
                    );
                    report.delivered += batch.entries.len();
                    report.batch_ids.push(batch.batch_id);
                }
                Err(e) => {
                    tracing::warn!("Failed to deliver layer-1 batch for {}: {:#}", owner_id, e);
                    let restored = self.delivered.lock().await.remove(&batch.batch_id);
                    if let Some(restored) = restored {
                        for entry in restored.entries.into_iter().rev() {
                            lane.pending.push_front(entry);
                        }
                    }
                    break;
                }
            }
        }

        report.remaining = lane.pending.len();
        if lane.pending.is_empty() {
            lane.cancel_timer();
        } else {
            self.arm_timer(owner_id, lane);
        }
        report
    }
}
