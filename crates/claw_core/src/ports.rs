//! Ports the reflex engine is wired to. Adapters live in `claw_store`
//! (persistence) and in the host integration (notification, heartbeat).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::execution::{ExecutionQuery, ExecutionRecord, ExecutionStats};
use crate::pending::ReflexBatch;
use crate::reflex::{Reflex, ReflexFilter};

/// Persists reflex definitions and enablement, keyed by owner.
#[async_trait]
pub trait ReflexStore: Send + Sync {
    /// Insert a new reflex. Fails if `(owner_id, name)` already exists.
    async fn insert_reflex(&self, reflex: &Reflex) -> anyhow::Result<()>;

    /// Insert if absent; otherwise refresh the definition fields
    /// (`trigger_layer`, `value_layer`, `behavior`) and keep `enabled`,
    /// `confidence` and `config` as they are. Returns the stored row.
    async fn upsert_builtin(&self, reflex: &Reflex) -> anyhow::Result<Reflex>;

    async fn find_reflex(&self, owner_id: &str, name: &str) -> anyhow::Result<Option<Reflex>>;

    async fn list_reflexes(&self, owner_id: &str, filter: &ReflexFilter) -> anyhow::Result<Vec<Reflex>>;

    /// Returns false when no such reflex exists.
    async fn set_enabled(&self, owner_id: &str, name: &str, enabled: bool) -> anyhow::Result<bool>;

    /// Returns false when no such reflex exists.
    async fn set_confidence(&self, owner_id: &str, name: &str, confidence: f32) -> anyhow::Result<bool>;
}

/// Persists immutable execution audit records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, record: &ExecutionRecord) -> anyhow::Result<()>;

    /// Newest first.
    async fn recent_executions(&self, owner_id: &str, limit: usize) -> anyhow::Result<Vec<ExecutionRecord>>;

    /// Newest first. The filter is applied before the limit.
    async fn query_executions(
        &self,
        owner_id: &str,
        query: &ExecutionQuery,
    ) -> anyhow::Result<Vec<ExecutionRecord>>;

    async fn execution_stats(
        &self,
        owner_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<ExecutionStats>;

    /// Retention sweep. Returns the number of records removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Side effect of the keepalive reflex.
#[async_trait]
pub trait HeartbeatSender: Send + Sync {
    async fn send_heartbeat(&self, owner_id: &str) -> anyhow::Result<()>;
}

/// The external reviewer consulted for layer-1 decisions.
#[async_trait]
pub trait HostNotifier: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn notify(&self, batch: &ReflexBatch) -> anyhow::Result<()>;
}
