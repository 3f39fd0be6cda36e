//! Layer-1 review queue types shared between the batch processor and hosts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionDetails, ExecutionResult};

/// A layer-1 decision waiting for host review. Lives in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingL1Entry {
    pub owner_id: String,
    pub reflex_id: String,
    pub reflex_name: String,
    pub event_type: String,
    pub trigger_data: serde_json::Value,
    /// What the reflex would do if the host approves.
    pub proposed_result: ExecutionResult,
    pub details: ExecutionDetails,
    pub enqueued_at: DateTime<Utc>,
}

/// A group of layer-1 decisions delivered to the host together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflexBatch {
    pub batch_id: String,
    pub owner_id: String,
    pub entries: Vec<PendingL1Entry>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingL1Status {
    /// Undelivered entries plus delivered-but-unacknowledged ones.
    pub queue_size: usize,
    pub host_available: bool,
    pub oldest_entry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeOutcome {
    pub acknowledged_count: usize,
}
