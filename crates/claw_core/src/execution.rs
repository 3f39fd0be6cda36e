//! Execution audit records and the two outcome taxonomies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::reflex::Reflex;

/// Per-execution decision, as stored in `reflex_executions.execution_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Executed,
    Recommended,
    Blocked,
    QueuedForL1,
}

impl ExecutionResult {
    pub const ALL: [ExecutionResult; 4] = [
        ExecutionResult::Executed,
        ExecutionResult::Recommended,
        ExecutionResult::Blocked,
        ExecutionResult::QueuedForL1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionResult::Executed => "executed",
            ExecutionResult::Recommended => "recommended",
            ExecutionResult::Blocked => "blocked",
            ExecutionResult::QueuedForL1 => "queued_for_l1",
        }
    }

    /// Binding decisions change what happens; recommendations only inform.
    pub fn is_binding(self) -> bool {
        matches!(self, ExecutionResult::Executed | ExecutionResult::Blocked)
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionResult {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionResult::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown execution result: {}", s))
    }
}

/// Cross-owner reporting taxonomy.
///
/// Distinct from [`ExecutionResult`]. Conversion:
///
/// | execution result | aggregate   |
/// |------------------|-------------|
/// | `executed`       | `allowed`   |
/// | `recommended`    | `allowed`   |
/// | `blocked`        | `blocked`   |
/// | `queued_for_l1`  | `escalated` |
///
/// A recommendation never stops anything, so the event it was raised for
/// counts as allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOutcome {
    Allowed,
    Blocked,
    Escalated,
}

impl From<ExecutionResult> for AggregateOutcome {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Executed | ExecutionResult::Recommended => AggregateOutcome::Allowed,
            ExecutionResult::Blocked => AggregateOutcome::Blocked,
            ExecutionResult::QueuedForL1 => AggregateOutcome::Escalated,
        }
    }
}

/// Snapshot of the process-wide aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounters {
    pub allowed: u64,
    pub blocked: u64,
    pub escalated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    RelationshipDowngrade,
}

/// Structured decision metadata stored in `reflex_executions.details`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetails {
    /// What was done, or would have been done.
    pub action: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<AlertType>,
    /// For deferred or downgraded decisions: what the reflex originally wanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_result: Option<ExecutionResult>,
    /// Set when low confidence turned a binding decision into a recommendation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dampened: bool,
    /// Why a layer-1 decision was recorded without being queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferral: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionDetails {
    pub fn new(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn with_alert(mut self, alert_type: AlertType) -> Self {
        self.alert_type = Some(alert_type);
        self
    }
}

/// Immutable audit entry: one reflex's decision for one event occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub reflex_id: String,
    pub owner_id: String,
    pub event_type: String,
    pub trigger_data: serde_json::Value,
    pub execution_result: ExecutionResult,
    pub details: ExecutionDetails,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        reflex: &Reflex,
        event_type: impl Into<String>,
        trigger_data: serde_json::Value,
        execution_result: ExecutionResult,
        details: ExecutionDetails,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            reflex_id: reflex.id.clone(),
            owner_id: reflex.owner_id.clone(),
            event_type: event_type.into(),
            trigger_data,
            execution_result,
            details,
            created_at: Utc::now(),
        }
    }
}

/// Filter pushed down to the execution store. Applied before the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionQuery {
    pub result: ExecutionResult,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl ExecutionQuery {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        record.execution_result == self.result
            && self.since.map_or(true, |since| record.created_at >= since)
    }
}

/// Per-owner count of executions by result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub executed: u64,
    pub recommended: u64,
    pub blocked: u64,
    pub queued_for_l1: u64,
}

impl ExecutionStats {
    pub fn add(&mut self, result: ExecutionResult, count: u64) {
        match result {
            ExecutionResult::Executed => self.executed += count,
            ExecutionResult::Recommended => self.recommended += count,
            ExecutionResult::Blocked => self.blocked += count,
            ExecutionResult::QueuedForL1 => self.queued_for_l1 += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.executed + self.recommended + self.blocked + self.queued_for_l1
    }
}
