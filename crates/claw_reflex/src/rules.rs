//! Declarative custom reflexes
//!
//! A custom reflex keeps its rule in `Reflex::config`. Rules follow a
//! trigger → condition → outcome pattern over the event's JSON snapshot,
//! so owners can add behavior without a new builtin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use claw_core::{DomainEvent, ExecutionResult};

// ============================================================================
// Rule Data Model
// ============================================================================

/// Trigger that matches every event type.
pub const ANY_EVENT: &str = "*";

/// A custom reflex rule, parsed from `Reflex::config`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomRule {
    /// Event types this rule listens to (`"*"` for all).
    pub triggers: Vec<String>,
    #[serde(default = "default_condition")]
    pub condition: PayloadCondition,
    /// Decision when the condition holds.
    pub outcome: RuleOutcome,
    /// Free-form action label recorded in the execution details.
    #[serde(default)]
    pub action: Option<String>,
}

fn default_condition() -> PayloadCondition {
    PayloadCondition::Always
}

/// What a custom rule decides. Queueing for review is the engine's call,
/// never the rule's.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    Executed,
    Recommended,
    Blocked,
}

impl From<RuleOutcome> for ExecutionResult {
    fn from(outcome: RuleOutcome) -> Self {
        match outcome {
            RuleOutcome::Executed => ExecutionResult::Executed,
            RuleOutcome::Recommended => ExecutionResult::Recommended,
            RuleOutcome::Blocked => ExecutionResult::Blocked,
        }
    }
}

/// Condition over the event snapshot. Paths are dot-separated
/// (`new_status`, `payload.score`, `payload.tags.0`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadCondition {
    Always,
    All { conditions: Vec<PayloadCondition> },
    Any { conditions: Vec<PayloadCondition> },
    Not { condition: Box<PayloadCondition> },
    Equals { path: String, value: Value },
    Gt { path: String, value: f64 },
    Lt { path: String, value: f64 },
    Exists { path: String },
}

impl CustomRule {
    /// `None` when the config is not a valid rule; such a reflex never fires.
    pub fn from_config(config: &Value) -> Option<Self> {
        match serde_json::from_value::<CustomRule>(config.clone()) {
            Ok(rule) if !rule.triggers.is_empty() => Some(rule),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("Ignoring unparseable custom reflex config: {}", e);
                None
            }
        }
    }

    pub fn listens_to(&self, event: &DomainEvent) -> bool {
        let event_type = event.event_type();
        self.triggers
            .iter()
            .any(|t| t == ANY_EVENT || t.as_str() == event_type)
    }

    /// Trigger and condition both hold for this event snapshot.
    pub fn matches(&self, event: &DomainEvent, snapshot: &Value) -> bool {
        self.listens_to(event) && evaluate_condition(&self.condition, snapshot)
    }

    pub fn action_label(&self) -> &str {
        self.action.as_deref().unwrap_or("custom_rule")
    }
}

// ============================================================================
// Condition Evaluation Helpers
// ============================================================================

pub(crate) fn lookup<'a>(snapshot: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(snapshot);
    }
    path.split('.').try_fold(snapshot, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn evaluate_condition(cond: &PayloadCondition, snapshot: &Value) -> bool {
    match cond {
        PayloadCondition::Always => true,
        PayloadCondition::All { conditions } => {
            conditions.iter().all(|c| evaluate_condition(c, snapshot))
        }
        PayloadCondition::Any { conditions } => {
            conditions.iter().any(|c| evaluate_condition(c, snapshot))
        }
        PayloadCondition::Not { condition } => !evaluate_condition(condition, snapshot),
        PayloadCondition::Equals { path, value } => {
            lookup(snapshot, path).is_some_and(|v| v == value)
        }
        PayloadCondition::Gt { path, value } => lookup(snapshot, path)
            .and_then(Value::as_f64)
            .is_some_and(|v| v > *value),
        PayloadCondition::Lt { path, value } => lookup(snapshot, path)
            .and_then(Value::as_f64)
            .is_some_and(|v| v < *value),
        PayloadCondition::Exists { path } => {
            lookup(snapshot, path).is_some_and(|v| !v.is_null())
        }
    }
}
