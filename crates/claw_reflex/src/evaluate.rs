//! Pure reflex evaluation: does a reflex match an event, and what does it decide.
//!
//! Nothing here touches storage or the host. The engine applies the
//! confidence gate and the layer routing on top of a [`Decision`].

use serde_json::Value;

use claw_core::{
    AlertType, DomainEvent, ExecutionDetails, ExecutionResult, FriendshipStatus, Reflex,
};

use crate::builtins::BuiltinReflex;
use crate::rules::CustomRule;

/// Side effect the engine performs after an `executed` decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    SendHeartbeat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub result: ExecutionResult,
    pub details: ExecutionDetails,
    pub effect: Option<SideEffect>,
}

impl Decision {
    fn new(result: ExecutionResult, details: ExecutionDetails) -> Self {
        Self {
            result,
            details,
            effect: None,
        }
    }

    fn with_effect(mut self, effect: SideEffect) -> Self {
        self.effect = Some(effect);
        self
    }
}

/// The behavior bound to a reflex row: a builtin by name, or a custom rule
/// read from its config.
#[derive(Debug, Clone, PartialEq)]
pub enum ReflexProgram {
    Builtin(BuiltinReflex),
    Custom(CustomRule),
    /// Config that is not a valid rule. Never matches.
    Inert,
}

impl ReflexProgram {
    pub fn for_reflex(reflex: &Reflex) -> Self {
        if let Some(builtin) = BuiltinReflex::from_name(&reflex.name) {
            return ReflexProgram::Builtin(builtin);
        }
        match CustomRule::from_config(&reflex.config) {
            Some(rule) => ReflexProgram::Custom(rule),
            None => ReflexProgram::Inert,
        }
    }

    /// A matching program always produces exactly one decision.
    pub fn matches(&self, event: &DomainEvent, snapshot: &Value) -> bool {
        match self {
            ReflexProgram::Builtin(BuiltinReflex::KeepaliveHeartbeat) => {
                matches!(event, DomainEvent::Tick)
            }
            ReflexProgram::Builtin(BuiltinReflex::RelationshipDecayAlert) => matches!(
                event,
                DomainEvent::RelationshipChanged { old_layer, new_layer, .. }
                    if old_layer.is_downgrade_to(*new_layer)
            ),
            ReflexProgram::Builtin(BuiltinReflex::AuditBehaviorLog) => true,
            ReflexProgram::Builtin(BuiltinReflex::FriendRequestReview) => matches!(
                event,
                DomainEvent::FriendshipChanged {
                    new_status: FriendshipStatus::Pending,
                    ..
                }
            ),
            ReflexProgram::Custom(rule) => rule.matches(event, snapshot),
            ReflexProgram::Inert => false,
        }
    }

    /// Decide for an event this program matches.
    pub fn decide(&self, event: &DomainEvent) -> Decision {
        match self {
            ReflexProgram::Builtin(BuiltinReflex::KeepaliveHeartbeat) => Decision::new(
                ExecutionResult::Executed,
                ExecutionDetails::new("send_heartbeat", "periodic keepalive"),
            )
            .with_effect(SideEffect::SendHeartbeat),
            ReflexProgram::Builtin(BuiltinReflex::RelationshipDecayAlert) => {
                let reason = match event {
                    DomainEvent::RelationshipChanged { peer_id, old_layer, new_layer } => format!(
                        "relationship with {} dropped from {:?} to {:?}",
                        peer_id, old_layer, new_layer
                    ),
                    _ => "relationship downgraded".to_string(),
                };
                Decision::new(
                    ExecutionResult::Executed,
                    ExecutionDetails::new("alert_owner", reason)
                        .with_alert(AlertType::RelationshipDowngrade),
                )
            }
            ReflexProgram::Builtin(BuiltinReflex::AuditBehaviorLog) => Decision::new(
                ExecutionResult::Executed,
                ExecutionDetails::new("log_event", format!("observed {}", event.event_type())),
            ),
            ReflexProgram::Builtin(BuiltinReflex::FriendRequestReview) => {
                let reason = match event {
                    DomainEvent::FriendshipChanged { peer_id, .. } => {
                        format!("incoming friend request from {}", peer_id)
                    }
                    _ => "incoming friend request".to_string(),
                };
                Decision::new(
                    ExecutionResult::Recommended,
                    ExecutionDetails::new("review_friend_request", reason),
                )
            }
            ReflexProgram::Custom(rule) => Decision::new(
                rule.outcome.into(),
                ExecutionDetails::new(
                    rule.action_label(),
                    format!("custom rule matched {}", event.event_type()),
                ),
            ),
            ReflexProgram::Inert => Decision::new(
                ExecutionResult::Recommended,
                ExecutionDetails::new("none", "inert reflex"),
            ),
        }
    }
}

/// Evaluate one reflex against one event. `None` when it does not match.
pub fn evaluate(reflex: &Reflex, event: &DomainEvent) -> Option<Decision> {
    let program = ReflexProgram::for_reflex(reflex);
    let snapshot = event.snapshot();
    program
        .matches(event, &snapshot)
        .then(|| program.decide(event))
}

/// Uncertainty discounting: below `threshold`, a binding decision is
/// downgraded to a recommendation and its side effect dropped.
pub fn gate_confidence(mut decision: Decision, confidence: f32, threshold: f32) -> Decision {
    if decision.result.is_binding() && confidence < threshold {
        tracing::debug!(
            "Decision dampened due to low confidence: {:.2} < {:.2}",
            confidence,
            threshold
        );
        decision.details.proposed_result = Some(decision.result);
        decision.details.dampened = true;
        decision.result = ExecutionResult::Recommended;
        decision.effect = None;
    }
    decision
}
