//! Builtin reflexes seeded for every owner.

use claw_core::{Behavior, NewReflex, Reflex, TriggerLayer, ValueLayer};

pub const KEEPALIVE_HEARTBEAT: &str = "keepalive_heartbeat";
pub const RELATIONSHIP_DECAY_ALERT: &str = "relationship_decay_alert";
/// The baseline audit trail. Always enabled; disabling it is forbidden.
pub const AUDIT_BEHAVIOR_LOG: &str = "audit_behavior_log";
pub const FRIEND_REQUEST_REVIEW: &str = "friend_request_review";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinReflex {
    KeepaliveHeartbeat,
    RelationshipDecayAlert,
    AuditBehaviorLog,
    FriendRequestReview,
}

impl BuiltinReflex {
    pub const ALL: [BuiltinReflex; 4] = [
        BuiltinReflex::KeepaliveHeartbeat,
        BuiltinReflex::RelationshipDecayAlert,
        BuiltinReflex::AuditBehaviorLog,
        BuiltinReflex::FriendRequestReview,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        BuiltinReflex::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinReflex::KeepaliveHeartbeat => KEEPALIVE_HEARTBEAT,
            BuiltinReflex::RelationshipDecayAlert => RELATIONSHIP_DECAY_ALERT,
            BuiltinReflex::AuditBehaviorLog => AUDIT_BEHAVIOR_LOG,
            BuiltinReflex::FriendRequestReview => FRIEND_REQUEST_REVIEW,
        }
    }

    pub fn is_protected(self) -> bool {
        self == BuiltinReflex::AuditBehaviorLog
    }

    pub fn definition(self) -> NewReflex {
        let (trigger_layer, value_layer, behavior) = match self {
            BuiltinReflex::KeepaliveHeartbeat => {
                (TriggerLayer::Immediate, ValueLayer::Infrastructure, Behavior::Execute)
            }
            BuiltinReflex::RelationshipDecayAlert => {
                (TriggerLayer::Immediate, ValueLayer::Emotional, Behavior::Alert)
            }
            BuiltinReflex::AuditBehaviorLog => {
                (TriggerLayer::Immediate, ValueLayer::Infrastructure, Behavior::Execute)
            }
            BuiltinReflex::FriendRequestReview => {
                (TriggerLayer::Supervised, ValueLayer::Collaboration, Behavior::Recommend)
            }
        };
        NewReflex {
            name: self.name().to_string(),
            trigger_layer,
            value_layer,
            behavior,
            enabled: true,
            confidence: 1.0,
            config: serde_json::json!({}),
        }
    }
}

pub fn is_protected(name: &str) -> bool {
    BuiltinReflex::from_name(name).is_some_and(BuiltinReflex::is_protected)
}

/// Fresh builtin rows for `owner_id`, ready for an idempotent upsert.
pub fn seed_reflexes(owner_id: &str) -> Vec<Reflex> {
    BuiltinReflex::ALL
        .into_iter()
        .map(|b| Reflex::from_new(owner_id, b.definition()))
        .collect()
}
