//! Domain events consumed by the reflex engine.
//!
//! Producers (messaging, friendship, relationship tracking, the tick loop)
//! live outside this workspace; they only need to build these values.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Routing key used by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Tick,
    RelationshipChanged,
    MessageReceived,
    HeartbeatReceived,
    FriendshipChanged,
    Custom,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Tick,
        EventKind::RelationshipChanged,
        EventKind::MessageReceived,
        EventKind::HeartbeatReceived,
        EventKind::FriendshipChanged,
        EventKind::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Tick => "tick",
            EventKind::RelationshipChanged => "relationship_changed",
            EventKind::MessageReceived => "message_received",
            EventKind::HeartbeatReceived => "heartbeat_received",
            EventKind::FriendshipChanged => "friendship_changed",
            EventKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        EventKind::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

/// Relationship tiers between two claws, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipLayer {
    Core,
    Active,
    Casual,
    Dormant,
}

impl RelationshipLayer {
    pub fn rank(self) -> u8 {
        match self {
            RelationshipLayer::Core => 3,
            RelationshipLayer::Active => 2,
            RelationshipLayer::Casual => 1,
            RelationshipLayer::Dormant => 0,
        }
    }

    /// True when moving from `self` to `next` lowers the tier.
    pub fn is_downgrade_to(self, next: RelationshipLayer) -> bool {
        next.rank() < self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Rejected,
    Blocked,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Periodic tick from the runtime loop.
    Tick,
    RelationshipChanged {
        peer_id: String,
        old_layer: RelationshipLayer,
        new_layer: RelationshipLayer,
    },
    MessageReceived {
        peer_id: String,
        message_id: String,
        #[serde(default)]
        body_len: usize,
        #[serde(default)]
        encrypted: bool,
    },
    HeartbeatReceived {
        peer_id: String,
    },
    FriendshipChanged {
        peer_id: String,
        #[serde(default)]
        old_status: Option<FriendshipStatus>,
        new_status: FriendshipStatus,
    },
    /// Forward-compatible escape hatch for events only custom reflexes understand.
    Custom {
        event_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Tick => EventKind::Tick,
            DomainEvent::RelationshipChanged { .. } => EventKind::RelationshipChanged,
            DomainEvent::MessageReceived { .. } => EventKind::MessageReceived,
            DomainEvent::HeartbeatReceived { .. } => EventKind::HeartbeatReceived,
            DomainEvent::FriendshipChanged { .. } => EventKind::FriendshipChanged,
            DomainEvent::Custom { .. } => EventKind::Custom,
        }
    }

    /// The event type as written to the audit trail.
    pub fn event_type(&self) -> Cow<'_, str> {
        match self {
            DomainEvent::Custom { event_type, .. } => Cow::Borrowed(event_type.as_str()),
            other => Cow::Borrowed(other.kind().as_str()),
        }
    }

    /// True for a custom event whose type is empty or names a built-in kind.
    /// Such an event would be audited and matched as if it were the real one.
    pub fn has_reserved_type(&self) -> bool {
        match self {
            DomainEvent::Custom { event_type, .. } => {
                let normalized = event_type.trim().to_ascii_lowercase();
                normalized.is_empty() || EventKind::parse(&normalized).is_some()
            }
            _ => false,
        }
    }

    /// JSON snapshot stored as an execution's `trigger_data`.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A domain event addressed to one owner's reflexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedEvent {
    pub owner_id: String,
    pub event: DomainEvent,
}

impl OwnedEvent {
    pub fn new(owner_id: impl Into<String>, event: DomainEvent) -> Self {
        Self {
            owner_id: owner_id.into(),
            event,
        }
    }
}
