//! # Clawnet core
//!
//! Domain types shared by the reflex engine and its storage adapters:
//! reflex definitions, execution audit records, the domain events the
//! engine consumes, and the narrow ports (traits) the engine is wired to.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod pending;
pub mod ports;
pub mod reflex;

pub use config::{BatchConfig, ClawConfig, OverflowPolicy, ReflexConfig, RetentionConfig, RuntimeConfig};
pub use error::{ReflexError, ReflexResult};
pub use event::{DomainEvent, EventKind, FriendshipStatus, OwnedEvent, RelationshipLayer};
pub use execution::{
    AggregateCounters, AggregateOutcome, AlertType, ExecutionDetails, ExecutionQuery,
    ExecutionRecord, ExecutionResult, ExecutionStats,
};
pub use pending::{AcknowledgeOutcome, PendingL1Entry, PendingL1Status, ReflexBatch};
pub use ports::{ExecutionStore, HeartbeatSender, HostNotifier, ReflexStore};
pub use reflex::{Behavior, NewReflex, Reflex, ReflexFilter, TriggerLayer, ValueLayer};
