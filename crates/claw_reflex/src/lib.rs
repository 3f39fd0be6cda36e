//! # Clawnet reflexes
//!
//! Rule-based automatic responses to domain events. Immediate (layer 0)
//! reflexes take effect at once; supervised (layer 1) decisions are
//! batched for review by an external host. Every decision is audited.

pub mod batch;
pub mod builtins;
pub mod dispatcher;
pub mod engine;
pub mod evaluate;
pub mod noop;
pub mod retention;
pub mod rules;

pub use batch::{EnqueueReport, FlushReport, ReflexBatchProcessor};
pub use dispatcher::{EventBus, EventDispatcher, EventHandler, EventStream, PublishError};
pub use engine::{EventReport, ReflexEngine, ReflexEngineDeps};
pub use evaluate::{Decision, ReflexProgram, SideEffect};
pub use noop::{LoggingHeartbeatSender, NoopHostNotifier};
pub use retention::RetentionSweeper;
pub use rules::{CustomRule, PayloadCondition, RuleOutcome};
