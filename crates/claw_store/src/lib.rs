//! Storage backends for reflexes and their execution audit trail.
//!
//! Both backends implement [`claw_core::ReflexStore`] and
//! [`claw_core::ExecutionStore`]:
//! - [`SqliteStore`]: durable, used by the daemon.
//! - [`InMemoryStore`]: process-local, used by tests and ephemeral runs.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
