//! Fallback adapters for running without a messaging host attached.

use async_trait::async_trait;

use claw_core::{HeartbeatSender, HostNotifier, ReflexBatch};

/// Heartbeat sender that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHeartbeatSender;

#[async_trait]
impl HeartbeatSender for LoggingHeartbeatSender {
    async fn send_heartbeat(&self, owner_id: &str) -> anyhow::Result<()> {
        tracing::debug!("Heartbeat for {}", owner_id);
        Ok(())
    }
}

/// Always available, accepts every batch and does nothing with it.
/// Layer 1 becomes audit-only: batches are delivered and wait for an
/// acknowledgement that only an operator can give.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHostNotifier;

#[async_trait]
impl HostNotifier for NoopHostNotifier {
    async fn is_available(&self) -> bool {
        true
    }

    async fn notify(&self, batch: &ReflexBatch) -> anyhow::Result<()> {
        tracing::debug!(
            "No host attached; batch {} for {} ({} entries) recorded only",
            batch.batch_id,
            batch.owner_id,
            batch.entries.len()
        );
        Ok(())
    }
}
