//! Periodic deletion of old execution records.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use claw_core::{ExecutionStore, RetentionConfig};

pub struct RetentionSweeper {
    store: Arc<dyn ExecutionStore>,
    max_age: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ExecutionStore>, config: &RetentionConfig) -> Self {
        Self {
            store,
            max_age: chrono::Duration::days(i64::from(config.max_age_days)),
            interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    pub async fn sweep_once(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.max_age;
        let removed = self.store.delete_older_than(cutoff).await?;
        if removed > 0 {
            tracing::info!("Retention sweep removed {} execution records", removed);
        }
        Ok(removed)
    }

    /// Sweep on every interval tick until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::warn!("Retention sweep failed: {:#}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Retention sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
