use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Subcommand;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use claw_core::{
    ClawConfig, DomainEvent, ExecutionResult, HostNotifier, NewReflex, OwnedEvent, ReflexBatch,
    ReflexFilter, TriggerLayer,
};
use claw_reflex::{
    EventBus, EventDispatcher, LoggingHeartbeatSender, NoopHostNotifier, PublishError,
    ReflexBatchProcessor, ReflexEngine, ReflexEngineDeps, RetentionSweeper,
};
use claw_store::SqliteStore;

#[derive(Subcommand, Debug)]
pub enum ReflexCommands {
    /// List an owner's reflexes
    List {
        #[arg(short, long)]
        owner: String,
        /// Trigger layer: 0 (immediate) or 1 (supervised)
        #[arg(long)]
        layer: Option<u8>,
        #[arg(long)]
        enabled_only: bool,
    },
    /// Insert or refresh the builtin reflexes
    Seed {
        #[arg(short, long)]
        owner: String,
    },
    /// Register a custom reflex from a JSON definition
    Register {
        #[arg(short, long)]
        owner: String,
        /// JSON file holding the reflex definition
        #[arg(long)]
        file: PathBuf,
    },
    Enable {
        #[arg(short, long)]
        owner: String,
        name: String,
    },
    Disable {
        #[arg(short, long)]
        owner: String,
        name: String,
    },
    /// Set a reflex's confidence in [0, 1]
    Confidence {
        #[arg(short, long)]
        owner: String,
        name: String,
        value: f32,
    },
}

#[derive(Subcommand, Debug)]
pub enum ExecutionCommands {
    /// Newest execution records
    Recent {
        #[arg(short, long)]
        owner: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Records with one result, optionally within the last N hours
    Filter {
        #[arg(short, long)]
        owner: String,
        /// executed | recommended | blocked | queued_for_l1
        #[arg(long)]
        result: String,
        #[arg(long)]
        since_hours: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Count of records per result
    Stats {
        #[arg(short, long)]
        owner: String,
        #[arg(long)]
        since_hours: Option<i64>,
    },
}

// ============================================================================
// Wiring
// ============================================================================

async fn open_engine(config: &ClawConfig, host: Arc<dyn HostNotifier>) -> Result<(Arc<ReflexEngine>, Arc<SqliteStore>)> {
    let store = Arc::new(
        SqliteStore::new(&config.runtime.db_path)
            .await
            .with_context(|| format!("Failed to open database {}", config.runtime.db_path))?,
    );
    let deps = ReflexEngineDeps {
        reflexes: store.clone(),
        executions: store.clone(),
        heartbeat: Arc::new(LoggingHeartbeatSender),
        host,
    };
    Ok((Arc::new(ReflexEngine::new(deps, config.reflex.clone())), store))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn since_hours(hours: Option<i64>) -> Option<chrono::DateTime<chrono::Utc>> {
    hours.map(|h| chrono::Utc::now() - chrono::Duration::hours(h))
}

/// Host for running without a reviewer: every delivered batch is
/// acknowledged right away, so layer 1 only leaves an audit trail.
struct AuditOnlyHost {
    acks: mpsc::Sender<String>,
}

#[async_trait]
impl HostNotifier for AuditOnlyHost {
    async fn is_available(&self) -> bool {
        true
    }

    async fn notify(&self, batch: &ReflexBatch) -> Result<()> {
        self.acks
            .try_send(batch.batch_id.clone())
            .context("Acknowledgement queue unavailable")
    }
}

// ============================================================================
// Commands
// ============================================================================

pub async fn run(config: ClawConfig, owners: Vec<String>) -> Result<()> {
    let (ack_tx, mut ack_rx) = mpsc::channel::<String>(config.runtime.event_channel_capacity.max(1));
    let host: Arc<dyn HostNotifier> = Arc::new(AuditOnlyHost { acks: ack_tx });
    let (engine, store) = open_engine(&config, host.clone()).await?;

    info!("Seeding builtin reflexes for {} owners", owners.len());
    for owner in &owners {
        engine.seed_builtins(owner).await?;
    }
    engine.activate_layer1(ReflexBatchProcessor::new(config.batch.clone(), host));

    let ack_engine = Arc::clone(&engine);
    let ack_task = tokio::spawn(async move {
        while let Some(batch_id) = ack_rx.recv().await {
            let outcome = ack_engine.acknowledge_reflex_batch(&batch_id).await;
            info!("Auto-acknowledged batch {} ({} entries)", batch_id, outcome.acknowledged_count);
        }
    });

    let dispatcher = Arc::new(EventDispatcher::new());
    engine.initialize(&dispatcher).await;
    let (bus, stream) = EventBus::channel(config.runtime.event_channel_capacity);
    let dispatch_task = tokio::spawn(stream.run(Arc::clone(&dispatcher)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = RetentionSweeper::new(store, &config.retention).spawn(shutdown_rx.clone());
    let ticker = spawn_tick_loop(
        bus,
        owners,
        Duration::from_secs(config.runtime.tick_interval_secs.max(1)),
        shutdown_rx,
    );

    info!("clawd running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");

    shutdown_tx.send(true).ok();
    ticker.await.ok();
    sweeper.await.ok();
    // The ticker owned the last bus handle, so the stream drains and ends
    let processed = dispatch_task.await.unwrap_or(0);

    let abandoned = engine.shutdown().await;
    ack_task.abort();

    let counters = engine.global_counters();
    info!(
        "Processed {} events (allowed {}, blocked {}, escalated {}); {} undelivered layer-1 entries abandoned",
        processed, counters.allowed, counters.blocked, counters.escalated, abandoned
    );
    Ok(())
}

fn spawn_tick_loop(
    bus: EventBus,
    owners: Vec<String>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for owner in &owners {
                        match bus.try_publish(OwnedEvent::new(owner.clone(), DomainEvent::Tick)) {
                            Ok(()) => {}
                            Err(PublishError::Full) => warn!("Event bus full, tick for {} dropped", owner),
                            Err(PublishError::Closed) => return,
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

pub async fn handle_reflexes(config: &ClawConfig, action: ReflexCommands) -> Result<()> {
    let (engine, _) = open_engine(config, Arc::new(NoopHostNotifier)).await?;
    match action {
        ReflexCommands::List { owner, layer, enabled_only } => {
            let layer = layer
                .map(TriggerLayer::try_from)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let filter = ReflexFilter { layer, enabled_only };
            print_json(&engine.list_reflexes(&owner, &filter).await?)
        }
        ReflexCommands::Seed { owner } => print_json(&engine.seed_builtins(&owner).await?),
        ReflexCommands::Register { owner, file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let new: NewReflex = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid reflex definition in {}", file.display()))?;
            print_json(&engine.register_reflex(&owner, new).await?)
        }
        ReflexCommands::Enable { owner, name } => {
            engine.enable_reflex(&owner, &name).await?;
            println!("enabled {}", name);
            Ok(())
        }
        ReflexCommands::Disable { owner, name } => {
            engine.disable_reflex(&owner, &name).await?;
            println!("disabled {}", name);
            Ok(())
        }
        ReflexCommands::Confidence { owner, name, value } => {
            engine.update_confidence(&owner, &name, value).await?;
            println!("{} confidence = {}", name, value);
            Ok(())
        }
    }
}

pub async fn handle_executions(config: &ClawConfig, action: ExecutionCommands) -> Result<()> {
    let (engine, _) = open_engine(config, Arc::new(NoopHostNotifier)).await?;
    match action {
        ExecutionCommands::Recent { owner, limit } => {
            print_json(&engine.get_recent_executions(&owner, Some(limit)).await?)
        }
        ExecutionCommands::Filter { owner, result, since_hours: hours, limit } => {
            let result: ExecutionResult = result.parse()?;
            let records = engine
                .get_filtered_executions(&owner, result, since_hours(hours), limit)
                .await?;
            print_json(&records)
        }
        ExecutionCommands::Stats { owner, since_hours: hours } => {
            print_json(&engine.get_execution_stats(&owner, since_hours(hours)).await?)
        }
    }
}

pub async fn prune(config: &ClawConfig, days: Option<u32>) -> Result<()> {
    let (engine, _) = open_engine(config, Arc::new(NoopHostNotifier)).await?;
    let days = days.unwrap_or(config.retention.max_age_days);
    let removed = engine
        .prune_executions(chrono::Duration::days(i64::from(days)))
        .await?;
    println!("removed {} execution records older than {} days", removed, days);
    Ok(())
}
