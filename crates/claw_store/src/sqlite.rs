use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claw_core::{
    ExecutionDetails, ExecutionQuery, ExecutionRecord, ExecutionResult, ExecutionStats,
    ExecutionStore, Reflex, ReflexFilter, ReflexStore, TriggerLayer,
};
use sqlx::{sqlite::SqlitePoolOptions, sqlite::SqliteRow, Pool, Row, Sqlite};
use std::path::Path;

const REFLEX_COLUMNS: &str = "id, owner_id, name, trigger_layer, value_layer, behavior, \
     enabled, confidence, config, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, reflex_id, owner_id, event_type, trigger_data, \
     execution_result, details, created_at";

/// SQLite-backed reflex registry and execution audit trail.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, _meta| Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(conn).await?;
                Ok(())
            }))
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. A single connection that never idles out,
    /// so the data lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(|conn, _meta| Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(conn).await?;
                Ok(())
            }))
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reflexes (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                trigger_layer INTEGER NOT NULL CHECK (trigger_layer IN (0, 1)),
                value_layer TEXT NOT NULL,
                behavior TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                confidence REAL NOT NULL DEFAULT 1.0,
                config TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (owner_id, name)
            );
            "#
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reflexes table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reflex_executions (
                id TEXT PRIMARY KEY,
                reflex_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                trigger_data TEXT NOT NULL,
                execution_result TEXT NOT NULL
                    CHECK (execution_result IN ('executed', 'recommended', 'blocked', 'queued_for_l1')),
                details TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(reflex_id) REFERENCES reflexes(id)
            );
            "#
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reflex_executions table")?;

        // Per-owner timelines (recent / filtered queries)
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reflex_executions_owner_created ON reflex_executions(owner_id, created_at)"
        )
        .execute(&self.pool)
        .await
        .context("Failed to create executions owner index")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reflex_executions_reflex_result ON reflex_executions(reflex_id, execution_result)"
        )
        .execute(&self.pool)
        .await
        .context("Failed to create executions result index")?;

        Ok(())
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .with_context(|| format!("Timestamp out of range: {}", ms))
}

fn row_to_reflex(row: &SqliteRow) -> Result<Reflex> {
    let layer: i64 = row.try_get("trigger_layer")?;
    let trigger_layer = u8::try_from(layer)
        .ok()
        .and_then(|l| TriggerLayer::try_from(l).ok())
        .with_context(|| format!("Invalid trigger_layer in database: {}", layer))?;
    let value_layer: String = row.try_get("value_layer")?;
    let behavior: String = row.try_get("behavior")?;
    let config: String = row.try_get("config")?;
    let confidence: f64 = row.try_get("confidence")?;

    Ok(Reflex {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        trigger_layer,
        value_layer: value_layer.parse()?,
        behavior: behavior.parse()?,
        enabled: row.try_get("enabled")?,
        confidence: confidence as f32,
        config: serde_json::from_str(&config).context("Failed to deserialize reflex config")?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<ExecutionRecord> {
    let trigger_data: String = row.try_get("trigger_data")?;
    let result: String = row.try_get("execution_result")?;
    let details: String = row.try_get("details")?;

    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        reflex_id: row.try_get("reflex_id")?,
        owner_id: row.try_get("owner_id")?,
        event_type: row.try_get("event_type")?,
        trigger_data: serde_json::from_str(&trigger_data)
            .context("Failed to deserialize trigger data")?,
        execution_result: result.parse()?,
        details: serde_json::from_str::<ExecutionDetails>(&details)
            .context("Failed to deserialize execution details")?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
    })
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl ReflexStore for SqliteStore {
    async fn insert_reflex(&self, reflex: &Reflex) -> Result<()> {
        let config = serde_json::to_string(&reflex.config).context("Failed to serialize reflex config")?;
        sqlx::query(
            r#"
            INSERT INTO reflexes (id, owner_id, name, trigger_layer, value_layer, behavior,
                                  enabled, confidence, config, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        )
        .bind(&reflex.id)
        .bind(&reflex.owner_id)
        .bind(&reflex.name)
        .bind(i64::from(reflex.trigger_layer.as_u8()))
        .bind(reflex.value_layer.as_str())
        .bind(reflex.behavior.as_str())
        .bind(reflex.enabled)
        .bind(f64::from(reflex.confidence))
        .bind(config)
        .bind(reflex.created_at.timestamp_millis())
        .bind(reflex.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert reflex '{}'", reflex.name))?;
        Ok(())
    }

    async fn upsert_builtin(&self, reflex: &Reflex) -> Result<Reflex> {
        let config = serde_json::to_string(&reflex.config).context("Failed to serialize reflex config")?;
        sqlx::query(
            r#"
            INSERT INTO reflexes (id, owner_id, name, trigger_layer, value_layer, behavior,
                                  enabled, confidence, config, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, name) DO UPDATE SET
                trigger_layer = excluded.trigger_layer,
                value_layer = excluded.value_layer,
                behavior = excluded.behavior,
                updated_at = excluded.updated_at
            "#
        )
        .bind(&reflex.id)
        .bind(&reflex.owner_id)
        .bind(&reflex.name)
        .bind(i64::from(reflex.trigger_layer.as_u8()))
        .bind(reflex.value_layer.as_str())
        .bind(reflex.behavior.as_str())
        .bind(reflex.enabled)
        .bind(f64::from(reflex.confidence))
        .bind(config)
        .bind(reflex.created_at.timestamp_millis())
        .bind(reflex.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert builtin reflex '{}'", reflex.name))?;

        self.find_reflex(&reflex.owner_id, &reflex.name)
            .await?
            .with_context(|| format!("Builtin reflex '{}' missing after upsert", reflex.name))
    }

    async fn find_reflex(&self, owner_id: &str, name: &str) -> Result<Option<Reflex>> {
        let sql = format!("SELECT {} FROM reflexes WHERE owner_id = ? AND name = ?", REFLEX_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query reflex")?;

        row.as_ref().map(row_to_reflex).transpose()
    }

    async fn list_reflexes(&self, owner_id: &str, filter: &ReflexFilter) -> Result<Vec<Reflex>> {
        let sql = format!(
            "SELECT {} FROM reflexes \
             WHERE owner_id = ? \
               AND (? IS NULL OR trigger_layer = ?) \
               AND (? = 0 OR enabled = 1) \
             ORDER BY name ASC",
            REFLEX_COLUMNS
        );
        let layer = filter.layer.map(|l| i64::from(l.as_u8()));
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(layer)
            .bind(layer)
            .bind(filter.enabled_only)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list reflexes")?;

        rows.iter().map(row_to_reflex).collect()
    }

    async fn set_enabled(&self, owner_id: &str, name: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE reflexes SET enabled = ?, updated_at = ? WHERE owner_id = ? AND name = ?"
        )
        .bind(enabled)
        .bind(Utc::now().timestamp_millis())
        .bind(owner_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .context("Failed to update reflex enablement")?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_confidence(&self, owner_id: &str, name: &str, confidence: f32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE reflexes SET confidence = ?, updated_at = ? WHERE owner_id = ? AND name = ?"
        )
        .bind(f64::from(confidence))
        .bind(Utc::now().timestamp_millis())
        .bind(owner_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .context("Failed to update reflex confidence")?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let trigger_data = serde_json::to_string(&record.trigger_data)
            .context("Failed to serialize trigger data")?;
        let details = serde_json::to_string(&record.details)
            .context("Failed to serialize execution details")?;

        sqlx::query(
            r#"
            INSERT INTO reflex_executions (id, reflex_id, owner_id, event_type, trigger_data,
                                           execution_result, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#
        )
        .bind(&record.id)
        .bind(&record.reflex_id)
        .bind(&record.owner_id)
        .bind(&record.event_type)
        .bind(trigger_data)
        .bind(record.execution_result.as_str())
        .bind(details)
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert execution record")?;

        Ok(())
    }

    async fn recent_executions(&self, owner_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let sql = format!(
            "SELECT {} FROM reflex_executions WHERE owner_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch recent executions")?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn query_executions(&self, owner_id: &str, query: &ExecutionQuery) -> Result<Vec<ExecutionRecord>> {
        // Filter in SQL so LIMIT counts matching rows only
        let sql = format!(
            "SELECT {} FROM reflex_executions \
             WHERE owner_id = ? AND execution_result = ? AND created_at >= ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            EXECUTION_COLUMNS
        );
        let since = query.since.map_or(i64::MIN, |s| s.timestamp_millis());
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(query.result.as_str())
            .bind(since)
            .bind(clamp_limit(query.limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to query filtered executions")?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn execution_stats(&self, owner_id: &str, since: Option<DateTime<Utc>>) -> Result<ExecutionStats> {
        let since = since.map_or(i64::MIN, |s| s.timestamp_millis());
        let rows = sqlx::query(
            "SELECT execution_result, COUNT(*) AS n FROM reflex_executions \
             WHERE owner_id = ? AND created_at >= ? \
             GROUP BY execution_result"
        )
        .bind(owner_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count executions")?;

        let mut stats = ExecutionStats::default();
        for row in rows {
            let result: String = row.try_get("execution_result")?;
            let count: i64 = row.try_get("n")?;
            stats.add(result.parse::<ExecutionResult>()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM reflex_executions WHERE created_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to prune execution records")?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::debug!("Pruned {} execution records older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }
}
