use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claw_core::{
    ExecutionQuery, ExecutionRecord, ExecutionStats, ExecutionStore, Reflex, ReflexFilter,
    ReflexStore,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store. Executions are kept in insertion order, so "newest
/// first" is a reverse scan.
#[derive(Default)]
pub struct InMemoryStore {
    reflexes: RwLock<HashMap<(String, String), Reflex>>,
    executions: RwLock<Vec<ExecutionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

fn key(owner_id: &str, name: &str) -> (String, String) {
    (owner_id.to_string(), name.to_string())
}

#[async_trait]
impl ReflexStore for InMemoryStore {
    async fn insert_reflex(&self, reflex: &Reflex) -> Result<()> {
        let mut reflexes = self.reflexes.write().await;
        let k = key(&reflex.owner_id, &reflex.name);
        if reflexes.contains_key(&k) {
            bail!("Reflex '{}' already exists for owner '{}'", reflex.name, reflex.owner_id);
        }
        reflexes.insert(k, reflex.clone());
        Ok(())
    }

    async fn upsert_builtin(&self, reflex: &Reflex) -> Result<Reflex> {
        let mut reflexes = self.reflexes.write().await;
        let stored = reflexes
            .entry(key(&reflex.owner_id, &reflex.name))
            .and_modify(|existing| {
                existing.trigger_layer = reflex.trigger_layer;
                existing.value_layer = reflex.value_layer;
                existing.behavior = reflex.behavior;
                existing.updated_at = reflex.updated_at;
            })
            .or_insert_with(|| reflex.clone());
        Ok(stored.clone())
    }

    async fn find_reflex(&self, owner_id: &str, name: &str) -> Result<Option<Reflex>> {
        Ok(self.reflexes.read().await.get(&key(owner_id, name)).cloned())
    }

    async fn list_reflexes(&self, owner_id: &str, filter: &ReflexFilter) -> Result<Vec<Reflex>> {
        let mut out: Vec<Reflex> = self
            .reflexes
            .read()
            .await
            .values()
            .filter(|r| r.owner_id == owner_id && filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn set_enabled(&self, owner_id: &str, name: &str, enabled: bool) -> Result<bool> {
        let mut reflexes = self.reflexes.write().await;
        match reflexes.get_mut(&key(owner_id, name)) {
            Some(reflex) => {
                reflex.enabled = enabled;
                reflex.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_confidence(&self, owner_id: &str, name: &str, confidence: f32) -> Result<bool> {
        let mut reflexes = self.reflexes.write().await;
        match reflexes.get_mut(&key(owner_id, name)) {
            Some(reflex) => {
                reflex.confidence = confidence;
                reflex.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.executions.write().await.push(record.clone());
        Ok(())
    }

    async fn recent_executions(&self, owner_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let executions = self.executions.read().await;
        let mut out: Vec<ExecutionRecord> = executions
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps; reverse for newest first
        out.sort_by_key(|r| r.created_at);
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }

    async fn query_executions(&self, owner_id: &str, query: &ExecutionQuery) -> Result<Vec<ExecutionRecord>> {
        let executions = self.executions.read().await;
        let mut out: Vec<ExecutionRecord> = executions
            .iter()
            .filter(|r| r.owner_id == owner_id && query.matches(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out.reverse();
        out.truncate(query.limit);
        Ok(out)
    }

    async fn execution_stats(&self, owner_id: &str, since: Option<DateTime<Utc>>) -> Result<ExecutionStats> {
        let executions = self.executions.read().await;
        let mut stats = ExecutionStats::default();
        for record in executions
            .iter()
            .filter(|r| r.owner_id == owner_id && since.map_or(true, |s| r.created_at >= s))
        {
            stats.add(record.execution_result, 1);
        }
        Ok(stats)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|r| r.created_at >= cutoff);
        Ok((before - executions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claw_core::{Behavior, ExecutionDetails, ExecutionResult, NewReflex, TriggerLayer, ValueLayer};

    fn reflex(owner: &str, name: &str) -> Reflex {
        Reflex::from_new(
            owner,
            NewReflex {
                name: name.into(),
                trigger_layer: TriggerLayer::Immediate,
                value_layer: ValueLayer::Infrastructure,
                behavior: Behavior::Execute,
                enabled: true,
                confidence: 1.0,
                config: serde_json::json!({}),
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_keeps_enablement() {
        let store = InMemoryStore::new();
        let r = reflex("a", "keepalive_heartbeat");
        store.upsert_builtin(&r).await.unwrap();
        assert!(store.set_enabled("a", "keepalive_heartbeat", false).await.unwrap());

        let again = store.upsert_builtin(&reflex("a", "keepalive_heartbeat")).await.unwrap();
        assert!(!again.enabled);
        assert_eq!(again.id, r.id);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryStore::new();
        store.insert_reflex(&reflex("a", "x")).await.unwrap();
        assert!(store.insert_reflex(&reflex("a", "x")).await.is_err());
        // Same name for a different owner is fine
        store.insert_reflex(&reflex("b", "x")).await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_sweep_is_idempotent() {
        let store = InMemoryStore::new();
        let r = reflex("a", "x");
        let mut old = ExecutionRecord::new(
            &r,
            "tick",
            serde_json::json!({}),
            ExecutionResult::Executed,
            ExecutionDetails::new("log", ""),
        );
        old.created_at = Utc::now() - chrono::Duration::days(40);
        store.insert_execution(&old).await.unwrap();
        let fresh = ExecutionRecord::new(
            &r,
            "tick",
            serde_json::json!({}),
            ExecutionResult::Executed,
            ExecutionDetails::new("log", ""),
        );
        store.insert_execution(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 0);
        assert_eq!(store.execution_count().await, 1);
    }
}
