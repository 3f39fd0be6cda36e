use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClawConfig {
    pub reflex: ReflexConfig,
    pub batch: BatchConfig,
    pub retention: RetentionConfig,
    pub runtime: RuntimeConfig,
}

impl ClawConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: ClawConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({:#}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CLAW_DB_PATH") {
            self.runtime.db_path = v;
        }
        if let Ok(v) = std::env::var("CLAW_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.batch.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("CLAW_BATCH_MAX_WAIT_MS") {
            if let Ok(n) = v.parse() {
                self.batch.max_wait_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CLAW_MIN_BINDING_CONFIDENCE") {
            if let Ok(n) = v.parse() {
                self.reflex.min_binding_confidence = n;
            }
        }
        if let Ok(v) = std::env::var("CLAW_RETENTION_DAYS") {
            if let Ok(n) = v.parse() {
                self.retention.max_age_days = n;
            }
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReflexConfig {
    /// Reflexes with confidence below this only ever recommend.
    pub min_binding_confidence: f32,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            min_binding_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Undelivered entries that trigger an immediate flush.
    pub batch_size: usize,
    /// Longest an entry waits before a timed flush.
    pub max_wait_ms: u64,
    /// Cap on one owner's queue (undelivered plus unacknowledged).
    pub max_queue_size: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_wait_ms: 600_000,
            max_queue_size: 1000,
            overflow_policy: OverflowPolicy::RejectNew,
        }
    }
}

impl BatchConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// What happens when an owner's layer-1 queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new entry; the engine audits it as a plain recommendation.
    #[default]
    RejectNew,
    /// Evict the oldest undelivered entry to make room.
    DropOldest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_days: u32,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub db_path: String,
    pub tick_interval_secs: u64,
    pub event_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: "clawnet.db".to_string(),
            tick_interval_secs: 60,
            event_channel_capacity: 256,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ClawConfig::default();
        assert_eq!(cfg.batch.batch_size, 10);
        assert_eq!(cfg.batch.max_wait_ms, 600_000);
        assert_eq!(cfg.batch.overflow_policy, OverflowPolicy::RejectNew);
        assert!((cfg.reflex.min_binding_confidence - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.retention.max_age_days, 30);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[batch]
batch_size = 3
"#;
        let cfg: ClawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.batch.batch_size, 3);
        // Defaults for unspecified fields
        assert_eq!(cfg.batch.max_wait_ms, 600_000);
        assert_eq!(cfg.runtime.db_path, "clawnet.db");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[reflex]
min_binding_confidence = 0.8

[batch]
batch_size = 25
max_wait_ms = 5000
max_queue_size = 50
overflow_policy = "drop_oldest"

[retention]
max_age_days = 7
sweep_interval_secs = 60

[runtime]
db_path = "data/claws.db"
tick_interval_secs = 15
event_channel_capacity = 32
"#;
        let cfg: ClawConfig = toml::from_str(toml_str).unwrap();
        assert!((cfg.reflex.min_binding_confidence - 0.8).abs() < f32::EPSILON);
        assert_eq!(cfg.batch.max_wait(), Duration::from_secs(5));
        assert_eq!(cfg.batch.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(cfg.retention.max_age_days, 7);
        assert_eq!(cfg.runtime.tick_interval_secs, 15);
        assert_eq!(cfg.runtime.event_channel_capacity, 32);
    }

    #[test]
    fn test_env_overrides_and_defaults() {
        std::env::set_var("CLAW_BATCH_SIZE", "4");
        std::env::set_var("CLAW_MIN_BINDING_CONFIDENCE", "not-a-number");

        let mut cfg = ClawConfig::default();
        cfg.apply_env_overrides();

        assert_eq!(cfg.batch.batch_size, 4);
        // Unparseable values leave the default in place
        assert!((cfg.reflex.min_binding_confidence - 0.5).abs() < f32::EPSILON);

        std::env::remove_var("CLAW_BATCH_SIZE");
        std::env::remove_var("CLAW_MIN_BINDING_CONFIDENCE");

        let cfg = ClawConfig::load_or_default("/nonexistent/path.toml");
        assert_eq!(cfg.batch.batch_size, 10);
    }
}
