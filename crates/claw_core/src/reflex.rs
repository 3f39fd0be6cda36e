//! Reflex definitions: named, owner-scoped behavioral rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest accepted reflex name.
pub const MAX_NAME_LEN: usize = 64;

/// When a reflex's decision takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TriggerLayer {
    /// Synchronous and deterministic: applied inside the event handling call.
    Immediate,
    /// Deferred: batched for host review before taking effect.
    Supervised,
}

impl TriggerLayer {
    pub fn as_u8(self) -> u8 {
        match self {
            TriggerLayer::Immediate => 0,
            TriggerLayer::Supervised => 1,
        }
    }
}

impl From<TriggerLayer> for u8 {
    fn from(layer: TriggerLayer) -> Self {
        layer.as_u8()
    }
}

impl TryFrom<u8> for TriggerLayer {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TriggerLayer::Immediate),
            1 => Ok(TriggerLayer::Supervised),
            other => Err(format!("unknown trigger layer: {}", other)),
        }
    }
}

impl fmt::Display for TriggerLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Categorical tag. Classification only; the engine never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueLayer {
    Infrastructure,
    Emotional,
    Collaboration,
    Cognitive,
    Expression,
}

impl ValueLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueLayer::Infrastructure => "infrastructure",
            ValueLayer::Emotional => "emotional",
            ValueLayer::Collaboration => "collaboration",
            ValueLayer::Cognitive => "cognitive",
            ValueLayer::Expression => "expression",
        }
    }
}

impl FromStr for ValueLayer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infrastructure" => Ok(ValueLayer::Infrastructure),
            "emotional" => Ok(ValueLayer::Emotional),
            "collaboration" => Ok(ValueLayer::Collaboration),
            "cognitive" => Ok(ValueLayer::Cognitive),
            "expression" => Ok(ValueLayer::Expression),
            other => anyhow::bail!("unknown value layer: {}", other),
        }
    }
}

/// Declared intent of a reflex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Alert,
    Block,
    Execute,
    Recommend,
}

impl Behavior {
    pub fn as_str(self) -> &'static str {
        match self {
            Behavior::Alert => "alert",
            Behavior::Block => "block",
            Behavior::Execute => "execute",
            Behavior::Recommend => "recommend",
        }
    }
}

impl FromStr for Behavior {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert" => Ok(Behavior::Alert),
            "block" => Ok(Behavior::Block),
            "execute" => Ok(Behavior::Execute),
            "recommend" => Ok(Behavior::Recommend),
            other => anyhow::bail!("unknown behavior: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflex {
    pub id: String,
    pub owner_id: String,
    /// Slug, unique per owner and immutable once created.
    pub name: String,
    pub trigger_layer: TriggerLayer,
    pub value_layer: ValueLayer,
    pub behavior: Behavior,
    pub enabled: bool,
    /// In [0, 1]. Below the engine's binding threshold, decisions are only recommendations.
    pub confidence: f32,
    /// Per-reflex parameters. Builtins ignore it; custom reflexes read their rule from it.
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create a reflex except identity and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReflex {
    pub name: String,
    pub trigger_layer: TriggerLayer,
    pub value_layer: ValueLayer,
    pub behavior: Behavior,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

fn default_confidence() -> f32 {
    1.0
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Reflex {
    pub fn from_new(owner_id: &str, new: NewReflex) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: new.name,
            trigger_layer: new.trigger_layer,
            value_layer: new.value_layer,
            behavior: new.behavior,
            enabled: new.enabled,
            confidence: new.confidence,
            config: new.config,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Accepts `[a-z0-9_]`, 1 to [`MAX_NAME_LEN`] characters, starting with a letter.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Read filter for `list_reflexes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflexFilter {
    pub layer: Option<TriggerLayer>,
    #[serde(default)]
    pub enabled_only: bool,
}

impl ReflexFilter {
    pub fn enabled() -> Self {
        Self {
            layer: None,
            enabled_only: true,
        }
    }

    pub fn matches(&self, reflex: &Reflex) -> bool {
        if self.enabled_only && !reflex.enabled {
            return false;
        }
        self.layer.map_or(true, |layer| reflex.trigger_layer == layer)
    }
}
