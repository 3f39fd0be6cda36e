use thiserror::Error;

pub type ReflexResult<T> = Result<T, ReflexError>;

#[derive(Debug, Error)]
pub enum ReflexError {
    #[error("reflex '{name}' not found for owner '{owner_id}'")]
    NotFound { owner_id: String, name: String },

    #[error("reflex '{name}' cannot be disabled")]
    Forbidden { name: String },

    #[error("reflex '{name}' already exists for owner '{owner_id}'")]
    AlreadyExists { owner_id: String, name: String },

    #[error("invalid reflex name: '{0}'")]
    InvalidName(String),

    #[error("confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f32),

    #[error("custom event type '{0}' is reserved")]
    ReservedEventType(String),

    #[error("layer-1 queue for owner '{owner_id}' is full ({capacity} entries)")]
    QueueFull { owner_id: String, capacity: usize },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ReflexError {
    pub fn not_found(owner_id: &str, name: &str) -> Self {
        ReflexError::NotFound {
            owner_id: owner_id.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReflexError::NotFound { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ReflexError::Forbidden { .. })
    }
}
