use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored embedding and the hash of the content it was generated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEmbedding {
    pub entity_id: String,
    pub entity_type: String,
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// How an entity's current content relates to its stored embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// No embedding row exists
    Missing,
    /// The embedding was generated from different content
    Changed { stored_hash: String },
    Fresh,
}

impl Staleness {
    pub fn assess(stored_hash: Option<&str>, current_hash: &str) -> Self {
        match stored_hash {
            None => Staleness::Missing,
            Some(stored) if stored == current_hash => Staleness::Fresh,
            Some(stored) => Staleness::Changed {
                stored_hash: stored.to_string(),
            },
        }
    }

    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}
