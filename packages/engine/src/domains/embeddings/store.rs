//! Embedding storage.
//!
//! An embedding row is only ever written together with the hash of the exact
//! content that produced it, in one statement, so the stored hash never runs
//! ahead of the stored vector.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::PgPool;

use super::models::EntityEmbedding;
use crate::kernel::EMBEDDING_DIMENSIONS;

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// The entity's current content, or `None` if it does not exist.
    async fn entity_content(&self, entity_id: &str, entity_type: &str) -> Result<Option<String>>;

    /// Content hash of the stored embedding, if one exists.
    async fn embedding_hash(&self, entity_id: &str, entity_type: &str) -> Result<Option<String>>;

    async fn get_embedding(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Option<EntityEmbedding>>;

    /// Write `(embedding, content_hash)` for an entity.
    ///
    /// Returns `false` without writing if the entity no longer exists.
    async fn store_embedding(
        &self,
        entity_id: &str,
        entity_type: &str,
        embedding: &[f32],
        content_hash: &str,
    ) -> Result<bool>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

pub struct PostgresEmbeddingStore {
    pool: PgPool,
}

impl PostgresEmbeddingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingStore for PostgresEmbeddingStore {
    async fn entity_content(&self, entity_id: &str, entity_type: &str) -> Result<Option<String>> {
        let content = sqlx::query_scalar::<_, String>(
            "SELECT content FROM entities WHERE id = $1 AND entity_type = $2",
        )
        .bind(entity_id)
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read entity content")?;

        Ok(content)
    }

    async fn embedding_hash(&self, entity_id: &str, entity_type: &str) -> Result<Option<String>> {
        let hash = sqlx::query_scalar::<_, String>(
            "SELECT content_hash FROM entity_embeddings WHERE entity_id = $1 AND entity_type = $2",
        )
        .bind(entity_id)
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read embedding hash")?;

        Ok(hash)
    }

    async fn get_embedding(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Option<EntityEmbedding>> {
        let row = sqlx::query_as::<_, (String, String, Vector, String, DateTime<Utc>)>(
            r#"
            SELECT entity_id, entity_type, embedding, content_hash, updated_at
            FROM entity_embeddings
            WHERE entity_id = $1 AND entity_type = $2
            "#,
        )
        .bind(entity_id)
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read embedding")?;

        Ok(row.map(
            |(entity_id, entity_type, embedding, content_hash, updated_at)| EntityEmbedding {
                entity_id,
                entity_type,
                embedding: embedding.to_vec(),
                content_hash,
                updated_at,
            },
        ))
    }

    async fn store_embedding(
        &self,
        entity_id: &str,
        entity_type: &str,
        embedding: &[f32],
        content_hash: &str,
    ) -> Result<bool> {
        anyhow::ensure!(
            embedding.len() == EMBEDDING_DIMENSIONS,
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            EMBEDDING_DIMENSIONS
        );

        let vector = Vector::from(embedding.to_vec());
        let written = sqlx::query(
            r#"
            INSERT INTO entity_embeddings (entity_id, entity_type, embedding, content_hash, updated_at)
            SELECT $1, $2, $3, $4, NOW()
            WHERE EXISTS (SELECT 1 FROM entities WHERE id = $1 AND entity_type = $2)
            ON CONFLICT (entity_id, entity_type) DO UPDATE
            SET embedding = EXCLUDED.embedding,
                content_hash = EXCLUDED.content_hash,
                updated_at = NOW()
            "#,
        )
        .bind(entity_id)
        .bind(entity_type)
        .bind(vector)
        .bind(content_hash)
        .execute(&self.pool)
        .await
        .context("failed to store embedding")?;

        Ok(written.rows_affected() == 1)
    }
}

// =============================================================================
// In-memory
// =============================================================================

type EntityKey = (String, String);

#[derive(Default)]
struct Tables {
    // Current content per entity
    entities: HashMap<EntityKey, String>,
    embeddings: HashMap<EntityKey, EntityEmbedding>,
}

/// Embedding store over in-process maps, with the same entity-existence rule
/// as the Postgres one.
#[derive(Default)]
pub struct InMemoryEmbeddingStore {
    tables: Mutex<Tables>,
}

impl InMemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or edit an entity. Embeddings can only be stored for known
    /// entities.
    pub fn add_entity(&self, entity_id: &str, entity_type: &str, content: &str) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .entities
            .insert(key(entity_id, entity_type), content.to_string());
    }

    /// Forget an entity and drop its embedding.
    pub fn remove_entity(&self, entity_id: &str, entity_type: &str) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let key = key(entity_id, entity_type);
        tables.entities.remove(&key);
        tables.embeddings.remove(&key);
    }

    pub fn embedding_count(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .embeddings
            .len()
    }
}

fn key(entity_id: &str, entity_type: &str) -> EntityKey {
    (entity_id.to_string(), entity_type.to_string())
}

#[async_trait]
impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn entity_content(&self, entity_id: &str, entity_type: &str) -> Result<Option<String>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.entities.get(&key(entity_id, entity_type)).cloned())
    }

    async fn embedding_hash(&self, entity_id: &str, entity_type: &str) -> Result<Option<String>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .embeddings
            .get(&key(entity_id, entity_type))
            .map(|e| e.content_hash.clone()))
    }

    async fn get_embedding(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Option<EntityEmbedding>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.embeddings.get(&key(entity_id, entity_type)).cloned())
    }

    async fn store_embedding(
        &self,
        entity_id: &str,
        entity_type: &str,
        embedding: &[f32],
        content_hash: &str,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let key = key(entity_id, entity_type);
        if !tables.entities.contains_key(&key) {
            return Ok(false);
        }

        tables.embeddings.insert(
            key,
            EntityEmbedding {
                entity_id: entity_id.to_string(),
                entity_type: entity_type.to_string(),
                embedding: embedding.to_vec(),
                content_hash: content_hash.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(true)
    }
}
