use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::common::utils::content_hash;

/// A piece of source content that gets embedded.
///
/// `content_hash` always matches `content`; it is recomputed on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    pub content: String,
    pub content_hash: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Insert or replace an entity's content.
    pub async fn upsert(
        id: &str,
        entity_type: &str,
        content: &str,
        metadata: serde_json::Value,
        pool: &PgPool,
    ) -> Result<Self> {
        let entity = sqlx::query_as::<_, Entity>(
            r#"
            INSERT INTO entities (id, entity_type, content, content_hash, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id, entity_type) DO UPDATE
            SET content = EXCLUDED.content,
                content_hash = EXCLUDED.content_hash,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(entity_type)
        .bind(content)
        .bind(content_hash(content))
        .bind(metadata)
        .fetch_one(pool)
        .await?;

        Ok(entity)
    }

    pub async fn find(id: &str, entity_type: &str, pool: &PgPool) -> Result<Option<Self>> {
        let entity = sqlx::query_as::<_, Entity>(
            "SELECT * FROM entities WHERE id = $1 AND entity_type = $2",
        )
        .bind(id)
        .bind(entity_type)
        .fetch_optional(pool)
        .await?;

        Ok(entity)
    }

    /// All entities, optionally of one type, in a stable order.
    pub async fn find_all(entity_type: Option<&str>, pool: &PgPool) -> Result<Vec<Self>> {
        let entities = sqlx::query_as::<_, Entity>(
            r#"
            SELECT * FROM entities
            WHERE ($1::text IS NULL OR entity_type = $1)
            ORDER BY entity_type, id
            "#,
        )
        .bind(entity_type)
        .fetch_all(pool)
        .await?;

        Ok(entities)
    }

    /// Delete an entity. Its embedding goes with it.
    pub async fn delete(id: &str, entity_type: &str, pool: &PgPool) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM entities WHERE id = $1 AND entity_type = $2")
            .bind(id)
            .bind(entity_type)
            .execute(pool)
            .await?;

        Ok(deleted.rows_affected() == 1)
    }
}
