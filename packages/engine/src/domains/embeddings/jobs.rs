//! The `embedding` job: generate a vector for an entity's current content and
//! store it with the hash of that content.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::store::EmbeddingStore;
use crate::common::utils::content_hash;
use crate::kernel::jobs::{JobError, JobPayload, JobRegistry, ProgressReporter};
use crate::kernel::BaseEmbeddingService;

/// Registry owner for every handler this domain installs.
pub const EMBEDDINGS_OWNER: &str = "embeddings";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJob {
    pub entity_id: String,
    pub entity_type: String,
    /// Content when the job was enqueued. The handler embeds whatever the
    /// entity holds when it runs.
    pub content: String,
}

impl EmbeddingJob {
    /// Active-job dedupe key: one embedding job per entity at a time.
    ///
    /// Encoded as a JSON array so no pair of ids can collide, whatever
    /// characters they contain.
    pub fn dedupe_key_for(entity_type: &str, entity_id: &str) -> String {
        serde_json::json!([entity_type, entity_id]).to_string()
    }
}

impl JobPayload for EmbeddingJob {
    const JOB_TYPE: &'static str = "embedding";

    fn dedupe_key(&self) -> Option<String> {
        Some(Self::dedupe_key_for(&self.entity_type, &self.entity_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJobResult {
    pub entity_id: String,
    pub entity_type: String,
    pub content_hash: String,
    pub dimensions: usize,
    /// `false` when the entity was deleted before the job ran
    pub stored: bool,
}

/// Install the `embedding` handler.
pub fn register_embedding_handler(
    registry: &JobRegistry,
    embedder: Arc<dyn BaseEmbeddingService>,
    store: Arc<dyn EmbeddingStore>,
) {
    registry.register_job(
        EMBEDDINGS_OWNER,
        move |job: EmbeddingJob, job_id: Uuid, progress: ProgressReporter| {
            let embedder = embedder.clone();
            let store = store.clone();
            async move { embed_entity(job, job_id, progress, embedder.as_ref(), store.as_ref()).await }
        },
    );
}

/// Generate and store the embedding for one job.
///
/// The entity's content is read when the job runs, not taken from the
/// payload: jobs are deduplicated per entity, so edits made while a job is
/// queued are folded into it. If the content changes again while the
/// provider call is in flight, the job fails retryably and the retry embeds
/// the newer content.
pub async fn embed_entity(
    job: EmbeddingJob,
    job_id: Uuid,
    progress: ProgressReporter,
    embedder: &dyn BaseEmbeddingService,
    store: &dyn EmbeddingStore,
) -> Result<EmbeddingJobResult> {
    if job.entity_id.is_empty() || job.entity_type.is_empty() {
        return Err(JobError::invalid_payload(
            EmbeddingJob::JOB_TYPE,
            "entityId and entityType are required",
        )
        .into());
    }

    progress.step(1.0, 4.0, "loading entity");
    let Some(content) = store.entity_content(&job.entity_id, &job.entity_type).await? else {
        debug!(
            job_id = %job_id,
            entity_id = %job.entity_id,
            entity_type = %job.entity_type,
            "entity deleted before embedding; skipped"
        );
        progress.step(4.0, 4.0, "done");
        return Ok(EmbeddingJobResult {
            entity_id: job.entity_id,
            entity_type: job.entity_type,
            content_hash: content_hash(&job.content),
            dimensions: 0,
            stored: false,
        });
    };
    if content.trim().is_empty() {
        return Err(JobError::invalid_payload(EmbeddingJob::JOB_TYPE, "content is empty").into());
    }

    let hash = content_hash(&content);

    progress.step(2.0, 4.0, "generating embedding");
    let embedding = embedder
        .generate(&content)
        .await
        .with_context(|| format!("embedding provider failed for {}:{}", job.entity_type, job.entity_id))?;

    progress.step(3.0, 4.0, "storing embedding");
    let stored = store
        .store_embedding(&job.entity_id, &job.entity_type, &embedding, &hash)
        .await?;

    if stored {
        let current = store.entity_content(&job.entity_id, &job.entity_type).await?;
        if current.is_some_and(|current| content_hash(&current) != hash) {
            return Err(anyhow!(
                "content of {}:{} changed while embedding",
                job.entity_type,
                job.entity_id
            ));
        }
        info!(
            job_id = %job_id,
            entity_id = %job.entity_id,
            entity_type = %job.entity_type,
            "embedding stored"
        );
    } else {
        debug!(
            job_id = %job_id,
            entity_id = %job.entity_id,
            entity_type = %job.entity_type,
            "entity deleted while embedding; skipped"
        );
    }

    progress.step(4.0, 4.0, "done");
    Ok(EmbeddingJobResult {
        entity_id: job.entity_id,
        entity_type: job.entity_type,
        content_hash: hash,
        dimensions: embedding.len(),
        stored,
    })
}
