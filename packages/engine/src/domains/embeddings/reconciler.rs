use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use super::jobs::EmbeddingJob;
use super::models::Staleness;
use super::store::EmbeddingStore;
use crate::common::utils::content_hash;
use crate::kernel::jobs::{EnqueueResult, JobPayload, JobQueue};

/// Result of reconciling one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The stored embedding matches the current content
    UpToDate,
    /// A new embedding job was enqueued
    Enqueued(Uuid),
    /// An embedding job for this entity is already pending or processing
    AlreadyQueued(Uuid),
}

/// Turns entity writes into embedding jobs, only when the content changed.
#[derive(Clone)]
pub struct EmbeddingReconciler {
    queue: JobQueue,
    store: Arc<dyn EmbeddingStore>,
}

impl EmbeddingReconciler {
    pub fn new(queue: JobQueue, store: Arc<dyn EmbeddingStore>) -> Self {
        Self { queue, store }
    }

    /// Compare the content against the stored embedding's hash.
    pub async fn check_staleness(
        &self,
        entity_id: &str,
        entity_type: &str,
        content: &str,
    ) -> Result<Staleness> {
        let stored = self.store.embedding_hash(entity_id, entity_type).await?;
        Ok(Staleness::assess(stored.as_deref(), &content_hash(content)))
    }

    /// Enqueue an embedding job if the entity's embedding is missing or stale.
    ///
    /// Idempotent: while a job for the entity is pending or processing, no
    /// second one is created. That job embeds the entity's content as of
    /// when it runs, so edits made meanwhile are not lost.
    pub async fn reconcile(
        &self,
        entity_id: &str,
        entity_type: &str,
        content: &str,
    ) -> Result<ReconcileOutcome> {
        let staleness = self.check_staleness(entity_id, entity_type, content).await?;
        if !staleness.is_stale() {
            return Ok(ReconcileOutcome::UpToDate);
        }

        debug!(entity_id = %entity_id, entity_type = %entity_type, ?staleness, "embedding stale");

        let job = EmbeddingJob {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            content: content.to_string(),
        };

        Ok(match self.queue.enqueue(&job).await? {
            EnqueueResult::Created(job_id) => ReconcileOutcome::Enqueued(job_id),
            EnqueueResult::Duplicate(job_id) => ReconcileOutcome::AlreadyQueued(job_id),
        })
    }

    /// Entity types with an embedding job pending or processing, sorted.
    pub async fn queued_entity_types(&self) -> Result<Vec<String>> {
        let types: BTreeSet<String> = self
            .queue
            .store()
            .active_jobs()
            .await?
            .into_iter()
            .filter(|job| job.job_type == EmbeddingJob::JOB_TYPE)
            .filter_map(|job| serde_json::from_value::<EmbeddingJob>(job.data).ok())
            .map(|job| job.entity_type)
            .collect();

        Ok(types.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::embeddings::store::InMemoryEmbeddingStore;
    use crate::kernel::jobs::{InMemoryJobStore, JobEvents, JobStore};

    fn reconciler() -> (EmbeddingReconciler, Arc<InMemoryJobStore>, Arc<InMemoryEmbeddingStore>) {
        let jobs = Arc::new(InMemoryJobStore::default());
        let embeddings = Arc::new(InMemoryEmbeddingStore::new());
        let queue = JobQueue::new(jobs.clone(), JobEvents::new());
        (
            EmbeddingReconciler::new(queue, embeddings.clone()),
            jobs,
            embeddings,
        )
    }

    #[tokio::test]
    async fn missing_embedding_enqueues_job() {
        let (reconciler, jobs, _) = reconciler();

        let outcome = reconciler.reconcile("1", "post", "hello").await.unwrap();

        let ReconcileOutcome::Enqueued(job_id) = outcome else {
            panic!("expected enqueue, got {:?}", outcome);
        };
        let job = jobs.get_status(job_id).await.unwrap().unwrap();
        assert_eq!(job.job_type, "embedding");
        assert_eq!(
            job.data,
            serde_json::json!({"entityId": "1", "entityType": "post", "content": "hello"})
        );
    }

    #[tokio::test]
    async fn fresh_embedding_is_up_to_date() {
        let (reconciler, jobs, embeddings) = reconciler();
        embeddings.add_entity("1", "post", "hello");
        embeddings
            .store_embedding("1", "post", &[0.1], &content_hash("hello"))
            .await
            .unwrap();

        let outcome = reconciler.reconcile("1", "post", "hello").await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::UpToDate);
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn edits_while_queued_fold_into_the_queued_job() {
        let (reconciler, jobs, _) = reconciler();

        let first = reconciler.reconcile("1", "post", "v1").await.unwrap();
        let second = reconciler.reconcile("1", "post", "v2").await.unwrap();

        let ReconcileOutcome::Enqueued(job_id) = first else {
            panic!("expected enqueue, got {:?}", first);
        };
        assert_eq!(second, ReconcileOutcome::AlreadyQueued(job_id));
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn entity_ids_with_separators_do_not_share_jobs() {
        let (reconciler, jobs, _) = reconciler();

        let first = reconciler.reconcile("c", "a:b", "x").await.unwrap();
        let second = reconciler.reconcile("b:c", "a", "x").await.unwrap();

        assert!(matches!(first, ReconcileOutcome::Enqueued(_)));
        assert!(matches!(second, ReconcileOutcome::Enqueued(_)));
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn queued_entity_types_are_distinct() {
        let (reconciler, _, _) = reconciler();
        reconciler.reconcile("1", "post", "a").await.unwrap();
        reconciler.reconcile("2", "post", "b").await.unwrap();
        reconciler.reconcile("3", "note", "c").await.unwrap();

        assert_eq!(
            reconciler.queued_entity_types().await.unwrap(),
            vec!["note".to_string(), "post".to_string()]
        );
    }
}
