//! Reconciler → dispatcher → embedding handler, over in-memory storage.

use std::sync::Arc;

use engine_core::common::utils::content_hash;
use engine_core::domains::embeddings::{
    register_embedding_handler, EmbeddingReconciler, EmbeddingStore, InMemoryEmbeddingStore,
    ReconcileOutcome, Staleness,
};
use engine_core::kernel::jobs::{JobStatus, JobStore};
use engine_core::kernel::{MockEmbeddingService, TestDependencies};

struct Fixture {
    deps: TestDependencies,
    embeddings: Arc<InMemoryEmbeddingStore>,
    reconciler: EmbeddingReconciler,
}

fn fixture(service: MockEmbeddingService) -> Fixture {
    let deps = TestDependencies::new().mock_embeddings(service);
    let embeddings = Arc::new(InMemoryEmbeddingStore::new());
    register_embedding_handler(
        &deps.registry,
        deps.embedding_service.clone(),
        embeddings.clone(),
    );
    let reconciler = EmbeddingReconciler::new(deps.queue(), embeddings.clone());
    Fixture {
        deps,
        embeddings,
        reconciler,
    }
}

#[tokio::test]
async fn stale_entity_is_embedded_then_up_to_date() {
    let f = fixture(MockEmbeddingService::new());
    f.embeddings.add_entity("7", "post", "first draft");

    let outcome = f.reconciler.reconcile("7", "post", "first draft").await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Enqueued(_)));

    assert_eq!(f.deps.dispatcher().drain().await.unwrap(), 1);

    let stored = f.embeddings.get_embedding("7", "post").await.unwrap().unwrap();
    assert_eq!(stored.content_hash, content_hash("first draft"));
    assert_eq!(
        f.reconciler.reconcile("7", "post", "first draft").await.unwrap(),
        ReconcileOutcome::UpToDate
    );
    assert_eq!(f.deps.embedding_service.call_count(), 1);
}

#[tokio::test]
async fn edit_after_embedding_makes_it_stale_again() {
    let f = fixture(MockEmbeddingService::new());
    f.embeddings.add_entity("7", "post", "v1");
    f.reconciler.reconcile("7", "post", "v1").await.unwrap();
    f.deps.dispatcher().drain().await.unwrap();

    let staleness = f.reconciler.check_staleness("7", "post", "v2").await.unwrap();
    assert_eq!(
        staleness,
        Staleness::Changed {
            stored_hash: content_hash("v1")
        }
    );

    let outcome = f.reconciler.reconcile("7", "post", "v2").await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Enqueued(_)));
}

#[tokio::test]
async fn reconciling_twice_before_dispatch_enqueues_once() {
    let f = fixture(MockEmbeddingService::new());
    f.embeddings.add_entity("7", "post", "text");

    let first = f.reconciler.reconcile("7", "post", "text").await.unwrap();
    let second = f.reconciler.reconcile("7", "post", "text").await.unwrap();

    let ReconcileOutcome::Enqueued(job_id) = first else {
        panic!("expected enqueue, got {:?}", first);
    };
    assert_eq!(second, ReconcileOutcome::AlreadyQueued(job_id));
    assert_eq!(f.deps.store.active_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn edit_while_queued_is_embedded() {
    let f = fixture(MockEmbeddingService::new());
    f.embeddings.add_entity("7", "post", "v1");
    let first = f.reconciler.reconcile("7", "post", "v1").await.unwrap();
    assert!(matches!(first, ReconcileOutcome::Enqueued(_)));

    f.embeddings.add_entity("7", "post", "v2");
    let second = f.reconciler.reconcile("7", "post", "v2").await.unwrap();
    assert!(matches!(second, ReconcileOutcome::AlreadyQueued(_)));

    f.deps.dispatcher().drain().await.unwrap();

    assert_eq!(
        f.reconciler.check_staleness("7", "post", "v2").await.unwrap(),
        Staleness::Fresh
    );
    assert_eq!(f.deps.embedding_service.calls(), vec!["v2"]);
}

#[tokio::test]
async fn ids_containing_separators_get_their_own_jobs() {
    let f = fixture(MockEmbeddingService::new());

    let first = f.reconciler.reconcile("c", "a:b", "text").await.unwrap();
    let second = f.reconciler.reconcile("b:c", "a", "text").await.unwrap();

    assert!(matches!(first, ReconcileOutcome::Enqueued(_)));
    assert!(matches!(second, ReconcileOutcome::Enqueued(_)));
    assert_eq!(f.deps.store.active_jobs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn provider_outage_is_retried() {
    let f = fixture(MockEmbeddingService::new().failing(2));
    f.embeddings.add_entity("7", "post", "text");

    let ReconcileOutcome::Enqueued(job_id) =
        f.reconciler.reconcile("7", "post", "text").await.unwrap()
    else {
        panic!("expected enqueue");
    };

    f.deps.dispatcher().drain().await.unwrap();

    let job = f.deps.store.get_status(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert!(f.embeddings.get_embedding("7", "post").await.unwrap().is_some());
}

#[tokio::test]
async fn deleted_entity_completes_without_storing() {
    let f = fixture(MockEmbeddingService::new());

    let ReconcileOutcome::Enqueued(job_id) =
        f.reconciler.reconcile("gone", "post", "text").await.unwrap()
    else {
        panic!("expected enqueue");
    };

    f.deps.dispatcher().drain().await.unwrap();

    let job = f.deps.store.get_status(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["stored"], false);
    assert_eq!(f.embeddings.embedding_count(), 0);
}

#[tokio::test]
async fn empty_content_fails_without_retry() {
    let f = fixture(MockEmbeddingService::new());
    f.embeddings.add_entity("7", "post", "");

    let ReconcileOutcome::Enqueued(job_id) = f.reconciler.reconcile("7", "post", "").await.unwrap()
    else {
        panic!("expected enqueue");
    };

    f.deps.dispatcher().drain().await.unwrap();

    let job = f.deps.store.get_status(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(f.deps.embedding_service.call_count(), 0);
}
