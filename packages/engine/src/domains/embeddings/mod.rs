//! Embedding staleness reconciliation.
//!
//! An entity write produces a new content hash; the reconciler compares it
//! with the hash stored next to the entity's embedding and enqueues an
//! `embedding` job only when they diverge.

pub mod jobs;
pub mod models;
pub mod reconciler;
pub mod store;

pub use jobs::{
    embed_entity, register_embedding_handler, EmbeddingJob, EmbeddingJobResult, EMBEDDINGS_OWNER,
};
pub use models::{Entity, EntityEmbedding, Staleness};
pub use reconciler::{EmbeddingReconciler, ReconcileOutcome};
pub use store::{EmbeddingStore, InMemoryEmbeddingStore, PostgresEmbeddingStore};
