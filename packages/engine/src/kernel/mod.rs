//! Kernel module - job engine infrastructure and dependencies.

pub mod jobs;
pub mod test_dependencies;
pub mod traits;

pub use test_dependencies::{MockEmbeddingService, TestDependencies};
pub use traits::*;

/// Dimensions of the vectors stored in `entity_embeddings`.
pub const EMBEDDING_DIMENSIONS: usize = 1536;
