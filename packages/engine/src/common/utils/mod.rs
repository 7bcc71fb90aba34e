pub mod content_hash;
pub mod embeddings;

pub use content_hash::*;
pub use embeddings::*;
