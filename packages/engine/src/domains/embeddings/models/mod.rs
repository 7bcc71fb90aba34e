pub mod entity;
pub mod entity_embedding;

pub use entity::Entity;
pub use entity_embedding::{EntityEmbedding, Staleness};
