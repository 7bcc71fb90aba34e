// Common utilities shared across the engine

pub mod utils;
