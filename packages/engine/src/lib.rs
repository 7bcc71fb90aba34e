// Knowledge Base Job Engine - Core
//
// Durable background job processing for the knowledge base: a Postgres-backed
// job table with atomic claims, a runtime-extensible handler registry, retry
// with capped exponential backoff, and the embedding staleness reconciler that
// turns entity writes into embedding jobs.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
