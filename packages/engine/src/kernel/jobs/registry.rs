//! Job registry for deserializing and executing jobs.
//!
//! The registry maps job type strings (e.g., "embedding") to handlers. Each
//! handler is registered with its own payload type; the registry deserializes
//! the stored JSON into that type before calling it, so a payload that does
//! not match the handler's schema fails as [`JobError::InvalidPayload`].
//!
//! Registration happens at runtime: independent modules add their own job
//! types without a shared enum, and can tear them down as a group by owner.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::JobError;
use super::events::ProgressReporter;
use super::queue::JobPayload;

/// Future returned by a type-erased handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;

type BoxedHandler =
    Arc<dyn Fn(serde_json::Value, Uuid, ProgressReporter) -> HandlerFuture + Send + Sync>;

/// A registered handler, cheap to clone out of the registry.
#[derive(Clone)]
pub struct JobHandler {
    job_type: String,
    owner: String,
    handler: BoxedHandler,
}

impl JobHandler {
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run the handler against a stored payload.
    pub fn invoke(
        &self,
        data: serde_json::Value,
        job_id: Uuid,
        progress: ProgressReporter,
    ) -> HandlerFuture {
        (self.handler)(data, job_id, progress)
    }
}

impl std::fmt::Debug for JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandler")
            .field("job_type", &self.job_type)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Registry that maps job type strings to handlers.
///
/// # Example
///
/// ```ignore
/// let registry = JobRegistry::new();
///
/// registry.register::<EmbeddingJob, _, _, _>(
///     "embedding",
///     "embeddings",
///     |job, job_id, progress| async move {
///         embed(job, job_id, progress).await
///     },
/// );
///
/// // Later, when the plugin unloads
/// registry.unregister_all("embeddings");
/// ```
#[derive(Default)]
pub struct JobRegistry {
    registrations: RwLock<HashMap<String, JobHandler>>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type with its handler.
    ///
    /// Registering a type that already has a handler replaces it (last
    /// registration wins) and logs a warning.
    ///
    /// # Arguments
    ///
    /// * `job_type` - The job type string (e.g., "embedding")
    /// * `owner` - The module that owns this handler, for [`Self::unregister_all`]
    /// * `handler` - Async function receiving the typed payload, job id and progress sink
    pub fn register<P, R, F, Fut>(
        &self,
        job_type: impl Into<String>,
        owner: impl Into<String>,
        handler: F,
    ) where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, Uuid, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let job_type = job_type.into();
        let owner = owner.into();
        let handler = Arc::new(handler);
        let type_name = job_type.clone();

        let boxed: BoxedHandler = Arc::new(move |value, job_id, progress| {
            let handler = handler.clone();
            let type_name = type_name.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value)
                    .map_err(|e| JobError::invalid_payload(type_name.as_str(), e))?;
                let output = handler(payload, job_id, progress).await?;
                Ok(serde_json::to_value(output)?)
            })
        });

        let entry = JobHandler {
            job_type: job_type.clone(),
            owner: owner.clone(),
            handler: boxed,
        };

        let mut registrations = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        match registrations.insert(job_type.clone(), entry) {
            Some(previous) => warn!(
                job_type = %job_type,
                previous_owner = %previous.owner,
                owner = %owner,
                "job handler replaced; last registration wins"
            ),
            None => debug!(job_type = %job_type, owner = %owner, "job handler registered"),
        }
    }

    /// Register a handler under the payload's own [`JobPayload::JOB_TYPE`].
    pub fn register_job<P, R, F, Fut>(&self, owner: impl Into<String>, handler: F)
    where
        P: JobPayload,
        R: Serialize + Send + 'static,
        F: Fn(P, Uuid, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register::<P, R, F, Fut>(P::JOB_TYPE, owner, handler);
    }

    /// Remove the handler for a type. Returns whether one was registered.
    pub fn unregister(&self, job_type: &str) -> bool {
        self.registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_type)
            .is_some()
    }

    /// Remove every handler registered by `owner`. Returns how many were removed.
    pub fn unregister_all(&self, owner: &str) -> usize {
        let mut registrations = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        let before = registrations.len();
        registrations.retain(|_, handler| handler.owner != owner);
        let removed = before - registrations.len();
        if removed > 0 {
            debug!(owner = %owner, removed, "job handlers unregistered");
        }
        removed
    }

    pub fn get(&self, job_type: &str) -> Option<JobHandler> {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_type)
            .cloned()
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_type)
    }

    /// Get all registered job types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
