//! Typed enqueue facade over a [`JobStore`].
//!
//! Producers describe a job with a [`JobPayload`] and hand it to the
//! [`JobQueue`]; the queue serializes it, fills in the payload's scheduling
//! metadata, persists it, and announces it on the event hub.

use std::sync::Arc;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::JobError;
use super::events::{JobEvent, JobEvents};
use super::job::{EnqueueOptions, EnqueueResult, Job, NewJob};
use super::registry::JobRegistry;
use super::store::JobStore;

/// Metadata for job payloads.
///
/// Payloads implement this trait to provide their type name and optional
/// scheduling hints.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The job type name (used as `job_type`).
    const JOB_TYPE: &'static str;

    /// Optional priority override. Higher is served first.
    fn priority(&self) -> i32 {
        0
    }

    /// Maximum retries for this payload. `None` uses the queue default.
    fn max_retries(&self) -> Option<i32> {
        None
    }

    /// Optional deduplication key.
    ///
    /// If provided, ensures only one pending/processing job exists with this key.
    fn dedupe_key(&self) -> Option<String> {
        None
    }
}

/// Enqueue side of the engine.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    events: JobEvents,
    registry: Option<Arc<JobRegistry>>,
    default_max_retries: Option<i32>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, events: JobEvents) -> Self {
        Self {
            store,
            events,
            registry: None,
            default_max_retries: None,
        }
    }

    /// Refuse job types with no handler registered in `registry`.
    ///
    /// Without this, unknown types are persisted and fail terminally when a
    /// dispatcher claims them.
    pub fn strict(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Retry budget applied when neither the options nor the payload set one.
    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = Some(max_retries);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn events(&self) -> &JobEvents {
        &self.events
    }

    /// Enqueue a typed payload using its own scheduling metadata.
    pub async fn enqueue<J: JobPayload>(&self, job: &J) -> Result<EnqueueResult> {
        let options = EnqueueOptions {
            priority: job.priority(),
            max_retries: job.max_retries(),
            delay_ms: 0,
            dedupe_key: job.dedupe_key(),
            batch_id: None,
        };
        self.enqueue_with::<J>(job, options).await
    }

    /// Enqueue a typed payload with explicit options.
    ///
    /// Fields the caller leaves unset fall back to the payload's metadata.
    pub async fn enqueue_with<J: JobPayload>(
        &self,
        job: &J,
        mut options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        if options.max_retries.is_none() {
            options.max_retries = job.max_retries();
        }
        if options.dedupe_key.is_none() && options.batch_id.is_none() {
            options.dedupe_key = job.dedupe_key();
        }
        let data = serde_json::to_value(job)?;
        self.enqueue_raw(J::JOB_TYPE, data, options).await
    }

    /// Enqueue an untyped payload.
    pub async fn enqueue_raw(
        &self,
        job_type: &str,
        data: serde_json::Value,
        mut options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        if let Some(registry) = &self.registry {
            if !registry.is_registered(job_type) {
                return Err(JobError::UnknownJobType(job_type.to_string()).into());
            }
        }

        if options.max_retries.is_none() {
            options.max_retries = self.default_max_retries;
        }

        let result = self.store.enqueue(job_type, data, options).await?;

        match &result {
            EnqueueResult::Created(job_id) => {
                info!(job_id = %job_id, job_type = %job_type, "job enqueued");
                self.events.publish(JobEvent::Enqueued {
                    job_id: *job_id,
                    job_type: job_type.to_string(),
                });
            }
            EnqueueResult::Duplicate(job_id) => {
                debug!(job_id = %job_id, job_type = %job_type, "active job already holds dedupe key");
            }
        }

        Ok(result)
    }

    /// Enqueue several untyped jobs together: either every job is persisted
    /// or none is.
    ///
    /// A strict queue checks every type before anything is written. Dedupe
    /// keys are not honored here; each entry becomes its own job.
    pub async fn enqueue_many(&self, mut jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        if let Some(registry) = &self.registry {
            if let Some(unknown) = jobs.iter().find(|job| !registry.is_registered(&job.job_type)) {
                return Err(JobError::UnknownJobType(unknown.job_type.clone()).into());
            }
        }

        for job in &mut jobs {
            job.options.dedupe_key = None;
            if job.options.max_retries.is_none() {
                job.options.max_retries = self.default_max_retries;
            }
        }
        let job_types: Vec<String> = jobs.iter().map(|job| job.job_type.clone()).collect();

        let ids = self.store.enqueue_many(jobs).await?;

        for (job_id, job_type) in ids.iter().zip(job_types) {
            debug!(job_id = %job_id, job_type = %job_type, "job enqueued");
            self.events.publish(JobEvent::Enqueued {
                job_id: *job_id,
                job_type,
            });
        }
        info!(count = ids.len(), "jobs enqueued");

        Ok(ids)
    }

    /// Snapshot of a job, or `None` if it does not exist (or was cleaned up).
    pub async fn get_status(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get_status(job_id).await
    }
}
