//! Job record store interface.
//!
//! The store is the only shared mutable resource of the engine. Every
//! implementation must make `claim_next` atomic (a single conditional update
//! or an equivalent compare-and-swap) so two concurrent claims never return
//! the same job, and must settle only the claim that a [`Lease`] names.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::{
    EnqueueOptions, EnqueueResult, ErrorKind, Job, Lease, NewJob, QueueStat, Transition,
};

/// Trait for job record storage.
///
/// Routine outcomes ("nothing to claim", "job already terminal", "no such
/// job") are values. `Err` means the store itself is unavailable.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job, eligible at `now + delay_ms`.
    ///
    /// If the options carry a dedupe key and an active job with the same
    /// (type, key) exists, nothing is written and its ID is returned.
    async fn enqueue(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult>;

    /// Persist every job or none of them. Dedupe keys are not consulted.
    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<Uuid>>;

    /// Atomically claim the eligible job with the highest priority, oldest
    /// `scheduled_for` first among equals. `job_types` restricts candidates.
    ///
    /// The returned job carries a fresh claim token; see [`Job::lease`].
    async fn claim_next(&self, job_types: Option<&[String]>) -> Result<Option<Job>>;

    /// `processing → completed`, storing the result. Ignored unless the
    /// lease is the job's current claim.
    async fn complete(&self, lease: Lease, result: serde_json::Value) -> Result<Transition>;

    /// `processing → pending` (retry) or `processing → failed`, per the
    /// store's retry policy. Ignored unless the lease is the current claim.
    async fn fail(&self, lease: Lease, error: &str, kind: ErrorKind) -> Result<Transition>;

    /// Record that the claim is still alive. Returns `false` once the lease
    /// has been lost (settled, or recovered by the watchdog).
    async fn heartbeat(&self, lease: Lease) -> Result<bool>;

    async fn get_status(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Jobs in `pending` or `processing`, in claim order.
    async fn active_jobs(&self) -> Result<Vec<Job>>;

    /// The active job holding a dedupe key, if any.
    async fn find_active(&self, job_type: &str, dedupe_key: &str) -> Result<Option<Job>>;

    /// Members of a batch, in enqueue order.
    async fn jobs_in_batch(&self, batch_id: Uuid) -> Result<Vec<Job>>;

    /// Batches with at least one non-terminal member.
    async fn active_batch_ids(&self) -> Result<Vec<Uuid>>;

    /// Jobs in `processing` whose last heartbeat (or claim, if none) is
    /// older than `seen_before`.
    async fn stale_processing(&self, seen_before: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Remove terminal jobs completed before `older_than`. Returns the count.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn queue_stats(&self) -> Result<Vec<QueueStat>>;
}
