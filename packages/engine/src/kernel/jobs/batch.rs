//! Batch coordinator.
//!
//! A batch is a client-defined grouping of jobs. Membership lives on the job
//! rows (`batch_id`); the aggregate status is recomputed from current job
//! state on every read and never stored.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::error::JobError;
use super::job::{EnqueueOptions, Job, JobStatus, NewJob};
use super::queue::{JobPayload, JobQueue};

/// One job submission within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub job_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

impl BatchOperation {
    pub fn new(job_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            data,
            priority: 0,
            max_retries: None,
        }
    }

    /// Build an operation from a typed payload and its scheduling metadata.
    pub fn from_payload<J: JobPayload>(job: &J) -> Result<Self> {
        Ok(Self {
            job_type: J::JOB_TYPE.to_string(),
            data: serde_json::to_value(job)?,
            priority: job.priority(),
            max_retries: job.max_retries(),
        })
    }
}

/// Derived status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// At least one member is still pending or processing
    Processing,
    /// Every member completed
    Completed,
    /// Every member is terminal and at least one failed
    Failed,
}

/// A failed member's error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    pub job_id: Uuid,
    pub job_type: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusSummary {
    pub batch_id: Uuid,
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    /// Members still pending or processing
    pub pending_operations: usize,
    pub errors: Vec<BatchError>,
    pub status: BatchState,
}

/// Aggregate member jobs into a batch summary.
pub fn summarize(batch_id: Uuid, members: &[Job]) -> BatchStatusSummary {
    let mut completed = 0;
    let mut failed = 0;
    let mut errors = Vec::new();

    for job in members {
        match job.status {
            JobStatus::Completed => completed += 1,
            JobStatus::Failed => {
                failed += 1;
                errors.push(BatchError {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    error: job.last_error.clone().unwrap_or_default(),
                });
            }
            JobStatus::Pending | JobStatus::Processing => {}
        }
    }

    let total = members.len();
    let pending = total - completed - failed;
    let status = if pending > 0 {
        BatchState::Processing
    } else if failed > 0 {
        BatchState::Failed
    } else {
        BatchState::Completed
    };

    BatchStatusSummary {
        batch_id,
        total_operations: total,
        completed_operations: completed,
        failed_operations: failed,
        pending_operations: pending,
        errors,
        status,
    }
}

/// Groups job submissions under one batch id.
#[derive(Clone)]
pub struct BatchCoordinator {
    queue: JobQueue,
}

impl BatchCoordinator {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Enqueue every operation under a fresh batch id.
    ///
    /// The batch is written all-or-nothing: if any operation is refused
    /// (for example an unknown type on a strict queue), no member exists.
    /// Members are never deduplicated: each operation becomes its own job.
    pub async fn enqueue_batch(&self, operations: Vec<BatchOperation>) -> Result<Uuid> {
        if operations.is_empty() {
            return Err(JobError::EmptyBatch.into());
        }

        let batch_id = Uuid::now_v7();
        let jobs: Vec<NewJob> = operations
            .into_iter()
            .map(|operation| NewJob {
                job_type: operation.job_type,
                data: operation.data,
                options: EnqueueOptions {
                    priority: operation.priority,
                    max_retries: operation.max_retries,
                    delay_ms: 0,
                    dedupe_key: None,
                    batch_id: Some(batch_id),
                },
            })
            .collect();

        let ids = self.queue.enqueue_many(jobs).await?;

        info!(batch_id = %batch_id, operations = ids.len(), "batch enqueued");
        Ok(batch_id)
    }

    /// Live status of a batch, or `None` if it has no members.
    pub async fn get_batch_status(&self, batch_id: Uuid) -> Result<Option<BatchStatusSummary>> {
        let members = self.queue.store().jobs_in_batch(batch_id).await?;
        if members.is_empty() {
            return Ok(None);
        }
        Ok(Some(summarize(batch_id, &members)))
    }

    /// Batches with at least one member still pending or processing.
    pub async fn active_batches(&self) -> Result<Vec<BatchStatusSummary>> {
        let mut summaries = Vec::new();
        for batch_id in self.queue.store().active_batch_ids().await? {
            if let Some(summary) = self.get_batch_status(batch_id).await? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }
}
