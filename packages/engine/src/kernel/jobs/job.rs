//! Job model for background work.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Retry budget applied when the caller does not pick one.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Longest delay a job can be pushed out by (about a century). Larger delays
/// are clamped so `scheduled_for` stays representable in chrono and Postgres.
pub const MAX_DELAY_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// A delay in whole milliseconds, clamped to [`MAX_DELAY_MS`].
pub fn clamp_delay_ms(delay: Duration) -> i64 {
    u64::try_from(delay.as_millis())
        .unwrap_or(u64::MAX)
        .min(MAX_DELAY_MS) as i64
}

/// `now + delay`, saturating at the latest representable instant.
pub fn schedule_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(chrono::Duration::milliseconds(clamp_delay_ms(delay)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change again (only cleanup removes them).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

// ============================================================================
// Store results
// ============================================================================

/// Result type for enqueue operations that handles idempotency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Job was enqueued, returns new job ID
    Created(Uuid),
    /// An active job with the same dedupe key exists, returns its ID
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Outcome of settling a claimed job.
///
/// `Ignored` is the sentinel for a missing job or one that is not
/// `processing` (duplicate completion signals, late watchdog sweeps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed,
    Retrying { retry_count: i32, delay: Duration },
    Failed,
    Ignored,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Transition::Ignored)
    }
}

/// Job counts per (type, status), for operational visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct QueueStat {
    pub job_type: String,
    pub status: JobStatus,
    pub count: i64,
}

// ============================================================================
// Enqueue options
// ============================================================================

/// Options for enqueueing a job.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct EnqueueOptions {
    /// Higher is served first.
    #[builder(default)]
    pub priority: i32,
    /// Retry budget. `None` uses the queue default.
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,
    /// Delay before the job becomes claimable.
    #[builder(default)]
    pub delay_ms: u64,
    /// At most one pending/processing job exists per (type, dedupe key).
    #[builder(default, setter(strip_option, into))]
    pub dedupe_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub batch_id: Option<Uuid>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EnqueueOptions {
    pub fn resolved_max_retries(&self) -> i32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(0)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// A job to persist as part of an all-or-nothing group.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub data: serde_json::Value,
    pub options: EnqueueOptions,
}

// ============================================================================
// Lease
// ============================================================================

/// One claim of a job.
///
/// Every claim mints a fresh token. Settling or heartbeating with the lease
/// of an earlier claim is ignored, so a worker that lost its job to the
/// watchdog cannot settle the next claimant's attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub job_id: Uuid,
    pub token: Uuid,
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,

    // Payload and output
    pub data: serde_json::Value,
    pub result: Option<serde_json::Value>,

    // State
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,

    // Grouping
    pub dedupe_key: Option<String>,
    pub batch_id: Option<Uuid>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // Claim ownership
    pub claim_token: Option<Uuid>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh pending job as `enqueue` would persist it.
    pub fn new(
        job_type: impl Into<String>,
        data: serde_json::Value,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            data,
            result: None,
            status: JobStatus::Pending,
            priority: options.priority,
            retry_count: 0,
            max_retries: options.resolved_max_retries(),
            last_error: None,
            dedupe_key: options.dedupe_key.clone(),
            batch_id: options.batch_id,
            created_at: now,
            scheduled_for: schedule_after(now, options.delay()),
            started_at: None,
            completed_at: None,
            claim_token: None,
            heartbeat_at: None,
        }
    }

    /// The lease of the current claim. A job that was never claimed carries
    /// a nil token, which matches nothing.
    pub fn lease(&self) -> Lease {
        Lease {
            job_id: self.id,
            token: self.claim_token.unwrap_or_else(Uuid::nil),
        }
    }

    /// Pending and past its scheduled time.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }
}
