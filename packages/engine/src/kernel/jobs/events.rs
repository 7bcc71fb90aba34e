use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Incremental progress pushed by a running handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Job lifecycle events.
///
/// These events represent facts about the job lifecycle, not commands.
/// Whoever initiated a job (CLI, chat tool) subscribes to follow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job was persisted and is waiting to be claimed.
    Enqueued { job_id: Uuid, job_type: String },

    /// A dispatcher claimed the job.
    Claimed {
        job_id: Uuid,
        job_type: String,
        worker_id: String,
        retry_count: i32,
    },

    /// The handler reported progress.
    Progress {
        job_id: Uuid,
        #[serde(flatten)]
        update: ProgressUpdate,
    },

    /// Job completed successfully.
    Completed {
        job_id: Uuid,
        job_type: String,
        duration_ms: u64,
    },

    /// Job failed and was put back to pending.
    RetryScheduled {
        job_id: Uuid,
        job_type: String,
        retry_count: i32,
        delay_ms: u64,
        error: String,
    },

    /// Job failed terminally.
    Failed {
        job_id: Uuid,
        job_type: String,
        error: String,
    },

    /// The watchdog reclaimed a job whose worker is presumed dead.
    Recovered { job_id: Uuid, job_type: String },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::Claimed { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Recovered { job_id, .. } => *job_id,
        }
    }

    /// No further events follow for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Completed { .. } | JobEvent::Failed { .. })
    }
}

/// In-process broadcast hub for job events.
///
/// Cloneable; publishing with no subscribers is a no-op.
#[derive(Clone)]
pub struct JobEvents {
    sender: broadcast::Sender<JobEvent>,
}

impl JobEvents {
    /// Create a new hub with default capacity (256 events).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: JobEvent) {
        // Ignore send errors (no active receivers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to every job's events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single job.
    pub fn subscribe_job(&self, job_id: Uuid) -> JobSubscription {
        JobSubscription {
            job_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// A progress sink bound to one job.
    pub fn reporter(&self, job_id: Uuid) -> ProgressReporter {
        ProgressReporter {
            job_id,
            events: self.clone(),
        }
    }
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Events for one job, filtered out of the shared stream.
pub struct JobSubscription {
    job_id: Uuid,
    receiver: broadcast::Receiver<JobEvent>,
}

impl JobSubscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event for this job, or `None` once the hub is gone.
    ///
    /// Lagging subscribers skip the events they missed.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.job_id() == self.job_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Progress sink handed to a handler for the job it is running.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    events: JobEvents,
}

impl ProgressReporter {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn report(&self, update: ProgressUpdate) {
        self.events.publish(JobEvent::Progress {
            job_id: self.job_id,
            update,
        });
    }

    /// `progress` out of `total`, with a short status line.
    pub fn step(&self, progress: f64, total: f64, message: impl Into<String>) {
        self.report(ProgressUpdate {
            progress,
            total: Some(total),
            message: Some(message.into()),
        });
    }
}
