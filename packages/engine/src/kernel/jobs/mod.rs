//! Job infrastructure for durable background work.
//!
//! This module provides the kernel-level infrastructure for job execution:
//! - [`JobStore`] - Job record storage with atomic claim ([`PostgresJobStore`], [`InMemoryJobStore`])
//! - [`JobRegistry`] - Runtime-extensible map of job type to typed handler
//! - [`RetryPolicy`] - Capped exponential backoff
//! - [`JobDispatcher`] - Polling loop that claims, executes and settles jobs
//! - [`Watchdog`] - Requeues jobs orphaned by dead workers, sweeps old ones
//! - [`JobQueue`] - Typed enqueue facade
//! - [`BatchCoordinator`] - Groups jobs and derives their aggregate status
//!
//! # Architecture
//!
//! ```text
//! Producer calls queue.enqueue(&payload)
//!     │
//!     └─► JobStore.enqueue() (dedupe on active (type, key))
//!
//! JobDispatcher (× N, any number of processes, max_in_flight handlers each)
//!     │
//!     ├─► JobStore.claim_next()      priority DESC, scheduled_for ASC, mints a Lease
//!     ├─► JobRegistry.get(job_type)  typed deserialize
//!     ├─► handler(payload, job_id, ProgressReporter)
//!     │       └─► JobStore.heartbeat(lease) every heartbeat_interval
//!     └─► JobStore.complete(lease) / JobStore.fail(lease) → RetryPolicy
//!
//! Watchdog
//!     └─► JobStore.stale_processing() → JobStore.fail(stale lease)
//! ```
//!
//! # Domain-Specific Jobs
//!
//! Payloads and handlers live in their respective domains.
//! This module only provides the infrastructure.

pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod events;
mod job;
mod memory;
pub mod pool;
mod postgres;
pub mod queue;
pub mod registry;
mod retry;
mod store;
pub mod watchdog;

pub use batch::{BatchCoordinator, BatchError, BatchOperation, BatchState, BatchStatusSummary};
pub use dispatcher::{DispatcherConfig, JobDispatcher};
pub use error::{classify_error, JobError};
pub use events::{JobEvent, JobEvents, JobSubscription, ProgressReporter, ProgressUpdate};
pub use job::{
    clamp_delay_ms, schedule_after, EnqueueOptions, EnqueueResult, ErrorKind, Job, JobStatus,
    Lease, NewJob, QueueStat, Transition, DEFAULT_MAX_RETRIES, MAX_DELAY_MS,
};
pub use memory::InMemoryJobStore;
pub use pool::WorkerPool;
pub use postgres::PostgresJobStore;
pub use queue::{JobPayload, JobQueue};
pub use registry::{JobHandler, JobRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::JobStore;
pub use watchdog::{SweepReport, Watchdog, WatchdogConfig};
