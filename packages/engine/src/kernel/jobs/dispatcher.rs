//! Job dispatcher: the claim → handle → settle cycle.
//!
//! # Architecture
//!
//! ```text
//! JobDispatcher::run
//!     │
//!     ├─► Acquire an in-flight permit (at most max_in_flight handlers)
//!     ├─► Claim (JobStore::claim_next, priority then age)
//!     └─► Spawn process(job) and go back to claiming
//!             ├─► Resolve handler (JobRegistry::get)
//!             ├─► Execute on its own task, under the job timeout,
//!             │   heartbeating the claim's lease
//!             │       └─► handler(payload, job_id, ProgressReporter)
//!             └─► Settle (JobStore::complete / JobStore::fail) with the lease
//! ```
//!
//! Several dispatchers may run against the same store, in one process or many;
//! the store's claim is the only synchronization point between them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{classify_error, JobError};
use super::events::{JobEvent, JobEvents};
use super::job::{ErrorKind, Job, Lease, Transition};
use super::registry::JobRegistry;
use super::store::JobStore;

/// Configuration for a dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker ID for this loop, reported in `Claimed` events
    pub worker_id: String,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// Upper bound on a single handler execution
    pub job_timeout: Duration,
    /// How often a running handler's claim is refreshed. Must be shorter
    /// than the watchdog's staleness window.
    pub heartbeat_interval: Duration,
    /// Handlers one loop runs at the same time
    pub max_in_flight: usize,
    /// Pause after the store itself fails
    pub error_backoff: Duration,
    /// Restrict claims to these types. `None` serves every type.
    pub job_types: Option<Vec<String>>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            max_in_flight: 4,
            error_backoff: Duration::from_secs(1),
            job_types: None,
        }
    }
}

impl DispatcherConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// How a handler run ended, before settling.
enum Outcome {
    Succeeded(serde_json::Value),
    Failed { message: String, kind: ErrorKind },
    /// The claim was recovered elsewhere; the handler was abandoned.
    LeaseLost,
}

/// Pulls ready jobs and runs them through their registered handlers.
#[derive(Clone)]
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    events: JobEvents,
    config: DispatcherConfig,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>, events: JobEvents) -> Self {
        Self::with_config(store, registry, events, DispatcherConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        events: JobEvents,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// A dispatcher over the same store and registry with another config.
    pub fn with_worker(&self, config: DispatcherConfig) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> Result<bool> {
        let job = self
            .store
            .claim_next(self.config.job_types.as_deref())
            .await?;

        match job {
            Some(job) => {
                self.process(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process jobs one at a time until none are ready. Returns how many were
    /// processed.
    ///
    /// Jobs rescheduled with a backoff are not ready yet and end the drain.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Run a claimed job to completion or failure and settle it in the store.
    pub async fn process(&self, job: Job) -> Result<Transition> {
        let started = Instant::now();
        let lease = job.lease();
        let job_id = job.id;
        let job_type = job.job_type.clone();

        debug!(
            job_id = %job_id,
            job_type = %job_type,
            worker_id = %self.config.worker_id,
            retry_count = job.retry_count,
            "job claimed"
        );
        self.events.publish(JobEvent::Claimed {
            job_id,
            job_type: job_type.clone(),
            worker_id: self.config.worker_id.clone(),
            retry_count: job.retry_count,
        });

        let Some(handler) = self.registry.get(&job_type) else {
            let error = JobError::NoHandler(job_type.clone());
            error!(job_id = %job_id, job_type = %job_type, "no handler registered");
            return self
                .settle_failure(lease, &job_type, error.to_string(), ErrorKind::NonRetryable)
                .await;
        };

        let progress = self.events.reporter(job_id);
        let task = tokio::spawn(handler.invoke(job.data, job_id, progress));

        match self.supervise(lease, task).await {
            Outcome::Succeeded(value) => {
                let transition = self.store.complete(lease, value).await?;
                if transition.is_applied() {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    debug!(job_id = %job_id, job_type = %job_type, duration_ms, "job succeeded");
                    self.events.publish(JobEvent::Completed {
                        job_id,
                        job_type,
                        duration_ms,
                    });
                } else {
                    warn!(job_id = %job_id, job_type = %job_type, "completion ignored; claim no longer held");
                }
                Ok(transition)
            }
            Outcome::Failed { message, kind } => {
                warn!(job_id = %job_id, job_type = %job_type, error = %message, ?kind, "job failed");
                self.settle_failure(lease, &job_type, message, kind).await
            }
            Outcome::LeaseLost => {
                warn!(job_id = %job_id, job_type = %job_type, "claim lost while running; handler abandoned");
                Ok(Transition::Ignored)
            }
        }
    }

    /// Wait for the handler under the job timeout, heartbeating the lease.
    ///
    /// The handler task is aborted on timeout and when the lease is lost, so
    /// a job never keeps running after another worker may have claimed it.
    async fn supervise(
        &self,
        lease: Lease,
        mut task: tokio::task::JoinHandle<Result<serde_json::Value>>,
    ) -> Outcome {
        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(value)) => Outcome::Succeeded(value),
                        Ok(Err(e)) => Outcome::Failed {
                            message: format!("{:#}", e),
                            kind: classify_error(&e),
                        },
                        Err(join_error) => Outcome::Failed {
                            message: format!("handler panicked: {}", join_error),
                            kind: ErrorKind::Retryable,
                        },
                    };
                }
                _ = &mut deadline => {
                    task.abort();
                    let error = JobError::Timeout {
                        after_ms: self.config.job_timeout.as_millis() as u64,
                    };
                    return Outcome::Failed {
                        message: error.to_string(),
                        kind: error.kind(),
                    };
                }
                _ = heartbeat.tick() => {
                    match self.store.heartbeat(lease).await {
                        Ok(true) => {}
                        Ok(false) => {
                            task.abort();
                            return Outcome::LeaseLost;
                        }
                        Err(e) => warn!(job_id = %lease.job_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    }

    async fn settle_failure(
        &self,
        lease: Lease,
        job_type: &str,
        message: String,
        kind: ErrorKind,
    ) -> Result<Transition> {
        let job_id = lease.job_id;
        let transition = self.store.fail(lease, &message, kind).await?;

        match transition {
            Transition::Retrying { retry_count, delay } => {
                info!(
                    job_id = %job_id,
                    job_type = %job_type,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "job retry scheduled"
                );
                self.events.publish(JobEvent::RetryScheduled {
                    job_id,
                    job_type: job_type.to_string(),
                    retry_count,
                    delay_ms: delay.as_millis() as u64,
                    error: message,
                });
            }
            Transition::Failed => {
                info!(job_id = %job_id, job_type = %job_type, error = %message, "job failed terminally");
                self.events.publish(JobEvent::Failed {
                    job_id,
                    job_type: job_type.to_string(),
                    error: message,
                });
            }
            Transition::Ignored => {
                warn!(job_id = %job_id, job_type = %job_type, "failure ignored; claim no longer held");
            }
            Transition::Completed => {}
        }

        Ok(transition)
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Up to `max_in_flight` handlers run concurrently; the loop keeps
    /// claiming while any permit is free. On cancellation no new jobs are
    /// claimed and in-flight ones run to completion (or their timeout).
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let max_in_flight = self.config.max_in_flight.max(1);
        info!(
            worker_id = %self.config.worker_id,
            job_types = ?self.config.job_types,
            max_in_flight,
            "job dispatcher starting"
        );

        let permits = Arc::new(Semaphore::new(max_in_flight));
        let mut in_flight: JoinSet<Result<Transition>> = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                self.log_settled(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit?,
            };

            match self
                .store
                .claim_next(self.config.job_types.as_deref())
                .await
            {
                Ok(Some(job)) => {
                    let dispatcher = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        dispatcher.process(job).await
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(worker_id = %self.config.worker_id, error = %e, "job store unavailable");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(
                worker_id = %self.config.worker_id,
                count = in_flight.len(),
                "waiting for running jobs to complete"
            );
        }
        while let Some(joined) = in_flight.join_next().await {
            self.log_settled(joined);
        }

        info!(worker_id = %self.config.worker_id, "job dispatcher stopped");
        Ok(())
    }

    fn log_settled(&self, joined: std::result::Result<Result<Transition>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!(worker_id = %self.config.worker_id, error = %e, "failed to settle job")
            }
            Err(e) => error!(worker_id = %self.config.worker_id, error = %e, "job task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{EnqueueOptions, InMemoryJobStore, JobStatus, RetryPolicy};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AddJob {
        a: i64,
        b: i64,
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        registry: Arc<JobRegistry>,
        dispatcher: JobDispatcher,
    }

    fn fixture(config: DispatcherConfig) -> Fixture {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        let registry = Arc::new(JobRegistry::new());
        let dispatcher =
            JobDispatcher::with_config(store.clone(), registry.clone(), JobEvents::new(), config);
        Fixture {
            store,
            registry,
            dispatcher,
        }
    }

    async fn enqueue(store: &InMemoryJobStore, job_type: &str, data: serde_json::Value) -> Uuid {
        store
            .enqueue(job_type, data, EnqueueOptions::default())
            .await
            .unwrap()
            .job_id()
    }

    #[test]
    fn test_config_with_worker_id() {
        let config = DispatcherConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
        assert!(config.job_types.is_none());
    }

    #[tokio::test]
    async fn run_once_on_empty_queue_returns_false() {
        let f = fixture(DispatcherConfig::default());
        assert!(!f.dispatcher.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn success_stores_result() {
        let f = fixture(DispatcherConfig::default());
        f.registry.register("add", "tests", |job: AddJob, _id, _p| async move {
            Ok(job.a + job.b)
        });
        let id = enqueue(&f.store, "add", serde_json::json!({"a": 2, "b": 3})).await;

        assert!(f.dispatcher.run_once().await.unwrap());

        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn missing_handler_fails_without_retry() {
        let f = fixture(DispatcherConfig::default());
        let id = enqueue(&f.store, "orphan", serde_json::json!({})).await;

        f.dispatcher.run_once().await.unwrap();

        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(
            job.last_error.as_deref(),
            Some("no handler registered for job type: orphan")
        );
    }

    #[tokio::test]
    async fn invalid_payload_fails_without_retry() {
        let f = fixture(DispatcherConfig::default());
        f.registry.register("add", "tests", |job: AddJob, _id, _p| async move {
            Ok(job.a + job.b)
        });
        let id = enqueue(&f.store, "add", serde_json::json!({"a": "two"})).await;

        f.dispatcher.run_once().await.unwrap();

        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn handler_error_is_retried() {
        let f = fixture(DispatcherConfig::default());
        f.registry.register("flaky", "tests", |_: serde_json::Value, _id, _p| async move {
            Err::<(), _>(anyhow::anyhow!("provider unavailable"))
        });
        let id = enqueue(&f.store, "flaky", serde_json::json!({})).await;

        f.dispatcher.run_once().await.unwrap();

        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("provider unavailable"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let f = fixture(DispatcherConfig::default());
        f.registry.register("boom", "tests", |_: serde_json::Value, _id, _p| async move {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
        let id = enqueue(&f.store, "boom", serde_json::json!({})).await;

        f.dispatcher.run_once().await.unwrap();

        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.unwrap().starts_with("handler panicked"));
    }

    #[tokio::test]
    async fn hung_handler_times_out() {
        let f = fixture(DispatcherConfig {
            job_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        f.registry.register("hang", "tests", |_: serde_json::Value, _id, _p| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let id = enqueue(&f.store, "hang", serde_json::json!({})).await;

        f.dispatcher.run_once().await.unwrap();

        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("job timed out after 20ms"));
    }

    #[tokio::test]
    async fn type_filter_leaves_other_types() {
        let f = fixture(DispatcherConfig {
            job_types: Some(vec!["wanted".to_string()]),
            ..Default::default()
        });
        enqueue(&f.store, "other", serde_json::json!({})).await;

        assert!(!f.dispatcher.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let f = fixture(DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.dispatcher.clone().run(shutdown.clone()));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn heartbeats_keep_a_long_job_from_being_recovered() {
        use crate::kernel::jobs::{Watchdog, WatchdogConfig};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let f = fixture(DispatcherConfig {
            heartbeat_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, pk) = (running.clone(), peak.clone());
        f.registry.register("slow", "tests", move |_: serde_json::Value, _id, _p| {
            let (running, peak) = (r.clone(), pk.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let id = enqueue(&f.store, "slow", serde_json::json!({})).await;

        let first = f.dispatcher.clone();
        let worker = tokio::spawn(async move { first.run_once().await });

        // A second worker and the watchdog both compete while the job runs.
        let second = f.dispatcher.clone();
        let watchdog = Watchdog::new(
            f.store.clone(),
            JobEvents::new(),
            WatchdogConfig {
                stale_after: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let mut requeued = 0;
        for _ in 0..12 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            requeued += watchdog.recover_stale().await.unwrap().requeued;
            second.run_once().await.unwrap();
        }

        assert!(worker.await.unwrap().unwrap());
        assert_eq!(requeued, 0);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn lost_lease_abandons_the_handler_without_settling() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let f = fixture(DispatcherConfig {
            heartbeat_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        f.registry.register("slow", "tests", move |_: serde_json::Value, _id, _p| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                done.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        let id = enqueue(&f.store, "slow", serde_json::json!({})).await;

        let dispatcher = f.dispatcher.clone();
        let worker = tokio::spawn(async move { dispatcher.run_once().await });

        let mut claimed = None;
        for _ in 0..100 {
            let job = f.store.get_status(id).await.unwrap().unwrap();
            if job.status == JobStatus::Processing {
                claimed = Some(job);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let claimed = claimed.expect("job was never claimed");

        // Recovered elsewhere: the claim is settled out from under the worker.
        f.store
            .fail(claimed.lease(), "recovered", ErrorKind::Retryable)
            .await
            .unwrap();

        let returned = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker kept running after losing its lease");
        assert!(returned.unwrap().unwrap());
        assert!(!finished.load(Ordering::SeqCst));

        let job = f.store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn hung_handler_does_not_block_other_claims() {
        let f = fixture(DispatcherConfig {
            poll_interval: Duration::from_millis(5),
            job_timeout: Duration::from_millis(500),
            max_in_flight: 2,
            ..Default::default()
        });
        f.registry.register("hang", "tests", |_: serde_json::Value, _id, _p| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        f.registry.register("quick", "tests", |_: serde_json::Value, _id, _p| async move {
            Ok(())
        });
        let hung = f
            .store
            .enqueue(
                "hang",
                serde_json::json!({}),
                EnqueueOptions::builder().priority(10).build(),
            )
            .await
            .unwrap()
            .job_id();
        let quick = enqueue(&f.store, "quick", serde_json::json!({})).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.dispatcher.clone().run(shutdown.clone()));

        let mut quick_status = JobStatus::Pending;
        for _ in 0..40 {
            quick_status = f.store.get_status(quick).await.unwrap().unwrap().status;
            if quick_status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(quick_status, JobStatus::Completed);
        let hung_job = f.store.get_status(hung).await.unwrap().unwrap();
        assert_eq!(hung_job.status, JobStatus::Processing);

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let hung_job = f.store.get_status(hung).await.unwrap().unwrap();
        assert_eq!(hung_job.status, JobStatus::Pending);
        assert_eq!(hung_job.last_error.as_deref(), Some("job timed out after 500ms"));
    }
}
