//! Watchdog for jobs orphaned in `processing`.
//!
//! A job stays `processing` forever if the process that claimed it dies
//! mid-execution. Live workers heartbeat their claims, so the watchdog treats
//! any job not heard from within the staleness window as failed-for-retry.
//! The failure is settled against the stale claim's lease: if the original
//! worker later reports back, its settle is ignored. Old terminal jobs are
//! periodically removed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{JobEvent, JobEvents};
use super::job::{ErrorKind, Transition};
use super::store::JobStore;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// A `processing` job not heartbeated for this long is presumed orphaned
    pub stale_after: Duration,
    /// Terminal jobs older than this are removed
    pub retention: Duration,
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600),
            retention: Duration::from_secs(7 * 24 * 3600),
            interval: Duration::from_secs(60),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale jobs put back to pending
    pub requeued: usize,
    /// Stale jobs whose retry budget was exhausted
    pub failed: usize,
    /// Terminal jobs removed
    pub cleaned: u64,
}

pub struct Watchdog {
    store: Arc<dyn JobStore>,
    events: JobEvents,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(store: Arc<dyn JobStore>, events: JobEvents, config: WatchdogConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Fail every stale `processing` job through the normal retry path.
    pub async fn recover_stale(&self) -> Result<SweepReport> {
        let cutoff = cutoff(self.config.stale_after);
        let stale = self.store.stale_processing(cutoff).await?;
        let mut report = SweepReport::default();

        for job in stale {
            let message = format!(
                "worker presumed dead: job processing for longer than {}ms",
                self.config.stale_after.as_millis()
            );
            match self.store.fail(job.lease(), &message, ErrorKind::Retryable).await? {
                Transition::Retrying { retry_count, delay } => {
                    report.requeued += 1;
                    warn!(job_id = %job.id, job_type = %job.job_type, retry_count, "stale job requeued");
                    self.events.publish(JobEvent::Recovered {
                        job_id: job.id,
                        job_type: job.job_type.clone(),
                    });
                    self.events.publish(JobEvent::RetryScheduled {
                        job_id: job.id,
                        job_type: job.job_type,
                        retry_count,
                        delay_ms: delay.as_millis() as u64,
                        error: message,
                    });
                }
                Transition::Failed => {
                    report.failed += 1;
                    warn!(job_id = %job.id, job_type = %job.job_type, "stale job failed; retries exhausted");
                    self.events.publish(JobEvent::Failed {
                        job_id: job.id,
                        job_type: job.job_type,
                        error: message,
                    });
                }
                // Settled by its worker between the scan and the update
                Transition::Ignored | Transition::Completed => {}
            }
        }

        Ok(report)
    }

    /// Remove terminal jobs older than the retention horizon.
    pub async fn cleanup(&self) -> Result<u64> {
        let cutoff = cutoff(self.config.retention);
        let removed = self.store.cleanup(cutoff).await?;
        if removed > 0 {
            info!(removed, "old terminal jobs cleaned up");
        }
        Ok(removed)
    }

    /// One full pass: recovery then cleanup.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = self.recover_stale().await?;
        report.cleaned = self.cleanup().await?;
        if report.requeued + report.failed > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "recovered stale jobs"
            );
        }
        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            stale_after_ms = self.config.stale_after.as_millis() as u64,
            interval_ms = self.config.interval.as_millis() as u64,
            "job watchdog starting"
        );

        loop {
            match self.sweep().await {
                Ok(report) => debug!(?report, "watchdog sweep finished"),
                Err(e) => error!(error = %e, "watchdog sweep failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("job watchdog stopped");
        Ok(())
    }
}

/// `now - window`, saturating at the earliest representable instant.
fn cutoff(window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{EnqueueOptions, InMemoryJobStore, JobStatus, RetryPolicy};
    use uuid::Uuid;

    fn watchdog(store: Arc<InMemoryJobStore>) -> Watchdog {
        Watchdog::new(
            store,
            JobEvents::new(),
            WatchdogConfig {
                stale_after: Duration::from_secs(60),
                ..Default::default()
            },
        )
    }

    async fn claim_with_age(store: &InMemoryJobStore, max_retries: i32, age_secs: i64) -> Uuid {
        let id = store
            .enqueue(
                "test_job",
                serde_json::json!({}),
                EnqueueOptions::builder().max_retries(max_retries).build(),
            )
            .await
            .unwrap()
            .job_id();
        store.claim_next(None).await.unwrap().unwrap();
        store.set_started_at(id, Utc::now() - chrono::Duration::seconds(age_secs));
        id
    }

    #[tokio::test]
    async fn stale_job_is_requeued_with_retry_accounting() {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        let id = claim_with_age(&store, 3, 120).await;

        let report = watchdog(store.clone()).recover_stale().await.unwrap();

        assert_eq!(report.requeued, 1);
        let job = store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.last_error.unwrap().starts_with("worker presumed dead"));
    }

    #[tokio::test]
    async fn fresh_processing_job_is_left_alone() {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        let id = claim_with_age(&store, 3, 5).await;

        let report = watchdog(store.clone()).recover_stale().await.unwrap();

        assert_eq!(report, SweepReport::default());
        let job = store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn stale_job_without_budget_fails() {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        let id = claim_with_age(&store, 0, 120).await;

        let report = watchdog(store.clone()).recover_stale().await.unwrap();

        assert_eq!(report.failed, 1);
        let job = store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn late_settle_from_recovered_worker_is_ignored() {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        store
            .enqueue("test_job", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let stale = store.claim_next(None).await.unwrap().unwrap();
        store.set_started_at(stale.id, Utc::now() - chrono::Duration::seconds(120));

        watchdog(store.clone()).recover_stale().await.unwrap();
        let reclaimed = store.claim_next(None).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, stale.id);

        let late = store
            .complete(stale.lease(), serde_json::json!("stale"))
            .await
            .unwrap();
        assert_eq!(late, Transition::Ignored);
        assert!(!store.heartbeat(stale.lease()).await.unwrap());

        let current = store
            .complete(reclaimed.lease(), serde_json::json!("fresh"))
            .await
            .unwrap();
        assert_eq!(current, Transition::Completed);
        let job = store.get_status(stale.id).await.unwrap().unwrap();
        assert_eq!(job.result, Some(serde_json::json!("fresh")));
    }

    #[tokio::test]
    async fn recent_heartbeat_outweighs_an_old_claim() {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        let id = claim_with_age(&store, 3, 120).await;
        let job = store.get_status(id).await.unwrap().unwrap();
        assert!(store.heartbeat(job.lease()).await.unwrap());

        let report = watchdog(store.clone()).recover_stale().await.unwrap();

        assert_eq!(report.requeued, 0);
        let job = store.get_status(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }
}
