use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::dispatcher::JobDispatcher;
use super::watchdog::Watchdog;

/// N dispatcher loops plus one watchdog sharing a shutdown token.
pub struct WorkerPool {
    tasks: JoinSet<Result<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Start `concurrency` copies of `dispatcher` (at least one) and the watchdog.
    ///
    /// Each copy gets a distinct worker ID derived from the template's.
    pub fn spawn(dispatcher: JobDispatcher, watchdog: Watchdog, concurrency: usize) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let base_id = dispatcher.config().worker_id.clone();

        for n in 0..concurrency.max(1) {
            let mut config = dispatcher.config().clone();
            config.worker_id = format!("{}-{}", base_id, n);
            let loop_dispatcher = dispatcher.with_worker(config);
            tasks.spawn(loop_dispatcher.run(shutdown.child_token()));
        }
        tasks.spawn(watchdog.run(shutdown.child_token()));

        info!(concurrency = concurrency.max(1), "worker pool started");
        Self { tasks, shutdown }
    }

    /// Cancel all loops and wait for in-flight jobs to settle.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "worker loop exited with error"),
                Err(e) => error!(error = %e, "worker loop panicked"),
            }
        }

        info!("worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{
        DispatcherConfig, EnqueueOptions, InMemoryJobStore, JobEvents, JobRegistry, JobStatus,
        JobStore, WatchdogConfig,
    };
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_processes_jobs_and_shuts_down() {
        let store = Arc::new(InMemoryJobStore::default());
        let registry = Arc::new(JobRegistry::new());
        let events = JobEvents::new();
        registry.register("noop", "tests", |_: serde_json::Value, _id, _p| async move { Ok(()) });

        let mut ids = Vec::new();
        for _ in 0..5 {
            let result = store
                .enqueue("noop", serde_json::json!({}), EnqueueOptions::default())
                .await
                .unwrap();
            ids.push(result.job_id());
        }

        let dispatcher = JobDispatcher::with_config(
            store.clone(),
            registry,
            events.clone(),
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let watchdog = Watchdog::new(store.clone(), events, WatchdogConfig::default());
        let pool = WorkerPool::spawn(dispatcher, watchdog, 3);

        for _ in 0..100 {
            let active = store.active_jobs().await.unwrap();
            if active.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await.unwrap();

        for id in ids {
            let job = store.get_status(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
    }
}
