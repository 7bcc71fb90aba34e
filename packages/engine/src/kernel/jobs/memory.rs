//! In-memory job store.
//!
//! Backs tests and single-process use. Every operation runs under one mutex,
//! which makes claims trivially atomic.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::{
    schedule_after, EnqueueOptions, EnqueueResult, ErrorKind, Job, JobStatus, Lease, NewJob,
    QueueStat, Transition,
};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::JobStore;

struct StoredJob {
    /// Insertion order, the final tie-breaker for claims.
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, StoredJob>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, job: Job) -> Uuid {
        let id = job.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(id, StoredJob { seq, job });
        id
    }

    /// The job under `lease`, if that lease is its current claim.
    fn claimed(&mut self, lease: Lease) -> Option<&mut Job> {
        self.jobs
            .get_mut(&lease.job_id)
            .map(|stored| &mut stored.job)
            .filter(|job| {
                job.status == JobStatus::Processing && job.claim_token == Some(lease.token)
            })
    }

    fn sorted<'a>(&'a self, filter: impl Fn(&Job) -> bool) -> Vec<&'a StoredJob> {
        let mut jobs: Vec<&StoredJob> = self.jobs.values().filter(|s| filter(&s.job)).collect();
        jobs.sort_by_key(|s| (Reverse(s.job.priority), s.job.scheduled_for, s.seq));
        jobs
    }
}

/// Job store that keeps every record in a mutex-guarded map.
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    retry_policy: RetryPolicy,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryJobStore {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Total number of stored jobs, terminal ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored job in claim order.
    pub fn jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sorted(|_| true).into_iter().map(|s| s.job.clone()).collect()
    }

    /// Rewrite a job's `started_at`; lets tests age a claim past the watchdog window.
    pub fn set_started_at(&self, job_id: Uuid, started_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.jobs.get_mut(&job_id) {
            Some(stored) => {
                stored.job.started_at = Some(started_at);
                true
            }
            None => false,
        }
    }

    /// Make a pending job claimable now regardless of its backoff.
    pub fn make_ready(&self, job_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.jobs.get_mut(&job_id) {
            Some(stored) if stored.job.status == JobStatus::Pending => {
                stored.job.scheduled_for = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(key) = options.dedupe_key.as_deref() {
            let existing = inner.jobs.values().find(|s| {
                s.job.status.is_active()
                    && s.job.job_type == job_type
                    && s.job.dedupe_key.as_deref() == Some(key)
            });
            if let Some(existing) = existing {
                return Ok(EnqueueResult::Duplicate(existing.job.id));
            }
        }

        let id = inner.insert(Job::new(job_type, data, &options, Utc::now()));
        Ok(EnqueueResult::Created(id))
    }

    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        Ok(jobs
            .into_iter()
            .map(|new| {
                let options = EnqueueOptions {
                    dedupe_key: None,
                    ..new.options
                };
                inner.insert(Job::new(new.job_type, new.data, &options, now))
            })
            .collect())
    }

    async fn claim_next(&self, job_types: Option<&[String]>) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let next_id = inner
            .sorted(|job| {
                job.is_ready(now)
                    && job_types.map_or(true, |types| types.iter().any(|t| *t == job.job_type))
            })
            .first()
            .map(|s| s.job.id);

        let Some(id) = next_id else {
            return Ok(None);
        };

        let stored = match inner.jobs.get_mut(&id) {
            Some(stored) => stored,
            None => return Ok(None),
        };
        stored.job.status = JobStatus::Processing;
        stored.job.started_at = Some(now);
        stored.job.claim_token = Some(Uuid::new_v4());
        stored.job.heartbeat_at = None;

        Ok(Some(stored.job.clone()))
    }

    async fn complete(&self, lease: Lease, result: serde_json::Value) -> Result<Transition> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.claimed(lease) {
            Some(job) => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.completed_at = Some(Utc::now());
                Ok(Transition::Completed)
            }
            None => Ok(Transition::Ignored),
        }
    }

    async fn fail(&self, lease: Lease, error: &str, kind: ErrorKind) -> Result<Transition> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let Some(job) = inner.claimed(lease) else {
            return Ok(Transition::Ignored);
        };

        job.last_error = Some(error.to_string());

        match self
            .retry_policy
            .decide(job.retry_count, job.max_retries, kind)
        {
            RetryDecision::Retry {
                next_retry_count,
                delay,
            } => {
                job.status = JobStatus::Pending;
                job.retry_count = next_retry_count;
                job.scheduled_for = schedule_after(now, delay);
                Ok(Transition::Retrying {
                    retry_count: next_retry_count,
                    delay,
                })
            }
            RetryDecision::GiveUp => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                Ok(Transition::Failed)
            }
        }
    }

    async fn heartbeat(&self, lease: Lease) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        Ok(match inner.claimed(lease) {
            Some(job) => {
                job.heartbeat_at = Some(Utc::now());
                true
            }
            None => false,
        })
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<Job>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.jobs.get(&job_id).map(|s| s.job.clone()))
    }

    async fn active_jobs(&self) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .sorted(|job| job.status.is_active())
            .into_iter()
            .map(|s| s.job.clone())
            .collect())
    }

    async fn find_active(&self, job_type: &str, dedupe_key: &str) -> Result<Option<Job>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .jobs
            .values()
            .find(|s| {
                s.job.status.is_active()
                    && s.job.job_type == job_type
                    && s.job.dedupe_key.as_deref() == Some(dedupe_key)
            })
            .map(|s| s.job.clone()))
    }

    async fn jobs_in_batch(&self, batch_id: Uuid) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut members: Vec<&StoredJob> = inner
            .jobs
            .values()
            .filter(|s| s.job.batch_id == Some(batch_id))
            .collect();
        members.sort_by_key(|s| s.seq);
        Ok(members.into_iter().map(|s| s.job.clone()).collect())
    }

    async fn active_batch_ids(&self) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Keyed by first-seen sequence so batches come back in creation order
        let mut batches: BTreeMap<Uuid, u64> = BTreeMap::new();
        for stored in inner.jobs.values() {
            if let (Some(batch_id), true) = (stored.job.batch_id, stored.job.status.is_active()) {
                let seq = batches.entry(batch_id).or_insert(stored.seq);
                *seq = (*seq).min(stored.seq);
            }
        }
        let mut ordered: Vec<(Uuid, u64)> = batches.into_iter().collect();
        ordered.sort_by_key(|(_, seq)| *seq);
        Ok(ordered.into_iter().map(|(id, _)| id).collect())
    }

    async fn stale_processing(&self, seen_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let last_seen = |job: &Job| job.heartbeat_at.or(job.started_at);
        let mut stale: Vec<Job> = inner
            .jobs
            .values()
            .filter(|s| {
                s.job.status == JobStatus::Processing
                    && last_seen(&s.job).map_or(false, |t| t < seen_before)
            })
            .map(|s| s.job.clone())
            .collect();
        stale.sort_by_key(|job| last_seen(job));
        Ok(stale)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.jobs.len();
        inner.jobs.retain(|_, s| {
            !(s.job.status.is_terminal() && s.job.completed_at.map_or(false, |t| t < older_than))
        });
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn queue_stats(&self) -> Result<Vec<QueueStat>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts: BTreeMap<(String, &'static str), (JobStatus, i64)> = BTreeMap::new();
        for stored in inner.jobs.values() {
            let entry = counts
                .entry((stored.job.job_type.clone(), stored.job.status.as_str()))
                .or_insert((stored.job.status, 0));
            entry.1 += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((job_type, _), (status, count))| QueueStat {
                job_type,
                status,
                count,
            })
            .collect())
    }
}
