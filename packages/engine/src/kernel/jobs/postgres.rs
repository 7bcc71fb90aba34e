//! PostgreSQL-backed job record store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... RETURNING`,
//! so concurrent workers (in any number of processes) never claim the same
//! row. Idempotent enqueue relies on the partial unique index over active
//! `(job_type, dedupe_key)` pairs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::job::{
    clamp_delay_ms, EnqueueOptions, EnqueueResult, ErrorKind, Job, Lease, NewJob, QueueStat,
    Transition,
};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::JobStore;

/// Attempts at resolving an enqueue that raced with a settling duplicate.
const DEDUPE_ATTEMPTS: usize = 3;

pub struct PostgresJobStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    pub fn with_retry_policy(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Insert one pending job. Timestamps come from the database clock, the same
/// clock claims compare against. Returns `None` when an active job already
/// holds the dedupe key.
async fn insert_job<'e>(
    executor: impl PgExecutor<'e>,
    job_type: &str,
    data: &serde_json::Value,
    options: &EnqueueOptions,
) -> Result<Option<Uuid>> {
    let id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO jobs (
            id, job_type, data, status, priority, retry_count, max_retries,
            dedupe_key, batch_id, created_at, scheduled_for
        )
        VALUES (
            $1, $2, $3, 'pending', $4, 0, $5, $6, $7,
            NOW(), NOW() + ($8::bigint * INTERVAL '1 millisecond')
        )
        ON CONFLICT (job_type, dedupe_key)
            WHERE dedupe_key IS NOT NULL AND status IN ('pending', 'processing')
            DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(job_type)
    .bind(data)
    .bind(options.priority)
    .bind(options.resolved_max_retries())
    .bind(&options.dedupe_key)
    .bind(options.batch_id)
    .bind(clamp_delay_ms(options.delay()))
    .fetch_optional(executor)
    .await
    .context("failed to insert job")?;

    Ok(id)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let Some(key) = options.dedupe_key.clone() else {
            let id = insert_job(&self.pool, job_type, &data, &options)
                .await?
                .context("job insert returned no id")?;
            return Ok(EnqueueResult::Created(id));
        };

        // The conflicting job may settle between the insert and the lookup;
        // another insert attempt then succeeds.
        for _ in 0..DEDUPE_ATTEMPTS {
            if let Some(id) = insert_job(&self.pool, job_type, &data, &options).await? {
                return Ok(EnqueueResult::Created(id));
            }
            if let Some(existing) = self.find_active(job_type, &key).await? {
                debug!(job_id = %existing.id, job_type = %job_type, dedupe_key = %key, "duplicate enqueue");
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        anyhow::bail!(
            "could not resolve dedupe key {} for {} after {} attempts",
            key,
            job_type,
            DEDUPE_ATTEMPTS
        )
    }

    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<Uuid>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin enqueue transaction")?;

        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let options = EnqueueOptions {
                dedupe_key: None,
                ..job.options
            };
            let id = insert_job(&mut *tx, &job.job_type, &job.data, &options)
                .await?
                .context("job insert returned no id")?;
            ids.push(id);
        }

        tx.commit()
            .await
            .context("failed to commit enqueue transaction")?;
        Ok(ids)
    }

    async fn claim_next(&self, job_types: Option<&[String]>) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'processing',
                started_at = NOW(),
                claim_token = gen_random_uuid(),
                heartbeat_at = NULL
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND scheduled_for <= NOW()
                  AND ($1::text[] IS NULL OR job_type = ANY($1))
                ORDER BY priority DESC, scheduled_for ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(job_types)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim job")?;

        Ok(job)
    }

    async fn complete(&self, lease: Lease, result: serde_json::Value) -> Result<Transition> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $3,
                completed_at = NOW()
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(lease.job_id)
        .bind(lease.token)
        .bind(result)
        .execute(&self.pool)
        .await
        .context("failed to complete job")?;

        Ok(if updated.rows_affected() == 1 {
            Transition::Completed
        } else {
            Transition::Ignored
        })
    }

    async fn fail(&self, lease: Lease, error: &str, kind: ErrorKind) -> Result<Transition> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin fail transaction")?;

        let row = sqlx::query_as::<_, (i32, i32)>(
            r#"
            SELECT retry_count, max_retries
            FROM jobs
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            FOR UPDATE
            "#,
        )
        .bind(lease.job_id)
        .bind(lease.token)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to lock job")?;

        let Some((retry_count, max_retries)) = row else {
            return Ok(Transition::Ignored);
        };

        let transition = match self.retry_policy.decide(retry_count, max_retries, kind) {
            RetryDecision::Retry {
                next_retry_count,
                delay,
            } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'pending',
                        retry_count = $2,
                        last_error = $3,
                        scheduled_for = NOW() + ($4::bigint * INTERVAL '1 millisecond')
                    WHERE id = $1
                    "#,
                )
                .bind(lease.job_id)
                .bind(next_retry_count)
                .bind(error)
                .bind(clamp_delay_ms(delay))
                .execute(&mut *tx)
                .await
                .context("failed to schedule retry")?;

                Transition::Retrying {
                    retry_count: next_retry_count,
                    delay,
                }
            }
            RetryDecision::GiveUp => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        last_error = $2,
                        completed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(lease.job_id)
                .bind(error)
                .execute(&mut *tx)
                .await
                .context("failed to mark job failed")?;

                Transition::Failed
            }
        };

        tx.commit().await.context("failed to commit job failure")?;
        Ok(transition)
    }

    async fn heartbeat(&self, lease: Lease) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = NOW()
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(lease.job_id)
        .bind(lease.token)
        .execute(&self.pool)
        .await
        .context("failed to record heartbeat")?;

        Ok(updated.rows_affected() == 1)
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn active_jobs(&self) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('pending', 'processing')
            ORDER BY priority DESC, scheduled_for ASC, created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn find_active(&self, job_type: &str, dedupe_key: &str) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE job_type = $1
              AND dedupe_key = $2
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job_type)
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn jobs_in_batch(&self, batch_id: Uuid) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE batch_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn active_batch_ids(&self) -> Result<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT batch_id
            FROM jobs
            WHERE batch_id IS NOT NULL
            GROUP BY batch_id
            HAVING COUNT(*) FILTER (WHERE status IN ('pending', 'processing')) > 0
            ORDER BY MIN(created_at) ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn stale_processing(&self, seen_before: DateTime<Utc>) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'processing'
              AND COALESCE(heartbeat_at, started_at) < $1
            ORDER BY COALESCE(heartbeat_at, started_at) ASC
            "#,
        )
        .bind(seen_before)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed') AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("failed to clean up jobs")?;

        Ok(deleted.rows_affected())
    }

    async fn queue_stats(&self) -> Result<Vec<QueueStat>> {
        sqlx::query_as::<_, QueueStat>(
            r#"
            SELECT job_type, status, COUNT(*) AS count
            FROM jobs
            GROUP BY job_type, status
            ORDER BY job_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
