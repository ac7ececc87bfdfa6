//! Queue operations: enqueue, lease, complete, fail, recover.

use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::job::{Job, JobStatus};

/// Retry delay after the n-th failed attempt: `10s * 2^n`, capped at one
/// hour. Captures take seconds to tens of seconds, so sub-minute early
/// retries keep throughput; the cap keeps a flapping dependency from parking
/// jobs past incident recovery.
pub fn backoff(attempts: i32) -> Duration {
    const BASE_SECS: u64 = 10;
    const CAP_SECS: u64 = 3_600;

    // 2^9 * 10s already exceeds the cap; clamping the exponent avoids overflow.
    let exp = attempts.clamp(0, 9) as u32;
    Duration::from_secs((BASE_SECS << exp).min(CAP_SECS))
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The row is not `running`, or is leased by someone else. The caller
    /// no longer owns this job and must not touch it further.
    #[error("job {0} is not running under this lease")]
    NotRunning(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Handle to the durable queue. Cheap to clone; all state lives in Postgres.
#[derive(Clone)]
pub struct JobQueue {
    db: PgPool,
    default_max_attempts: i32,
}

impl JobQueue {
    pub fn new(db: PgPool, default_max_attempts: i32) -> Self {
        Self {
            db,
            default_max_attempts,
        }
    }

    pub fn db(&self) -> &PgPool {
        &self.db
    }

    /// Insert a pending job runnable now. Only storage errors fail this.
    pub async fn enqueue<P: Serialize>(&self, job_type: &str, payload: &P) -> Result<Uuid, QueueError> {
        self.enqueue_with_priority(job_type, payload, 0).await
    }

    /// As [`JobQueue::enqueue`] with an explicit priority (higher first).
    pub async fn enqueue_with_priority<P: Serialize>(
        &self,
        job_type: &str,
        payload: &P,
        priority: i32,
    ) -> Result<Uuid, QueueError> {
        let job = Job::new(
            job_type,
            serde_json::to_value(payload)?,
            priority,
            self.default_max_attempts,
        );
        job.insert(&self.db).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        Ok(job.id)
    }

    /// Atomically claim up to `limit` runnable jobs for `worker_id`.
    ///
    /// Selection is `status = 'pending' AND run_at <= now`, ordered
    /// `priority DESC, run_at ASC`. The inner `FOR UPDATE SKIP LOCKED`
    /// select plus the `status = 'pending'` condition on the update make the
    /// claim a compare-and-set: two dispatchers polling concurrently may
    /// interleave which rows they get, but never share one.
    pub async fn lease_batch(
        &self,
        worker_id: &str,
        limit: i64,
        lease_duration: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            WITH leasable AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND run_at <= NOW()
                ORDER BY priority DESC, run_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                locked_by = $2,
                locked_at = NOW(),
                lease_until = NOW() + ($3 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM leasable) AND status = 'pending'
            RETURNING id, job_type, payload, status, priority, run_at,
                      locked_by, locked_at, lease_until,
                      attempts, max_attempts, last_error, created_at, updated_at
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .bind(lease_duration.as_millis().to_string())
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }

    /// Mark a leased job succeeded. Fails with [`QueueError::NotRunning`]
    /// when the lease was lost in the meantime.
    pub async fn complete(&self, id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                locked_by = NULL,
                locked_at = NULL,
                lease_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotRunning(id));
        }
        Ok(())
    }

    /// Record a failed attempt. While attempts remain the job returns to
    /// `pending` with `run_at = now + backoff(attempts)`; otherwise it is
    /// terminally `failed`. Returns the resulting status so callers can react
    /// to exhaustion.
    pub async fn fail(&self, id: Uuid, worker_id: &str, error: &str) -> Result<JobStatus, QueueError> {
        let mut tx = self.db.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, payload, status, priority, run_at,
                   locked_by, locked_at, lease_until,
                   attempts, max_attempts, last_error, created_at, updated_at
            FROM jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(QueueError::NotRunning(id))?;

        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Err(QueueError::NotRunning(id));
        }

        let attempts = job.attempts + 1;
        let status = if attempts < job.max_attempts {
            let delay = backoff(attempts);
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    attempts = $2,
                    last_error = $3,
                    run_at = NOW() + ($4 || ' milliseconds')::INTERVAL,
                    locked_by = NULL,
                    locked_at = NULL,
                    lease_until = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(attempts)
            .bind(error)
            .bind(delay.as_millis().to_string())
            .execute(&mut *tx)
            .await?;
            JobStatus::Pending
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    attempts = $2,
                    last_error = $3,
                    locked_by = NULL,
                    locked_at = NULL,
                    lease_until = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(attempts)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            JobStatus::Failed
        };

        tx.commit().await?;
        Ok(status)
    }

    /// Give a leased job straight back without counting an attempt. Used by
    /// the dispatcher when the worker channel is saturated.
    pub async fn release(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                lease_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Sweep expired leases back to `pending`. Attempts are deliberately
    /// untouched: lease expiry means the worker died, not that the work
    /// failed.
    pub async fn recover_expired(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                lease_until = NULL,
                updated_at = NOW()
            WHERE status = 'running' AND lease_until < NOW()
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}
