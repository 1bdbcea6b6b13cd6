//! Repository for queue job operations.
//!
//! Locking is a single conditional `UPDATE` guarded by `locked_at IS NULL`.
//! Two workers racing for the same row both issue it; Postgres serializes the
//! row update and exactly one of them sees `rows_affected() == 1`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{JobFilter, JobId, JobStatus, QueueJob, QueueStats},
};

const JOB_COLUMNS: &str = "id, destination_id, trigger_name, envelope, status, attempts, \
     max_attempts, locked_at, locked_by, scheduled_at, log_id, created_at";

/// Repository for queue job database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new job.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert(&self, job: &QueueJob) -> Result<JobId> {
        let id: uuid::Uuid = sqlx::query_scalar(
            r"
            INSERT INTO queue_jobs (
                id, destination_id, trigger_name, envelope, status, attempts,
                max_attempts, locked_at, locked_by, scheduled_at, log_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            ",
        )
        .bind(job.id.0)
        .bind(job.destination_id.0)
        .bind(&job.trigger_name)
        .bind(&job.envelope)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.locked_at)
        .bind(&job.locked_by)
        .bind(job.scheduled_at)
        .bind(job.log_id.map(|id| id.0))
        .bind(job.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(JobId(id))
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: JobId) -> Result<Option<QueueJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1");
        let job = sqlx::query_as::<_, QueueJob>(&sql)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(job)
    }

    /// Returns pending, unlocked jobs due at `now`, oldest schedule first.
    ///
    /// Candidates are not locked here. Callers must win `try_lock` before
    /// touching a job.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<QueueJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs \
             WHERE status = 'pending' AND locked_at IS NULL AND scheduled_at <= $1 \
             ORDER BY scheduled_at ASC, created_at ASC \
             LIMIT $2"
        );
        let jobs = sqlx::query_as::<_, QueueJob>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(jobs)
    }

    /// Atomically locks an unlocked job and marks it processing.
    ///
    /// Completed jobs are never locked. Failed jobs can be, so an operator
    /// may run them by hand. Returns `true` only for the caller whose update
    /// touched the row.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn try_lock(&self, id: JobId, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = 'processing', locked_at = $2, locked_by = $3
            WHERE id = $1 AND locked_at IS NULL
              AND status IN ('pending', 'failed', 'permanently_failed')
            ",
        )
        .bind(id.0)
        .bind(now)
        .bind(token)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Sets the status and clears the lock.
    ///
    /// Returns `false` when the job no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(&self, id: JobId, status: JobStatus) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = $2, locked_at = NULL, locked_by = NULL
            WHERE id = $1
            ",
        )
        .bind(id.0)
        .bind(status)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Overwrites the attempt counter.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn set_attempts(&self, id: JobId, attempts: i32) -> Result<bool> {
        let result = sqlx::query("UPDATE queue_jobs SET attempts = $2 WHERE id = $1")
            .bind(id.0)
            .bind(attempts)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns a job to pending with a new attempt count and schedule.
    ///
    /// The schedule never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reschedule(
        &self,
        id: JobId,
        attempts: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = 'pending',
                attempts = $2,
                scheduled_at = GREATEST(scheduled_at, $3),
                locked_at = NULL,
                locked_by = NULL
            WHERE id = $1
            ",
        )
        .bind(id.0)
        .bind(attempts)
        .bind(scheduled_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns processing jobs locked before `threshold` to pending.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reset_stale(&self, threshold: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = 'pending', locked_at = NULL, locked_by = NULL
            WHERE status = 'processing' AND locked_at < $1
            ",
        )
        .bind(threshold)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Resets a failed job so it is claimable at `now` with a fresh budget.
    ///
    /// Returns `false` when the job is missing or not in a failed state.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn force_retry(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = 'pending', attempts = 0, scheduled_at = $2,
                locked_at = NULL, locked_by = NULL
            WHERE id = $1 AND status IN ('failed', 'permanently_failed')
            ",
        )
        .bind(id.0)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes a job unless a worker is processing it.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_unless_processing(&self, id: JobId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM queue_jobs WHERE id = $1 AND status <> 'processing'")
                .bind(id.0)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes completed jobs created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM queue_jobs WHERE status = 'completed' AND created_at < $1")
                .bind(cutoff)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Lists jobs matching `filter`, newest schedule first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<QueueJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::uuid IS NULL OR destination_id = $2) \
               AND ($3::text IS NULL OR trigger_name = $3) \
             ORDER BY scheduled_at DESC \
             LIMIT $4 OFFSET $5"
        );
        let jobs = sqlx::query_as::<_, QueueJob>(&sql)
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.destination_id.map(|id| id.0))
            .bind(filter.trigger_name.as_deref())
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.pool)
            .await?;

        Ok(jobs)
    }

    /// Counts jobs matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count(&self, filter: &JobFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM queue_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR destination_id = $2)
              AND ($3::text IS NULL OR trigger_name = $3)
            ",
        )
        .bind(filter.status.map(JobStatus::as_str))
        .bind(filter.destination_id.map(|id| id.0))
        .bind(filter.trigger_name.as_deref())
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Counts jobs per status.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let stats = sqlx::query_as::<_, QueueStats>(
            r"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'permanently_failed') AS permanently_failed,
                COUNT(*) AS total,
                MIN(scheduled_at) FILTER (WHERE status = 'pending') AS oldest_pending_scheduled_at,
                COUNT(*) FILTER (
                    WHERE status = 'pending' AND locked_at IS NULL AND scheduled_at <= $1
                ) AS due_now
            FROM queue_jobs
            ",
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(stats)
    }
}
