//! Durable delivery job queue.
//!
//! Jobs move `pending -> processing` only through `lock`, a single
//! conditional write at the storage layer. A worker that loses the race gets
//! `false` and must skip the job. Locks older than the stale timeout are
//! reclaimed by `cleanup_stale`, which makes delivery at-least-once: a slow
//! worker can have its job taken over and delivered a second time.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    models::{DestinationId, JobFilter, JobId, JobStatus, LogId, QueueJob, QueueStats},
    time::Clock,
};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    retry::{BackoffPolicy, RetryDecision},
    storage::QueueStore,
};

/// Default attempt budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Attempt budget stamped on new jobs.
    pub max_attempts: i32,
    /// Delay schedule for rescheduled jobs.
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, backoff: BackoffPolicy::default() }
    }
}

/// Result of `reschedule_with_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Job is pending again and due at `scheduled_at`.
    Rescheduled {
        /// Failed attempts recorded so far.
        attempts: u32,
        /// Next eligible time.
        scheduled_at: DateTime<Utc>,
    },
    /// Attempt budget spent. The caller must mark the job permanently
    /// failed.
    Exhausted {
        /// Failed attempts recorded so far.
        attempts: u32,
    },
}

impl RescheduleOutcome {
    /// Whether the job was put back in the queue.
    pub fn is_rescheduled(&self) -> bool {
        matches!(self, Self::Rescheduled { .. })
    }

    /// Failed attempts recorded after this reschedule.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Rescheduled { attempts, .. } | Self::Exhausted { attempts } => *attempts,
        }
    }

    /// New schedule, if rescheduled.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Rescheduled { scheduled_at, .. } => Some(*scheduled_at),
            Self::Exhausted { .. } => None,
        }
    }
}

/// Queue of delivery jobs over a `QueueStore`.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("config", &self.config).finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Creates a queue.
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    /// Active configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds a pending job. `scheduled_at` defaults to now.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the insert fails.
    pub async fn enqueue(
        &self,
        destination_id: DestinationId,
        trigger_name: &str,
        envelope: String,
        scheduled_at: Option<DateTime<Utc>>,
        log_id: Option<LogId>,
    ) -> Result<JobId> {
        let now = self.clock.now_utc();
        let job = QueueJob::new(
            destination_id,
            trigger_name,
            envelope,
            self.config.max_attempts,
            scheduled_at.unwrap_or(now),
            log_id,
            now,
        );

        let job_id = self.store.insert_job(job).await?;
        debug!(
            job_id = %job_id,
            destination_id = %destination_id,
            trigger = trigger_name,
            "job enqueued"
        );

        Ok(job_id)
    }

    /// Due jobs, oldest schedule first. Not locked.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueJob>> {
        Ok(self.store.find_due_jobs(self.clock.now_utc(), limit).await?)
    }

    /// Takes exclusive ownership of a job. `false` means another worker won.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn lock(&self, job_id: JobId, token: &str) -> Result<bool> {
        let locked = self.store.try_lock_job(job_id, token, self.clock.now_utc()).await?;
        if !locked {
            debug!(job_id = %job_id, "lock not acquired");
        }
        Ok(locked)
    }

    /// Marks a job delivered and clears its lock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn mark_completed(&self, job_id: JobId) -> Result<bool> {
        Ok(self.store.release_job(job_id, JobStatus::Completed).await?)
    }

    /// Marks a job failed for operator attention and clears its lock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn mark_failed(&self, job_id: JobId) -> Result<bool> {
        Ok(self.store.release_job(job_id, JobStatus::Failed).await?)
    }

    /// Marks a job as never to be retried and clears its lock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn mark_permanently_failed(&self, job_id: JobId) -> Result<bool> {
        Ok(self.store.release_job(job_id, JobStatus::PermanentlyFailed).await?)
    }

    /// Returns a locked job to pending without consuming an attempt.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn unlock(&self, job_id: JobId) -> Result<bool> {
        Ok(self.store.release_job(job_id, JobStatus::Pending).await?)
    }

    /// Records one failed attempt and either reschedules the job with
    /// backoff or reports the budget as spent.
    ///
    /// The incremented attempt count is persisted in both cases.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::JobNotFound` if the job does not exist and
    /// `DeliveryError::DatabaseError` if storage fails.
    pub async fn reschedule_with_backoff(&self, job_id: JobId) -> Result<RescheduleOutcome> {
        let job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or_else(|| DeliveryError::JobNotFound { job_id: job_id.to_string() })?;

        let attempts = job.attempts.saturating_add(1);
        let attempts_u32 = u32::try_from(attempts).unwrap_or(0);
        let max_attempts = u32::try_from(job.max_attempts).unwrap_or(0);
        let now = self.clock.now_utc();

        match self.config.backoff.decide(attempts_u32, max_attempts, now) {
            RetryDecision::Retry { next_attempt_at } => {
                self.store.reschedule_job(job_id, attempts, next_attempt_at).await?;
                debug!(
                    job_id = %job_id,
                    attempts,
                    scheduled_at = %next_attempt_at,
                    "job rescheduled with backoff"
                );
                Ok(RescheduleOutcome::Rescheduled {
                    attempts: attempts_u32,
                    scheduled_at: next_attempt_at.max(job.scheduled_at),
                })
            },
            RetryDecision::GiveUp { reason } => {
                self.store.set_job_attempts(job_id, attempts).await?;
                debug!(job_id = %job_id, attempts, reason = %reason, "retry budget spent");
                Ok(RescheduleOutcome::Exhausted { attempts: attempts_u32 })
            },
        }
    }

    /// Reclaims processing jobs whose lock is older than `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn cleanup_stale(&self, timeout: Duration) -> Result<u64> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| DeliveryError::configuration(format!("stale timeout out of range: {e}")))?;
        let threshold = self.clock.now_utc() - timeout;

        let reclaimed = self.store.reset_stale_jobs(threshold).await?;
        if reclaimed > 0 {
            warn!(reclaimed, threshold = %threshold, "reclaimed stale job locks");
        }

        Ok(reclaimed)
    }

    /// Puts a failed or permanently failed job back in the queue, due now,
    /// with a fresh attempt budget. `false` if the job is in any other state.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn force_retry(&self, job_id: JobId) -> Result<bool> {
        let retried = self.store.force_retry_job(job_id, self.clock.now_utc()).await?;
        if retried {
            info!(job_id = %job_id, "job forced back into the queue");
        }
        Ok(retried)
    }

    /// Loads a job.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn find(&self, job_id: JobId) -> Result<Option<QueueJob>> {
        Ok(self.store.find_job(job_id).await?)
    }

    /// Deletes a job. `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidJobState` while the job is processing.
    pub async fn delete(&self, job_id: JobId) -> Result<bool> {
        let Some(job) = self.store.find_job(job_id).await? else {
            return Ok(false);
        };
        if job.status == JobStatus::Processing {
            return Err(DeliveryError::InvalidJobState {
                job_id: job_id.to_string(),
                status: job.status.to_string(),
            });
        }

        Ok(self.store.delete_job(job_id).await?)
    }

    /// Lists jobs, newest schedule first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<QueueJob>> {
        Ok(self.store.list_jobs(filter, limit, offset).await?)
    }

    /// Counts jobs.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn count(&self, filter: &JobFilter) -> Result<i64> {
        Ok(self.store.count_jobs(filter).await?)
    }

    /// Deletes completed jobs created more than `older_than_days` ago.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the delete fails.
    pub async fn cleanup_completed(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = self.clock.now_utc() - chrono::Duration::days(i64::from(older_than_days));
        let deleted = self.store.delete_completed_jobs(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "removed completed jobs");
        }
        Ok(deleted)
    }

    /// Counts by status plus the oldest pending schedule and the due backlog.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.job_stats(self.clock.now_utc()).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use hookrelay_core::time::TestClock;

    use super::*;
    use crate::storage::mock::MockStorage;

    fn queue() -> (JobQueue, MockStorage, TestClock) {
        let storage = MockStorage::new();
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let queue = JobQueue::new(
            Arc::new(storage.clone()),
            QueueConfig::default(),
            Arc::new(clock.clone()),
        );
        (queue, storage, clock)
    }

    #[tokio::test]
    async fn enqueue_defaults_to_now_and_configured_budget() {
        let (queue, storage, clock) = queue();

        let id =
            queue.enqueue(DestinationId::new(), "wp_login", "{}".into(), None, None).await.unwrap();

        let job = storage.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.scheduled_at, clock.now_utc());
        assert!(!job.is_locked());
    }

    #[tokio::test]
    async fn rescheduled_outcome_exposes_schedule() {
        let (queue, _storage, clock) = queue();
        let id =
            queue.enqueue(DestinationId::new(), "wp_login", "{}".into(), None, None).await.unwrap();

        let outcome = queue.reschedule_with_backoff(id).await.unwrap();

        assert!(outcome.is_rescheduled());
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.scheduled_at(), Some(clock.now_utc() + chrono::Duration::seconds(30)));
    }

    #[tokio::test]
    async fn reschedule_of_missing_job_is_an_error() {
        let (queue, _storage, _clock) = queue();

        let result = queue.reschedule_with_backoff(JobId::new()).await;

        assert!(matches!(result, Err(DeliveryError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn delete_refuses_processing_jobs() {
        let (queue, _storage, _clock) = queue();
        let id =
            queue.enqueue(DestinationId::new(), "wp_login", "{}".into(), None, None).await.unwrap();
        assert!(queue.lock(id, "worker").await.unwrap());

        assert!(matches!(queue.delete(id).await, Err(DeliveryError::InvalidJobState { .. })));

        queue.mark_completed(id).await.unwrap();
        assert!(queue.delete(id).await.unwrap());
        assert!(!queue.delete(id).await.unwrap());
    }
}
