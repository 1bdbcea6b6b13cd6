//! Storage abstraction layer for the delivery engine.
//!
//! The queue, log, transformer and dispatcher depend on these traits rather
//! than on `hookrelay_core::storage::Storage` directly. `PostgresStore`
//! forwards to the repositories; `mock::MockStorage` keeps everything in
//! memory so delivery logic can be tested without a database.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    error::Result,
    models::{
        AttemptRecord, DeliveryLog, Destination, DestinationId, JobFilter, JobId, JobStatus,
        LogFilter, LogId, LogStats, LogUpdate, QueueJob, QueueStats, TriggerSchema,
    },
    storage::Storage,
};
use serde_json::Value;

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable queue operations.
///
/// Boolean results report whether a row was affected, so callers can tell
/// a lost race or a vanished job from success.
pub trait QueueStore: Send + Sync + 'static {
    /// Persists a new job.
    fn insert_job(&self, job: QueueJob) -> StorageFuture<'_, JobId>;

    /// Loads a job.
    fn find_job(&self, id: JobId) -> StorageFuture<'_, Option<QueueJob>>;

    /// Pending, unlocked jobs with `scheduled_at <= now`, oldest schedule
    /// first.
    fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StorageFuture<'_, Vec<QueueJob>>;

    /// Single conditional write: locks the job only if it is unlocked and
    /// not processing or completed.
    fn try_lock_job(
        &self,
        id: JobId,
        token: &str,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Sets `status` and clears the lock.
    fn release_job(&self, id: JobId, status: JobStatus) -> StorageFuture<'_, bool>;

    /// Overwrites the attempt counter.
    fn set_job_attempts(&self, id: JobId, attempts: i32) -> StorageFuture<'_, bool>;

    /// Returns the job to pending with new attempts and a later schedule.
    fn reschedule_job(
        &self,
        id: JobId,
        attempts: i32,
        scheduled_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Unlocks processing jobs locked before `threshold`.
    fn reset_stale_jobs(&self, threshold: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Resets a failed or permanently failed job.
    fn force_retry_job(&self, id: JobId, now: DateTime<Utc>) -> StorageFuture<'_, bool>;

    /// Deletes a job unless it is processing.
    fn delete_job(&self, id: JobId) -> StorageFuture<'_, bool>;

    /// Deletes completed jobs created before `cutoff`.
    fn delete_completed_jobs(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Lists jobs, newest schedule first.
    fn list_jobs(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> StorageFuture<'_, Vec<QueueJob>>;

    /// Counts jobs.
    fn count_jobs(&self, filter: &JobFilter) -> StorageFuture<'_, i64>;

    /// Per-status counts.
    fn job_stats(&self, now: DateTime<Utc>) -> StorageFuture<'_, QueueStats>;
}

/// Delivery log operations.
pub trait LogStore: Send + Sync + 'static {
    /// Persists a new log row.
    fn insert_log(&self, log: DeliveryLog) -> StorageFuture<'_, LogId>;

    /// Loads a log row.
    fn find_log(&self, id: LogId) -> StorageFuture<'_, Option<DeliveryLog>>;

    /// Applies a partial update.
    fn update_log(&self, id: LogId, update: LogUpdate) -> StorageFuture<'_, bool>;

    /// Appends one attempt and trims the history to the newest `cap`.
    fn append_attempt(
        &self,
        id: LogId,
        record: AttemptRecord,
        cap: usize,
    ) -> StorageFuture<'_, bool>;

    /// Lists rows, newest first.
    fn list_logs(
        &self,
        filter: &LogFilter,
        limit: usize,
        offset: usize,
    ) -> StorageFuture<'_, Vec<DeliveryLog>>;

    /// Counts rows.
    fn count_logs(&self, filter: &LogFilter) -> StorageFuture<'_, i64>;

    /// Per-status counts for rows created since `since`.
    fn log_stats(&self, since: DateTime<Utc>) -> StorageFuture<'_, LogStats>;

    /// Deletes rows created before `cutoff`.
    fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64>;
}

/// Trigger schema lookups for the payload transformer.
pub trait SchemaStore: Send + Sync + 'static {
    /// Loads the schema for (destination, trigger).
    fn find_schema(
        &self,
        destination_id: DestinationId,
        trigger_name: &str,
    ) -> StorageFuture<'_, Option<TriggerSchema>>;

    /// Stores `example` unless one was already captured. Creates the schema
    /// when missing.
    fn capture_example(
        &self,
        destination_id: DestinationId,
        trigger_name: &str,
        example: Value,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Creates or replaces a schema's mapping and enrichment settings.
    fn save_schema(&self, schema: TriggerSchema) -> StorageFuture<'_, ()>;
}

/// Destination lookups at dispatch time.
pub trait DestinationDirectory: Send + Sync + 'static {
    /// Every destination subscribed to `trigger_name`, enabled or not.
    fn find_by_trigger(&self, trigger_name: &str) -> StorageFuture<'_, Vec<Destination>>;
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// PostgreSQL implementation of every storage trait.
///
/// Wraps the concrete `hookrelay_core::storage::Storage` repositories.
#[derive(Clone)]
pub struct PostgresStore {
    storage: Arc<Storage>,
}

impl PostgresStore {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStore for PostgresStore {
    fn insert_job(&self, job: QueueJob) -> StorageFuture<'_, JobId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.insert(&job).await })
    }

    fn find_job(&self, id: JobId) -> StorageFuture<'_, Option<QueueJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.find_by_id(id).await })
    }

    fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StorageFuture<'_, Vec<QueueJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.find_due(now, to_i64(limit)).await })
    }

    fn try_lock_job(
        &self,
        id: JobId,
        token: &str,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        let token = token.to_string();
        Box::pin(async move { storage.queue_jobs.try_lock(id, &token, now).await })
    }

    fn release_job(&self, id: JobId, status: JobStatus) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.release(id, status).await })
    }

    fn set_job_attempts(&self, id: JobId, attempts: i32) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.set_attempts(id, attempts).await })
    }

    fn reschedule_job(
        &self,
        id: JobId,
        attempts: i32,
        scheduled_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.reschedule(id, attempts, scheduled_at).await })
    }

    fn reset_stale_jobs(&self, threshold: DateTime<Utc>) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.reset_stale(threshold).await })
    }

    fn force_retry_job(&self, id: JobId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.force_retry(id, now).await })
    }

    fn delete_job(&self, id: JobId) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.delete_unless_processing(id).await })
    }

    fn delete_completed_jobs(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.delete_completed_before(cutoff).await })
    }

    fn list_jobs(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> StorageFuture<'_, Vec<QueueJob>> {
        let storage = self.storage.clone();
        let filter = filter.clone();
        Box::pin(async move {
            storage.queue_jobs.list(&filter, to_i64(limit), to_i64(offset)).await
        })
    }

    fn count_jobs(&self, filter: &JobFilter) -> StorageFuture<'_, i64> {
        let storage = self.storage.clone();
        let filter = filter.clone();
        Box::pin(async move { storage.queue_jobs.count(&filter).await })
    }

    fn job_stats(&self, now: DateTime<Utc>) -> StorageFuture<'_, QueueStats> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue_jobs.stats(now).await })
    }
}

impl LogStore for PostgresStore {
    fn insert_log(&self, log: DeliveryLog) -> StorageFuture<'_, LogId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_logs.insert(&log).await })
    }

    fn find_log(&self, id: LogId) -> StorageFuture<'_, Option<DeliveryLog>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_logs.find_by_id(id).await })
    }

    fn update_log(&self, id: LogId, update: LogUpdate) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_logs.update(id, &update).await })
    }

    fn append_attempt(
        &self,
        id: LogId,
        record: AttemptRecord,
        cap: usize,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(
            async move { storage.delivery_logs.append_attempt(id, &record, to_i64(cap)).await },
        )
    }

    fn list_logs(
        &self,
        filter: &LogFilter,
        limit: usize,
        offset: usize,
    ) -> StorageFuture<'_, Vec<DeliveryLog>> {
        let storage = self.storage.clone();
        let filter = filter.clone();
        Box::pin(async move {
            storage.delivery_logs.list(&filter, to_i64(limit), to_i64(offset)).await
        })
    }

    fn count_logs(&self, filter: &LogFilter) -> StorageFuture<'_, i64> {
        let storage = self.storage.clone();
        let filter = filter.clone();
        Box::pin(async move { storage.delivery_logs.count(&filter).await })
    }

    fn log_stats(&self, since: DateTime<Utc>) -> StorageFuture<'_, LogStats> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_logs.stats(since).await })
    }

    fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_logs.delete_before(cutoff).await })
    }
}

impl SchemaStore for PostgresStore {
    fn find_schema(
        &self,
        destination_id: DestinationId,
        trigger_name: &str,
    ) -> StorageFuture<'_, Option<TriggerSchema>> {
        let storage = self.storage.clone();
        let trigger_name = trigger_name.to_string();
        Box::pin(async move { storage.trigger_schemas.find(destination_id, &trigger_name).await })
    }

    fn capture_example(
        &self,
        destination_id: DestinationId,
        trigger_name: &str,
        example: Value,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        let trigger_name = trigger_name.to_string();
        Box::pin(async move {
            storage
                .trigger_schemas
                .capture_example(destination_id, &trigger_name, &example, now)
                .await
        })
    }

    fn save_schema(&self, schema: TriggerSchema) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.trigger_schemas.save(&schema).await })
    }
}

impl DestinationDirectory for PostgresStore {
    fn find_by_trigger(&self, trigger_name: &str) -> StorageFuture<'_, Vec<Destination>> {
        let storage = self.storage.clone();
        let trigger_name = trigger_name.to_string();
        Box::pin(async move { storage.destinations.find_by_trigger(&trigger_name).await })
    }
}

/// In-memory storage for tests.
pub mod mock {
    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use hookrelay_core::{
        error::{CoreError, Result},
        models::{
            AttemptRecord, DeliveryLog, Destination, DestinationId, JobFilter, JobId, JobStatus,
            LogFilter, LogId, LogStats, LogUpdate, QueueJob, QueueStats, TriggerSchema,
        },
    };
    use serde_json::Value;
    use sqlx::types::Json;
    use tokio::sync::RwLock;

    use super::{DestinationDirectory, LogStore, QueueStore, SchemaStore, StorageFuture};

    #[derive(Debug, Default)]
    struct MockState {
        jobs: HashMap<JobId, QueueJob>,
        logs: HashMap<LogId, DeliveryLog>,
        schemas: HashMap<(DestinationId, String), TriggerSchema>,
        destinations: Vec<Destination>,
        fail_next_claim: Option<String>,
    }

    /// Mock storage backing every storage trait with one in-memory state.
    ///
    /// All writes happen under a single write guard, so conditional updates
    /// such as `try_lock_job` are atomic exactly like the SQL versions.
    /// Clones share state.
    #[derive(Debug, Clone, Default)]
    pub struct MockStorage {
        state: Arc<RwLock<MockState>>,
    }

    impl MockStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a destination.
        pub async fn add_destination(&self, destination: Destination) {
            self.state.write().await.destinations.push(destination);
        }

        /// Stores a schema, replacing any existing one.
        pub async fn add_schema(&self, schema: TriggerSchema) {
            let key = (schema.destination_id, schema.trigger_name.clone());
            self.state.write().await.schemas.insert(key, schema);
        }

        /// Stores a job verbatim, bypassing queue rules.
        pub async fn put_job(&self, job: QueueJob) {
            self.state.write().await.jobs.insert(job.id, job);
        }

        /// Returns a job.
        pub async fn job(&self, id: JobId) -> Option<QueueJob> {
            self.state.read().await.jobs.get(&id).cloned()
        }

        /// Returns every job ordered by creation time.
        pub async fn jobs(&self) -> Vec<QueueJob> {
            let mut jobs: Vec<QueueJob> = self.state.read().await.jobs.values().cloned().collect();
            jobs.sort_by_key(|job| (job.created_at, job.id));
            jobs
        }

        /// Returns a log row.
        pub async fn log(&self, id: LogId) -> Option<DeliveryLog> {
            self.state.read().await.logs.get(&id).cloned()
        }

        /// Returns every log row ordered by creation time.
        pub async fn logs(&self) -> Vec<DeliveryLog> {
            let mut logs: Vec<DeliveryLog> =
                self.state.read().await.logs.values().cloned().collect();
            logs.sort_by_key(|log| (log.created_at, log.id));
            logs
        }

        /// Returns the schema for (destination, trigger).
        pub async fn schema(
            &self,
            destination_id: DestinationId,
            trigger_name: &str,
        ) -> Option<TriggerSchema> {
            self.state
                .read()
                .await
                .schemas
                .get(&(destination_id, trigger_name.to_string()))
                .cloned()
        }

        /// Makes the next `find_due_jobs` call fail with a database error.
        pub async fn inject_claim_error(&self, message: impl Into<String>) {
            self.state.write().await.fail_next_claim = Some(message.into());
        }
    }

    fn clear_lock(job: &mut QueueJob) {
        job.locked_at = None;
        job.locked_by = None;
    }

    impl QueueStore for MockStorage {
        fn insert_job(&self, job: QueueJob) -> StorageFuture<'_, JobId> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                if state.jobs.contains_key(&job.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "job {} already exists",
                        job.id
                    )));
                }
                let id = job.id;
                state.jobs.insert(id, job);
                Ok(id)
            })
        }

        fn find_job(&self, id: JobId) -> StorageFuture<'_, Option<QueueJob>> {
            let state = self.state.clone();
            Box::pin(async move { Ok(state.read().await.jobs.get(&id).cloned()) })
        }

        fn find_due_jobs(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<QueueJob>> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                if let Some(message) = state.fail_next_claim.take() {
                    return Err(CoreError::Database(message));
                }

                let mut due: Vec<QueueJob> =
                    state.jobs.values().filter(|job| job.is_due(now)).cloned().collect();
                due.sort_by_key(|job| (job.scheduled_at, job.created_at, job.id));
                due.truncate(limit);
                Ok(due)
            })
        }

        fn try_lock_job(
            &self,
            id: JobId,
            token: &str,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            let token = token.to_string();
            Box::pin(async move {
                let mut state = state.write().await;
                let Some(job) = state.jobs.get_mut(&id) else {
                    return Ok(false);
                };
                let lockable = matches!(
                    job.status,
                    JobStatus::Pending | JobStatus::Failed | JobStatus::PermanentlyFailed
                );
                if !lockable || job.locked_at.is_some() {
                    return Ok(false);
                }
                job.status = JobStatus::Processing;
                job.locked_at = Some(now);
                job.locked_by = Some(token);
                Ok(true)
            })
        }

        fn release_job(&self, id: JobId, status: JobStatus) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let Some(job) = state.jobs.get_mut(&id) else {
                    return Ok(false);
                };
                job.status = status;
                clear_lock(job);
                Ok(true)
            })
        }

        fn set_job_attempts(&self, id: JobId, attempts: i32) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let Some(job) = state.jobs.get_mut(&id) else {
                    return Ok(false);
                };
                job.attempts = attempts;
                Ok(true)
            })
        }

        fn reschedule_job(
            &self,
            id: JobId,
            attempts: i32,
            scheduled_at: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let Some(job) = state.jobs.get_mut(&id) else {
                    return Ok(false);
                };
                job.status = JobStatus::Pending;
                job.attempts = attempts;
                job.scheduled_at = job.scheduled_at.max(scheduled_at);
                clear_lock(job);
                Ok(true)
            })
        }

        fn reset_stale_jobs(&self, threshold: DateTime<Utc>) -> StorageFuture<'_, u64> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let mut reset = 0;
                for job in state.jobs.values_mut() {
                    let stale = job.status == JobStatus::Processing
                        && job.locked_at.is_some_and(|locked_at| locked_at < threshold);
                    if stale {
                        job.status = JobStatus::Pending;
                        clear_lock(job);
                        reset += 1;
                    }
                }
                Ok(reset)
            })
        }

        fn force_retry_job(&self, id: JobId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let Some(job) = state.jobs.get_mut(&id) else {
                    return Ok(false);
                };
                if !job.status.is_retryable_by_operator() {
                    return Ok(false);
                }
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.scheduled_at = now;
                clear_lock(job);
                Ok(true)
            })
        }

        fn delete_job(&self, id: JobId) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let deletable =
                    state.jobs.get(&id).is_some_and(|job| job.status != JobStatus::Processing);
                if deletable {
                    state.jobs.remove(&id);
                }
                Ok(deletable)
            })
        }

        fn delete_completed_jobs(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let before = state.jobs.len();
                state.jobs.retain(|_, job| {
                    !(job.status == JobStatus::Completed && job.created_at < cutoff)
                });
                Ok((before - state.jobs.len()) as u64)
            })
        }

        fn list_jobs(
            &self,
            filter: &JobFilter,
            limit: usize,
            offset: usize,
        ) -> StorageFuture<'_, Vec<QueueJob>> {
            let state = self.state.clone();
            let filter = filter.clone();
            Box::pin(async move {
                let state = state.read().await;
                let mut jobs: Vec<QueueJob> =
                    state.jobs.values().filter(|job| filter.matches(job)).cloned().collect();
                jobs.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at).then(a.id.cmp(&b.id)));
                Ok(jobs.into_iter().skip(offset).take(limit).collect())
            })
        }

        fn count_jobs(&self, filter: &JobFilter) -> StorageFuture<'_, i64> {
            let state = self.state.clone();
            let filter = filter.clone();
            Box::pin(async move {
                let state = state.read().await;
                let count = state.jobs.values().filter(|job| filter.matches(job)).count();
                Ok(i64::try_from(count).unwrap_or(i64::MAX))
            })
        }

        fn job_stats(&self, now: DateTime<Utc>) -> StorageFuture<'_, QueueStats> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                let mut stats = QueueStats::default();
                for job in state.jobs.values() {
                    stats.total += 1;
                    match job.status {
                        JobStatus::Pending => {
                            stats.pending += 1;
                            stats.oldest_pending_scheduled_at = Some(
                                stats.oldest_pending_scheduled_at.map_or(
                                    job.scheduled_at,
                                    |oldest| oldest.min(job.scheduled_at),
                                ),
                            );
                            if job.is_due(now) {
                                stats.due_now += 1;
                            }
                        },
                        JobStatus::Processing => stats.processing += 1,
                        JobStatus::Completed => stats.completed += 1,
                        JobStatus::Failed => stats.failed += 1,
                        JobStatus::PermanentlyFailed => stats.permanently_failed += 1,
                    }
                }
                Ok(stats)
            })
        }
    }

    impl LogStore for MockStorage {
        fn insert_log(&self, log: DeliveryLog) -> StorageFuture<'_, LogId> {
            let state = self.state.clone();
            Box::pin(async move {
                let id = log.id;
                state.write().await.logs.insert(id, log);
                Ok(id)
            })
        }

        fn find_log(&self, id: LogId) -> StorageFuture<'_, Option<DeliveryLog>> {
            let state = self.state.clone();
            Box::pin(async move { Ok(state.read().await.logs.get(&id).cloned()) })
        }

        fn update_log(&self, id: LogId, update: LogUpdate) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let Some(log) = state.logs.get_mut(&id) else {
                    return Ok(false);
                };
                update.apply_to(log);
                Ok(true)
            })
        }

        fn append_attempt(
            &self,
            id: LogId,
            record: AttemptRecord,
            cap: usize,
        ) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let Some(log) = state.logs.get_mut(&id) else {
                    return Ok(false);
                };
                let history = &mut log.attempt_history.0;
                history.push(record);
                let overflow = history.len().saturating_sub(cap);
                history.drain(..overflow);
                Ok(true)
            })
        }

        fn list_logs(
            &self,
            filter: &LogFilter,
            limit: usize,
            offset: usize,
        ) -> StorageFuture<'_, Vec<DeliveryLog>> {
            let state = self.state.clone();
            let filter = filter.clone();
            Box::pin(async move {
                let state = state.read().await;
                let mut logs: Vec<DeliveryLog> =
                    state.logs.values().filter(|log| filter.matches(log)).cloned().collect();
                logs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
                Ok(logs.into_iter().skip(offset).take(limit).collect())
            })
        }

        fn count_logs(&self, filter: &LogFilter) -> StorageFuture<'_, i64> {
            let state = self.state.clone();
            let filter = filter.clone();
            Box::pin(async move {
                let state = state.read().await;
                let count = state.logs.values().filter(|log| filter.matches(log)).count();
                Ok(i64::try_from(count).unwrap_or(i64::MAX))
            })
        }

        fn log_stats(&self, since: DateTime<Utc>) -> StorageFuture<'_, LogStats> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                let mut stats = LogStats::default();
                for log in state.logs.values().filter(|log| log.created_at >= since) {
                    stats.record(log.status);
                }
                Ok(stats)
            })
        }

        fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let before = state.logs.len();
                state.logs.retain(|_, log| log.created_at >= cutoff);
                Ok((before - state.logs.len()) as u64)
            })
        }
    }

    impl SchemaStore for MockStorage {
        fn find_schema(
            &self,
            destination_id: DestinationId,
            trigger_name: &str,
        ) -> StorageFuture<'_, Option<TriggerSchema>> {
            let state = self.state.clone();
            let key = (destination_id, trigger_name.to_string());
            Box::pin(async move { Ok(state.read().await.schemas.get(&key).cloned()) })
        }

        fn capture_example(
            &self,
            destination_id: DestinationId,
            trigger_name: &str,
            example: Value,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            let trigger_name = trigger_name.to_string();
            Box::pin(async move {
                let mut state = state.write().await;
                let schema = state
                    .schemas
                    .entry((destination_id, trigger_name.clone()))
                    .or_insert_with(|| TriggerSchema::new(destination_id, trigger_name, now));
                if schema.example_payload.is_some() {
                    return Ok(false);
                }
                schema.example_payload = Some(Json(example));
                schema.updated_at = now;
                Ok(true)
            })
        }

        fn save_schema(&self, schema: TriggerSchema) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let key = (schema.destination_id, schema.trigger_name.clone());
                let example = state.schemas.get(&key).and_then(|s| s.example_payload.clone());
                let mut schema = schema;
                if example.is_some() {
                    schema.example_payload = example;
                }
                state.schemas.insert(key, schema);
                Ok(())
            })
        }
    }

    impl DestinationDirectory for MockStorage {
        fn find_by_trigger(&self, trigger_name: &str) -> StorageFuture<'_, Vec<Destination>> {
            let state = self.state.clone();
            let trigger_name = trigger_name.to_string();
            Box::pin(async move {
                Ok(state
                    .read()
                    .await
                    .destinations
                    .iter()
                    .filter(|destination| destination.subscribes_to(&trigger_name))
                    .cloned()
                    .collect())
            })
        }
    }

}
