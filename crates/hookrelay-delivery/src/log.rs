//! Delivery log bookkeeping.
//!
//! Each (event firing, destination) pair owns one log row. The row starts
//! pending, is updated after every attempt and keeps a sliding window of the
//! most recent attempts, oldest first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hookrelay_core::{
    models::{
        AttemptRecord, DeliveryLog, LogFilter, LogId, LogStats, LogUpdate, NewDeliveryLog, Page,
    },
    time::Clock,
};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Default number of attempts kept per log row.
pub const DEFAULT_HISTORY_CAP: usize = 5;

/// Largest page size accepted by `list`.
pub const MAX_PER_PAGE: u32 = 100;

/// Reads and writes delivery log rows.
#[derive(Clone)]
pub struct DeliveryLogService {
    store: Arc<dyn crate::storage::LogStore>,
    history_cap: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeliveryLogService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryLogService")
            .field("history_cap", &self.history_cap)
            .finish_non_exhaustive()
    }
}

impl DeliveryLogService {
    /// Creates a service keeping `history_cap` attempts per row (at least
    /// one).
    pub fn new(
        store: Arc<dyn crate::storage::LogStore>,
        history_cap: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, history_cap: history_cap.max(1), clock }
    }

    /// Attempts kept per row.
    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    /// Creates the pending row for a new delivery.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the insert fails.
    pub async fn log_pending(&self, entry: NewDeliveryLog) -> Result<LogId> {
        let log = entry.into_log(self.clock.now_utc());
        let log_id = self.store.insert_log(log).await?;
        debug!(log_id = %log_id, "pending delivery logged");
        Ok(log_id)
    }

    /// Applies a partial update. A missing row is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn update(&self, log_id: LogId, update: LogUpdate) -> Result<bool> {
        let updated = self.store.update_log(log_id, update).await?;
        if !updated {
            warn!(log_id = %log_id, "delivery log row missing on update");
        }
        Ok(updated)
    }

    /// Appends one attempt, dropping the oldest entries beyond the cap.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the update fails.
    pub async fn append_attempt_history(
        &self,
        log_id: LogId,
        record: AttemptRecord,
    ) -> Result<bool> {
        let appended = self.store.append_attempt(log_id, record, self.history_cap).await?;
        if !appended {
            warn!(log_id = %log_id, "delivery log row missing on attempt append");
        }
        Ok(appended)
    }

    /// Loads a row.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn find(&self, log_id: LogId) -> Result<Option<DeliveryLog>> {
        Ok(self.store.find_log(log_id).await?)
    }

    /// One page of rows, newest first. `page` is 1-based; `per_page` is
    /// clamped to `1..=MAX_PER_PAGE`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if a query fails.
    pub async fn list(
        &self,
        filter: &LogFilter,
        page: u32,
        per_page: u32,
    ) -> Result<Page<DeliveryLog>> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let offset = (page as usize - 1) * per_page as usize;

        let total = self.store.count_logs(filter).await?;
        let items = self.store.list_logs(filter, per_page as usize, offset).await?;

        Ok(Page::new(items, total, page, per_page))
    }

    /// Counts by status for rows created since `since`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn stats(&self, since: DateTime<Utc>) -> Result<LogStats> {
        Ok(self.store.log_stats(since).await?)
    }

    /// Deletes rows created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the delete fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_logs_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "removed old delivery logs");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_core::{
        models::{DestinationId, LogStatus},
        time::TestClock,
    };
    use serde_json::json;

    use super::*;
    use crate::storage::mock::MockStorage;

    fn service(cap: usize) -> (DeliveryLogService, MockStorage) {
        let storage = MockStorage::new();
        let service =
            DeliveryLogService::new(Arc::new(storage.clone()), cap, Arc::new(TestClock::new()));
        (service, storage)
    }

    fn pending_entry(trigger: &str) -> NewDeliveryLog {
        NewDeliveryLog {
            destination_id: DestinationId::new(),
            trigger_name: trigger.to_string(),
            request_payload: json!({"hook": trigger}),
            original_payload: None,
            mapping_applied: false,
            event: None,
        }
    }

    #[tokio::test]
    async fn pending_row_starts_empty() {
        let (service, _storage) = service(5);

        let id = service.log_pending(pending_entry("wp_login")).await.unwrap();

        let log = service.find(id).await.unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Pending);
        assert!(log.attempts().is_empty());
        assert_eq!(log.original_payload, None);
    }

    #[tokio::test]
    async fn zero_cap_is_raised_to_one() {
        let (service, _storage) = service(0);
        assert_eq!(service.history_cap(), 1);
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let (service, _storage) = service(5);
        for trigger in ["a", "b", "c"] {
            service.log_pending(pending_entry(trigger)).await.unwrap();
        }

        let page = service.list(&LogFilter::default(), 1, 2).await.unwrap();

        assert_eq!(page.total, 3);
        assert_eq!(page.pages, 2);
        assert_eq!(page.items.len(), 2);

        let second = service.list(&LogFilter::default(), 2, 2).await.unwrap();
        assert_eq!(second.items.len(), 1);
    }

    #[tokio::test]
    async fn update_of_missing_row_reports_false() {
        let (service, _storage) = service(5);

        let updated =
            service.update(LogId::new(), LogUpdate::status(LogStatus::Success)).await.unwrap();

        assert!(!updated);
    }
}
