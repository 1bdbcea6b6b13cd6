//! Repository for delivery log operations.
//!
//! One row per (event firing, destination). The row is created pending at
//! dispatch time and updated after every attempt. `attempt_history` is a
//! JSONB array trimmed in the same statement that appends to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use crate::{
    error::Result,
    models::{AttemptRecord, DeliveryLog, LogFilter, LogId, LogStats, LogStatus, LogUpdate},
};

const LOG_COLUMNS: &str = "id, destination_id, trigger_name, status, http_code, \
     request_payload, original_payload, mapping_applied, response_body, error_message, \
     duration_ms, event_uuid, event_timestamp, attempt_history, next_attempt_at, created_at";

/// Repository for delivery log database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a log row.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert(&self, log: &DeliveryLog) -> Result<LogId> {
        let id: uuid::Uuid = sqlx::query_scalar(
            r"
            INSERT INTO delivery_logs (
                id, destination_id, trigger_name, status, http_code,
                request_payload, original_payload, mapping_applied,
                response_body, error_message, duration_ms,
                event_uuid, event_timestamp, attempt_history, next_attempt_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            ",
        )
        .bind(log.id.0)
        .bind(log.destination_id.0)
        .bind(&log.trigger_name)
        .bind(log.status)
        .bind(log.http_code)
        .bind(&log.request_payload)
        .bind(&log.original_payload)
        .bind(log.mapping_applied)
        .bind(&log.response_body)
        .bind(&log.error_message)
        .bind(log.duration_ms)
        .bind(log.event_uuid)
        .bind(log.event_timestamp)
        .bind(&log.attempt_history)
        .bind(log.next_attempt_at)
        .bind(log.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(LogId(id))
    }

    /// Finds a log row by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: LogId) -> Result<Option<DeliveryLog>> {
        let sql = format!("SELECT {LOG_COLUMNS} FROM delivery_logs WHERE id = $1");
        let log = sqlx::query_as::<_, DeliveryLog>(&sql)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(log)
    }

    /// Applies a partial update. Columns left `None` keep their value.
    ///
    /// Returns `false` when the row does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(&self, id: LogId, update: &LogUpdate) -> Result<bool> {
        let (touch_next, next_attempt_at) = match update.next_attempt_at {
            Some(next) => (true, next),
            None => (false, None),
        };

        let result = sqlx::query(
            r"
            UPDATE delivery_logs
            SET status = COALESCE($2, status),
                http_code = COALESCE($3, http_code),
                response_body = COALESCE($4, response_body),
                error_message = COALESCE($5, error_message),
                duration_ms = COALESCE($6, duration_ms),
                next_attempt_at = CASE WHEN $7 THEN $8 ELSE next_attempt_at END
            WHERE id = $1
            ",
        )
        .bind(id.0)
        .bind(update.status.map(LogStatus::as_str))
        .bind(update.http_code)
        .bind(&update.response_body)
        .bind(&update.error_message)
        .bind(update.duration_ms)
        .bind(touch_next)
        .bind(next_attempt_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Appends `record` and keeps only the newest `cap` entries.
    ///
    /// Returns `false` when the row does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn append_attempt(
        &self,
        id: LogId,
        record: &AttemptRecord,
        cap: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE delivery_logs
            SET attempt_history = (
                SELECT COALESCE(jsonb_agg(entry ORDER BY position), '[]'::jsonb)
                FROM (
                    SELECT entry, position
                    FROM jsonb_array_elements(attempt_history || jsonb_build_array($2::jsonb))
                        WITH ORDINALITY AS history(entry, position)
                    ORDER BY position DESC
                    LIMIT $3
                ) AS newest
            )
            WHERE id = $1
            ",
        )
        .bind(id.0)
        .bind(Json(record))
        .bind(cap)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Lists rows matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(
        &self,
        filter: &LogFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeliveryLog>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM delivery_logs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::uuid IS NULL OR destination_id = $2) \
               AND ($3::text IS NULL OR trigger_name = $3) \
               AND ($4::uuid IS NULL OR event_uuid = $4) \
             ORDER BY created_at DESC \
             LIMIT $5 OFFSET $6"
        );
        let logs = sqlx::query_as::<_, DeliveryLog>(&sql)
            .bind(filter.status.map(LogStatus::as_str))
            .bind(filter.destination_id.map(|id| id.0))
            .bind(filter.trigger_name.as_deref())
            .bind(filter.event_uuid)
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.pool)
            .await?;

        Ok(logs)
    }

    /// Counts rows matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count(&self, filter: &LogFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM delivery_logs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR destination_id = $2)
              AND ($3::text IS NULL OR trigger_name = $3)
              AND ($4::uuid IS NULL OR event_uuid = $4)
            ",
        )
        .bind(filter.status.map(LogStatus::as_str))
        .bind(filter.destination_id.map(|id| id.0))
        .bind(filter.trigger_name.as_deref())
        .bind(filter.event_uuid)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Counts rows per status created at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn stats(&self, since: DateTime<Utc>) -> Result<LogStats> {
        let stats = sqlx::query_as::<_, LogStats>(
            r"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'success') AS success,
                COUNT(*) FILTER (WHERE status = 'error') AS error,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'retry') AS retry,
                COUNT(*) FILTER (WHERE status = 'permanently_failed') AS permanently_failed
            FROM delivery_logs
            WHERE created_at >= $1
            ",
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await?;

        Ok(stats)
    }

    /// Deletes rows created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
