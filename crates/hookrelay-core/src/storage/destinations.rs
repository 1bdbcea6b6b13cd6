//! Repository for destination configuration.
//!
//! Destinations are read at dispatch time only. Jobs carry a snapshot of
//! the fields they need, so edits here never affect queued deliveries.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::Destination};

/// Repository for destination database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns every destination subscribed to `trigger_name`, enabled or
    /// not. Callers skip disabled ones.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_trigger(&self, trigger_name: &str) -> Result<Vec<Destination>> {
        let destinations = sqlx::query_as::<_, Destination>(
            r"
            SELECT id, name, endpoint_url, auth_header, enabled, triggers, created_at
            FROM destinations
            WHERE $1 = ANY(triggers)
            ORDER BY created_at ASC
            ",
        )
        .bind(trigger_name)
        .fetch_all(&*self.pool)
        .await?;

        Ok(destinations)
    }
}
