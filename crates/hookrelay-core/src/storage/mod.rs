//! Database access layer implementing the repository pattern.
//!
//! Each table gets one repository exposing the specific query shapes the
//! delivery engine needs (conditional locking, grouped counts, paginated
//! listings). All database operations go through these repositories.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_logs;
pub mod destinations;
pub mod migrations;
pub mod queue_jobs;
pub mod trigger_schemas;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for queue jobs.
    pub queue_jobs: Arc<queue_jobs::Repository>,

    /// Repository for delivery logs and attempt history.
    pub delivery_logs: Arc<delivery_logs::Repository>,

    /// Repository for per (destination, trigger) transformation schemas.
    pub trigger_schemas: Arc<trigger_schemas::Repository>,

    /// Repository for destination configuration.
    pub destinations: Arc<destinations::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            queue_jobs: Arc::new(queue_jobs::Repository::new(pool.clone())),
            delivery_logs: Arc::new(delivery_logs::Repository::new(pool.clone())),
            trigger_schemas: Arc::new(trigger_schemas::Repository::new(pool.clone())),
            destinations: Arc::new(destinations::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }

    /// Creates tables and indexes that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/hookrelay_test").unwrap();
        let storage = Storage::new(pool);
        assert!(!storage.pool.is_closed());
    }
}
