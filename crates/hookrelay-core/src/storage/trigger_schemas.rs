//! Repository for trigger schema operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, PgPool};

use crate::{
    error::Result,
    models::{DestinationId, TriggerSchema},
};

/// Repository for per (destination, trigger) schema rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds the schema for a destination and trigger.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(
        &self,
        destination_id: DestinationId,
        trigger_name: &str,
    ) -> Result<Option<TriggerSchema>> {
        let schema = sqlx::query_as::<_, TriggerSchema>(
            r"
            SELECT destination_id, trigger_name, example_payload, field_mapping,
                   include_user_data, created_at, updated_at
            FROM trigger_schemas
            WHERE destination_id = $1 AND trigger_name = $2
            ",
        )
        .bind(destination_id.0)
        .bind(trigger_name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(schema)
    }

    /// Stores `example` unless an example was already captured.
    ///
    /// Creates the schema row when missing. Returns `true` when the example
    /// was written.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn capture_example(
        &self,
        destination_id: DestinationId,
        trigger_name: &str,
        example: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO trigger_schemas (
                destination_id, trigger_name, example_payload, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (destination_id, trigger_name) DO UPDATE
            SET example_payload = EXCLUDED.example_payload, updated_at = EXCLUDED.updated_at
            WHERE trigger_schemas.example_payload IS NULL
            ",
        )
        .bind(destination_id.0)
        .bind(trigger_name)
        .bind(Json(example))
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Creates or replaces the operator-controlled part of a schema.
    ///
    /// A captured example is kept.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn save(&self, schema: &TriggerSchema) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO trigger_schemas (
                destination_id, trigger_name, example_payload, field_mapping,
                include_user_data, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (destination_id, trigger_name) DO UPDATE
            SET field_mapping = EXCLUDED.field_mapping,
                include_user_data = EXCLUDED.include_user_data,
                example_payload =
                    COALESCE(trigger_schemas.example_payload, EXCLUDED.example_payload),
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(schema.destination_id.0)
        .bind(&schema.trigger_name)
        .bind(&schema.example_payload)
        .bind(&schema.field_mapping)
        .bind(schema.include_user_data)
        .bind(schema.created_at)
        .bind(schema.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
