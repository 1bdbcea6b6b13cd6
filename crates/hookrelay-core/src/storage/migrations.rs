//! Idempotent schema setup.
//!
//! Statements use `IF NOT EXISTS` so they can run on every start-up.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "destinations table",
        r#"
        CREATE TABLE IF NOT EXISTS destinations (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            endpoint_url TEXT NOT NULL,
            auth_header TEXT,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            triggers TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "destinations trigger index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_destinations_triggers
        ON destinations USING GIN (triggers)
        "#,
    ),
    (
        "delivery_logs table",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_logs (
            id UUID PRIMARY KEY,
            destination_id UUID NOT NULL,
            trigger_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            http_code INTEGER,
            request_payload JSONB NOT NULL,
            original_payload JSONB,
            mapping_applied BOOLEAN NOT NULL DEFAULT FALSE,
            response_body TEXT,
            error_message TEXT,
            duration_ms BIGINT,
            event_uuid UUID,
            event_timestamp TIMESTAMPTZ,
            attempt_history JSONB NOT NULL DEFAULT '[]'::jsonb,
            next_attempt_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "delivery_logs status index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_logs_status
        ON delivery_logs(status, created_at DESC)
        "#,
    ),
    (
        "delivery_logs event index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_logs_event_uuid
        ON delivery_logs(event_uuid)
        "#,
    ),
    (
        "queue_jobs table",
        r#"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            id UUID PRIMARY KEY,
            destination_id UUID NOT NULL,
            trigger_name TEXT NOT NULL,
            envelope TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            locked_at TIMESTAMPTZ,
            locked_by TEXT,
            scheduled_at TIMESTAMPTZ NOT NULL,
            log_id UUID REFERENCES delivery_logs(id) ON DELETE SET NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT queue_jobs_lock_pair CHECK ((locked_at IS NULL) = (locked_by IS NULL))
        )
        "#,
    ),
    (
        "queue_jobs schedule index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_status_scheduled
        ON queue_jobs(status, scheduled_at)
        "#,
    ),
    (
        "queue_jobs lock index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_lock
        ON queue_jobs(locked_at, locked_by)
        "#,
    ),
    (
        "trigger_schemas table",
        r#"
        CREATE TABLE IF NOT EXISTS trigger_schemas (
            destination_id UUID NOT NULL,
            trigger_name TEXT NOT NULL,
            example_payload JSONB,
            field_mapping JSONB,
            include_user_data BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (destination_id, trigger_name)
        )
        "#,
    ),
];

/// Runs every schema statement in order.
///
/// # Errors
///
/// Returns `CoreError::Database` naming the first statement that failed.
pub async fn run(pool: &PgPool) -> Result<()> {
    for (name, sql) in STATEMENTS {
        sqlx::query(sql).execute(pool).await.map_err(|e| {
            crate::error::CoreError::Database(format!("failed to create {name}: {e}"))
        })?;
        debug!(statement = name, "schema statement applied");
    }

    Ok(())
}
