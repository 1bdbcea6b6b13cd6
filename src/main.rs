//! hookrelay delivery worker.
//!
//! Connects to PostgreSQL, applies the schema and runs the delivery loop
//! until SIGINT or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookrelay_core::{Clock, RealClock, Storage};
use hookrelay_delivery::{
    client::ReqwestTransport,
    storage::PostgresStore,
    transform::{ActorStrategies, InMemoryActorDirectory, PayloadTransformer},
    DeliveryLogService, DeliveryWorker, Dispatcher, JobQueue,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;

use config::Config;

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        batch_size = config.batch_size,
        poll_interval_secs = config.poll_interval_seconds,
        max_attempts = config.max_attempts,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(pool.clone()));
    storage.health_check().await.context("failed to verify database connection")?;
    storage.migrate().await.context("failed to run database migrations")?;
    info!("database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = Arc::new(PostgresStore::new(storage));
    let transport = ReqwestTransport::new(config.to_client_config())
        .context("failed to build HTTP transport")?;

    // Actor lookups belong to the host application; the standalone worker
    // resolves none.
    let transformer = PayloadTransformer::new(
        store.clone(),
        Arc::new(InMemoryActorDirectory::new()),
        ActorStrategies::default(),
        clock.clone(),
    );

    let dispatcher = Dispatcher::new(
        config.to_dispatcher_config(),
        JobQueue::new(store.clone(), config.to_queue_config(), clock.clone()),
        DeliveryLogService::new(store.clone(), config.attempt_history_cap, clock.clone()),
        transformer,
        store,
        Arc::new(transport),
        clock.clone(),
    );

    let worker = DeliveryWorker::new(Arc::new(dispatcher), config.to_worker_config(), clock);
    let cancellation = CancellationToken::new();
    let mut worker_handle = tokio::spawn({
        let cancellation = cancellation.clone();
        async move { worker.run(cancellation).await }
    });

    info!("hookrelay is delivering webhooks");

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received, waiting for the current batch");
            cancellation.cancel();
            tokio::select! {
                () = tokio::time::sleep(SHUTDOWN_GRACE_PERIOD) => {
                    info!("shutdown grace period expired");
                }
                result = &mut worker_handle => {
                    if let Err(e) = result {
                        error!(error = %e, "delivery worker panicked");
                    }
                }
            }
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "delivery worker panicked");
            }
        }
    }

    pool.close().await;
    info!("hookrelay shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins over the configured directives.
fn init_tracing(default_directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives))
        .context("invalid log filter directives")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the connection pool, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime_seconds))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                info!("database connection pool established");
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
