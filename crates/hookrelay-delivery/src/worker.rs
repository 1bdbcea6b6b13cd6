//! Periodic batch processing loop.

use std::{sync::Arc, time::Duration};

use hookrelay_core::time::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatcher::{BatchSummary, Dispatcher, DEFAULT_BATCH_SIZE};

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Jobs claimed per tick.
    pub batch_size: usize,
    /// Pause between ticks.
    pub poll_interval: Duration,
    /// Completed jobs older than this many days are deleted each tick.
    /// `None` keeps them.
    pub completed_retention_days: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(60),
            completed_retention_days: Some(7),
        }
    }
}

/// Runs `Dispatcher::process_batch` on a fixed interval.
#[derive(Debug, Clone)]
pub struct DeliveryWorker {
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker.
    pub fn new(dispatcher: Arc<Dispatcher>, config: WorkerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { dispatcher, config, clock }
    }

    /// Processes one batch and applies retention.
    pub async fn tick(&self) -> BatchSummary {
        let summary = self.dispatcher.process_batch(self.config.batch_size).await;

        if let Some(days) = self.config.completed_retention_days {
            if let Err(e) = self.dispatcher.queue().cleanup_completed(days).await {
                error!(error = %e, "completed job cleanup failed");
            }
        }

        summary
    }

    /// Ticks until `cancellation` fires. A tick that is under way finishes
    /// before the loop exits.
    pub async fn run(&self, cancellation: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "delivery worker starting"
        );

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let summary = self.tick().await;
            debug!(processed = summary.processed, errors = summary.errors, "worker tick finished");

            tokio::select! {
                () = self.clock.sleep(self.config.poll_interval) => {},
                () = cancellation.cancelled() => break,
            }
        }

        info!("delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_core::{models::Destination, time::TestClock};
    use serde_json::json;

    use super::*;
    use crate::{
        client::mock::MockTransport,
        dispatcher::DispatcherConfig,
        log::DeliveryLogService,
        queue::{JobQueue, QueueConfig},
        storage::mock::MockStorage,
        transform::{ActorStrategies, InMemoryActorDirectory, PayloadTransformer},
    };

    fn worker(
        storage: &MockStorage,
        transport: &MockTransport,
        clock: &TestClock,
    ) -> DeliveryWorker {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(storage.clone());
        let dispatcher = Dispatcher::new(
            DispatcherConfig::default(),
            JobQueue::new(store.clone(), QueueConfig::default(), clock.clone()),
            DeliveryLogService::new(store.clone(), 5, clock.clone()),
            PayloadTransformer::new(
                store.clone(),
                Arc::new(InMemoryActorDirectory::new()),
                ActorStrategies::default(),
                clock.clone(),
            ),
            store,
            Arc::new(transport.clone()),
            clock.clone(),
        );
        DeliveryWorker::new(Arc::new(dispatcher), WorkerConfig::default(), clock)
    }

    #[tokio::test]
    async fn tick_delivers_due_jobs() {
        let storage = MockStorage::new();
        let transport = MockTransport::new();
        let clock = TestClock::new();
        storage
            .add_destination(Destination::new("crm", "https://example.com/hook", ["save_post"]))
            .await;
        let worker = worker(&storage, &transport, &clock);

        worker.dispatcher.dispatch("save_post", &[json!(42).into()]).await.unwrap();
        let summary = worker.tick().await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(transport.request_count().await, 1);
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let storage = MockStorage::new();
        let transport = MockTransport::new();
        let clock = TestClock::new();
        let worker = worker(&storage, &transport, &clock);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        tokio::time::timeout(Duration::from_secs(1), worker.run(cancellation))
            .await
            .expect("worker should stop once cancelled");
    }
}
