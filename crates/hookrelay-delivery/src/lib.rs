//! Webhook dispatch and delivery with a durable job queue.
//!
//! Host events are turned into one queue job and one delivery log row per
//! subscribed destination. Workers claim due jobs, take an atomic lock on
//! each and deliver them over HTTP with exponential backoff between retries.
//!
//! # Architecture
//!
//! 1. **Dispatch** - canonical payload, per-destination transform, pending
//!    log row, queue job with an immutable envelope
//! 2. **Claim** - stale locks are reclaimed, then due jobs are locked one by
//!    one; a lost race means the job is skipped
//! 3. **Deliver** - the envelope is posted and the response classified
//! 4. **Record** - the job is completed, rescheduled or permanently failed
//!    and the log row gains an attempt history entry
//!
//! Delivery is at-least-once. A worker slower than the stale lock timeout
//! can have its job reclaimed and delivered again by another worker.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookrelay_core::{RealClock, Storage};
//! use hookrelay_delivery::{
//!     client::ReqwestTransport,
//!     storage::PostgresStore,
//!     transform::{ActorStrategies, InMemoryActorDirectory, PayloadTransformer},
//!     DeliveryLogService, Dispatcher, DispatcherConfig, JobQueue, QueueConfig,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> hookrelay_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let store = Arc::new(PostgresStore::new(Arc::new(Storage::new(pool))));
//!
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::default(),
//!     JobQueue::new(store.clone(), QueueConfig::default(), clock.clone()),
//!     DeliveryLogService::new(store.clone(), 5, clock.clone()),
//!     PayloadTransformer::new(
//!         store.clone(),
//!         Arc::new(InMemoryActorDirectory::new()),
//!         ActorStrategies::default(),
//!         clock.clone(),
//!     ),
//!     store,
//!     Arc::new(ReqwestTransport::with_defaults()?),
//!     clock,
//! );
//!
//! dispatcher.dispatch("save_post", &[serde_json::json!(42).into()]).await?;
//! let summary = dispatcher.process_batch(10).await;
//! # let _ = summary;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod log;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod transform;
pub mod worker;

pub use dispatcher::{
    BatchSummary, DispatchOutcome, DispatchScope, Dispatcher, DispatcherConfig, Extensions,
    JobOutcome, SendOutcome,
};
pub use envelope::JobEnvelope;
pub use error::{DeliveryError, Result};
pub use log::DeliveryLogService;
pub use queue::{JobQueue, QueueConfig, RescheduleOutcome};
pub use retry::BackoffPolicy;
pub use transform::{PayloadTransformer, TransformOutcome, TriggerArg};
pub use worker::{DeliveryWorker, WorkerConfig};
