//! Delivery notifications for observers outside the delivery engine.
//!
//! The engine publishes one `DeliveryEvent` per attempt outcome. Hosts that
//! want to react (audit trails, alerting, dashboards) implement
//! `EventHandler` and register it, optionally behind a
//! `MulticastEventHandler` when more than one subscriber is interested.
//!
//! ```text
//!                     Succeeded / Failed
//! ┌─────────────────┐                     ┌────────────────────┐
//! │ Dispatcher      │ ──────────────────▶ │ MulticastHandler   │
//! │ (process_batch) │                     │                    │
//! └─────────────────┘                     └────────────────────┘
//!                                                   │
//!                                                   ▼
//!                                          host subscribers
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DestinationId, JobId, LogId};

/// Events emitted by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// Destination answered with a 2xx status.
    Succeeded(DeliverySucceededEvent),

    /// Attempt failed. The job may or may not be retried.
    Failed(DeliveryFailedEvent),
}

impl DeliveryEvent {
    /// Job the event refers to.
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Succeeded(e) => e.job_id,
            Self::Failed(e) => e.job_id,
        }
    }
}

/// Event emitted when a delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Delivered job.
    pub job_id: JobId,

    /// Log row updated for this delivery.
    pub log_id: Option<LogId>,

    /// Receiving destination.
    pub destination_id: DestinationId,

    /// Trigger that produced the event.
    pub trigger_name: String,

    /// URL the payload was posted to.
    pub endpoint_url: String,

    /// Shared identity of the event firing.
    pub event_uuid: Uuid,

    /// HTTP status code returned by the destination.
    pub response_status: u16,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,

    /// Attempt duration.
    pub duration_ms: u64,
}

/// Event emitted when a delivery attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Failed job.
    pub job_id: JobId,

    /// Log row updated for this attempt.
    pub log_id: Option<LogId>,

    /// Intended destination.
    pub destination_id: DestinationId,

    /// Trigger that produced the event.
    pub trigger_name: String,

    /// URL the payload was posted to, if the envelope could be decoded.
    pub endpoint_url: Option<String>,

    /// Shared identity of the event firing, if the envelope could be decoded.
    pub event_uuid: Option<Uuid>,

    /// HTTP status code if the destination responded.
    pub response_status: Option<u16>,

    /// 1-based attempt number.
    pub attempt_number: u32,

    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,

    /// What went wrong.
    pub error_message: String,

    /// Whether the failure was classified as retryable.
    pub is_retryable: bool,

    /// When the job will be attempted again. `None` means the failure is
    /// final.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl DeliveryFailedEvent {
    /// Whether no further attempts will be made.
    pub fn is_final(&self) -> bool {
        self.next_attempt_at.is_none()
    }
}

/// Trait for handling delivery events.
///
/// Implementations must not block delivery processing. Failures inside a
/// handler are the handler's concern and are never propagated back.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
