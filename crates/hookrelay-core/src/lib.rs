//! Core domain models, clock and persistence for hookrelay.
//!
//! Provides strongly-typed identifiers, queue and log records, delivery
//! events, the clock abstraction and the PostgreSQL repositories. The
//! delivery crate builds its queue, log and dispatcher on top of these.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent, EventHandler,
    MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    ActorRecord, AttemptRecord, DeliveryLog, Destination, DestinationId, EventIdentity,
    FieldMapping, JobFilter, JobId, JobStatus, LogFilter, LogId, LogStats, LogStatus, LogUpdate,
    MappingRule, NewDeliveryLog, Page, QueueJob, QueueStats, TriggerSchema,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
