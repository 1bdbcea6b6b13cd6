//! Core domain models and strongly-typed identifiers.
//!
//! Defines queue jobs, delivery logs, destinations, trigger schemas and the
//! newtype ID wrappers that keep them apart at compile time. Includes the
//! database serialization traits for status enums and the partial-update and
//! filter types used by the repositories.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Version stamped into every event envelope sent to destinations.
pub const EVENT_VERSION: &str = "1.0";

/// Strongly-typed queue job identifier.
///
/// A job is created once per (event firing, destination) pair and this ID
/// follows it through claiming, retries and terminal failure.
///
/// # Example
///
/// ```
/// use hookrelay_core::models::JobId;
/// let job_id = JobId::new();
/// println!("Processing job: {}", job_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery log identifier.
///
/// Every queue job links to exactly one log row, created before the job is
/// enqueued so that the job can carry the ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId(pub Uuid);

impl LogId {
    /// Creates a new random log ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for LogId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for LogId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for LogId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for LogId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed destination identifier.
///
/// Each destination is an external HTTP endpoint with its own auth header
/// and trigger subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId(pub Uuid);

impl DestinationId {
    /// Creates a new random destination ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DestinationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DestinationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DestinationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DestinationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DestinationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Queue job lifecycle status.
///
/// ```text
/// Pending -> Processing -> Completed
///               |  |
///               |  └-> Pending (rescheduled with backoff)
///               └-> PermanentlyFailed
/// Failed | PermanentlyFailed -> Pending (operator forced retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting until `scheduled_at` for a worker to claim it.
    Pending,

    /// Locked by a worker that is attempting delivery.
    Processing,

    /// Delivered successfully. Terminal.
    Completed,

    /// Soft failure set by an operator. Eligible for a forced retry.
    Failed,

    /// Retries exhausted or a non-retryable error occurred.
    PermanentlyFailed,
}

impl JobStatus {
    /// Storage representation of this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Whether an operator may force this job back into the queue.
    pub const fn is_retryable_by_operator(self) -> bool {
        matches!(self, Self::Failed | Self::PermanentlyFailed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Delivery log status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// Job enqueued, no attempt made yet.
    Pending,
    /// Delivered with a 2xx response.
    Success,
    /// An attempt failed outside the queue's retry path.
    Error,
    /// Last attempt failed and another is scheduled.
    Retry,
    /// No further attempts will be made.
    PermanentlyFailed,
}

impl LogStatus {
    /// Storage representation of this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
            Self::Retry => "retry",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Terminal statuses are never changed by the delivery engine again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::PermanentlyFailed)
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "retry" => Ok(Self::Retry),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            _ => Err(format!("invalid log status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for LogStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for LogStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for LogStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// External HTTP endpoint that receives event notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Destination {
    /// Unique identifier for this destination.
    pub id: DestinationId,

    /// Human-readable name.
    pub name: String,

    /// Target URL for delivery.
    pub endpoint_url: String,

    /// Value sent verbatim in the `Authorization` header, if any.
    pub auth_header: Option<String>,

    /// Disabled destinations are skipped at dispatch time.
    pub enabled: bool,

    /// Trigger names this destination is subscribed to.
    pub triggers: Vec<String>,

    /// When this destination was created.
    pub created_at: DateTime<Utc>,
}

impl Destination {
    /// Creates an enabled destination subscribed to the given triggers.
    pub fn new(
        name: impl Into<String>,
        endpoint_url: impl Into<String>,
        triggers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: DestinationId::new(),
            name: name.into(),
            endpoint_url: endpoint_url.into(),
            auth_header: None,
            enabled: true,
            triggers: triggers.into_iter().map(Into::into).collect(),
            created_at: Utc::now(),
        }
    }

    /// Sets the `Authorization` header value.
    #[must_use]
    pub fn with_auth_header(mut self, auth_header: impl Into<String>) -> Self {
        self.auth_header = Some(auth_header.into());
        self
    }

    /// Whether this destination receives the given trigger.
    pub fn subscribes_to(&self, trigger: &str) -> bool {
        self.triggers.iter().any(|t| t == trigger)
    }
}

/// UUID and timestamp shared by every destination of one event firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventIdentity {
    /// Unique identifier of the firing.
    pub id: Uuid,
    /// When the event fired.
    pub timestamp: DateTime<Utc>,
    /// Envelope format version.
    pub version: String,
}

impl EventIdentity {
    /// Creates a fresh identity stamped at `timestamp`.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(), timestamp, version: EVENT_VERSION.to_string() }
    }
}

/// Durable delivery job.
///
/// `locked_at` and `locked_by` are always set or cleared together. The
/// envelope is an opaque snapshot written at enqueue time; processing never
/// re-reads destination configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueJob {
    /// Unique identifier for this job.
    pub id: JobId,

    /// Destination the envelope was built for.
    pub destination_id: DestinationId,

    /// Trigger that produced the job.
    pub trigger_name: String,

    /// Serialized delivery envelope.
    pub envelope: String,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Failed attempts consumed so far.
    pub attempts: i32,

    /// Attempt budget for this job.
    pub max_attempts: i32,

    /// When the current lock was taken.
    pub locked_at: Option<DateTime<Utc>>,

    /// Token of the worker holding the lock.
    pub locked_by: Option<String>,

    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,

    /// Linked delivery log row.
    pub log_id: Option<LogId>,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

impl QueueJob {
    /// Builds a pending, unlocked job.
    pub fn new(
        destination_id: DestinationId,
        trigger_name: impl Into<String>,
        envelope: impl Into<String>,
        max_attempts: i32,
        scheduled_at: DateTime<Utc>,
        log_id: Option<LogId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            destination_id,
            trigger_name: trigger_name.into(),
            envelope: envelope.into(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            locked_at: None,
            locked_by: None,
            scheduled_at,
            log_id,
            created_at,
        }
    }

    /// Whether a worker currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && !self.is_locked() && self.scheduled_at <= now
    }
}

/// One entry of a delivery log's bounded attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt finished.
    pub attempted_at: DateTime<Utc>,
    /// HTTP status if a response was received.
    pub http_code: Option<u16>,
    /// Log status after this attempt.
    pub status: LogStatus,
    /// Failure description, absent on success.
    pub error_message: Option<String>,
    /// Wall time spent on the attempt.
    pub duration_ms: u64,
    /// Whether the failure was classified as retryable.
    pub should_retry: bool,
}

/// Record of one event's delivery to one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryLog {
    /// Unique identifier for this log row.
    pub id: LogId,

    /// Destination being delivered to.
    pub destination_id: DestinationId,

    /// Trigger that produced the event.
    pub trigger_name: String,

    /// Current status.
    pub status: LogStatus,

    /// HTTP status code of the latest attempt.
    pub http_code: Option<i32>,

    /// Payload sent to the destination (after transformation).
    pub request_payload: Json<Value>,

    /// Payload before transformation, kept only when a mapping was applied.
    pub original_payload: Option<Json<Value>>,

    /// Whether the transformer changed the payload.
    pub mapping_applied: bool,

    /// Response body of the latest attempt (truncated).
    pub response_body: Option<String>,

    /// Error of the latest attempt.
    pub error_message: Option<String>,

    /// Duration of the latest attempt.
    pub duration_ms: Option<i64>,

    /// Shared identity of the event firing.
    pub event_uuid: Option<Uuid>,

    /// Timestamp of the event firing.
    pub event_timestamp: Option<DateTime<Utc>>,

    /// Most recent attempts, oldest first.
    pub attempt_history: Json<Vec<AttemptRecord>>,

    /// When the next retry is scheduled, if any.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When the log row was created.
    pub created_at: DateTime<Utc>,
}

impl DeliveryLog {
    /// Attempt history as a plain slice.
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempt_history.0
    }
}

/// Fields captured when a pending log row is created at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeliveryLog {
    /// Destination being delivered to.
    pub destination_id: DestinationId,
    /// Trigger that produced the event.
    pub trigger_name: String,
    /// Transformed payload.
    pub request_payload: Value,
    /// Pre-transform payload, when a mapping was applied.
    pub original_payload: Option<Value>,
    /// Whether a mapping was applied.
    pub mapping_applied: bool,
    /// Shared identity of the firing.
    pub event: Option<EventIdentity>,
}

impl NewDeliveryLog {
    /// Materializes the pending row.
    pub fn into_log(self, created_at: DateTime<Utc>) -> DeliveryLog {
        DeliveryLog {
            id: LogId::new(),
            destination_id: self.destination_id,
            trigger_name: self.trigger_name,
            status: LogStatus::Pending,
            http_code: None,
            request_payload: Json(self.request_payload),
            original_payload: self.original_payload.map(Json),
            mapping_applied: self.mapping_applied,
            response_body: None,
            error_message: None,
            duration_ms: None,
            event_uuid: self.event.as_ref().map(|e| e.id),
            event_timestamp: self.event.as_ref().map(|e| e.timestamp),
            attempt_history: Json(Vec::new()),
            next_attempt_at: None,
            created_at,
        }
    }
}

/// Partial update of a delivery log.
///
/// `None` leaves a column untouched. `next_attempt_at` distinguishes "leave
/// as is" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogUpdate {
    /// New status.
    pub status: Option<LogStatus>,
    /// HTTP status code.
    pub http_code: Option<i32>,
    /// Response body.
    pub response_body: Option<String>,
    /// Error message.
    pub error_message: Option<String>,
    /// Attempt duration.
    pub duration_ms: Option<i64>,
    /// Next scheduled attempt.
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
}

impl LogUpdate {
    /// Starts an update that moves the log to `status`.
    pub fn status(status: LogStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Records the HTTP status code.
    #[must_use]
    pub fn with_http_code(mut self, code: Option<u16>) -> Self {
        self.http_code = code.map(i32::from);
        self
    }

    /// Records the response body.
    #[must_use]
    pub fn with_response_body(mut self, body: Option<String>) -> Self {
        self.response_body = body;
        self
    }

    /// Records the error message.
    #[must_use]
    pub fn with_error(mut self, message: Option<String>) -> Self {
        self.error_message = message;
        self
    }

    /// Records the attempt duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(i64::try_from(duration_ms).unwrap_or(i64::MAX));
        self
    }

    /// Sets or clears the next scheduled attempt.
    #[must_use]
    pub fn with_next_attempt_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    /// Applies this update to an in-memory row.
    pub fn apply_to(&self, log: &mut DeliveryLog) {
        if let Some(status) = self.status {
            log.status = status;
        }
        if let Some(code) = self.http_code {
            log.http_code = Some(code);
        }
        if let Some(body) = &self.response_body {
            log.response_body = Some(body.clone());
        }
        if let Some(message) = &self.error_message {
            log.error_message = Some(message.clone());
        }
        if let Some(duration) = self.duration_ms {
            log.duration_ms = Some(duration);
        }
        if let Some(next) = self.next_attempt_at {
            log.next_attempt_at = next;
        }
    }
}

/// Single `source -> target` rule of a field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    /// Dot path read from the original payload.
    #[serde(default)]
    pub source: String,
    /// Dot path written in the transformed payload.
    #[serde(default)]
    pub target: String,
}

impl MappingRule {
    /// Creates a rule.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into() }
    }
}

/// Operator-configured payload reshaping for one (destination, trigger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Explicit moves, applied in order.
    #[serde(default)]
    pub mappings: Vec<MappingRule>,

    /// Paths dropped from the unmapped copy (exact or prefix match).
    #[serde(default)]
    pub excluded: Vec<String>,

    /// Copy every path not consumed by a mapping back into the result.
    #[serde(default = "default_include_unmapped", rename = "includeUnmapped")]
    pub include_unmapped: bool,
}

fn default_include_unmapped() -> bool {
    true
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self { mappings: Vec::new(), excluded: Vec::new(), include_unmapped: true }
    }
}

/// Per (destination, trigger) transformation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerSchema {
    /// Destination the schema applies to.
    pub destination_id: DestinationId,
    /// Trigger the schema applies to.
    pub trigger_name: String,
    /// First payload seen, captured for operator configuration. Write-once.
    pub example_payload: Option<Json<Value>>,
    /// Field mapping, if configured.
    pub field_mapping: Option<Json<FieldMapping>>,
    /// Merge the resolved actor under a `user` key.
    pub include_user_data: bool,
    /// When the schema was created.
    pub created_at: DateTime<Utc>,
    /// When the schema was last modified.
    pub updated_at: DateTime<Utc>,
}

impl TriggerSchema {
    /// Creates an empty schema with no example and no mapping.
    pub fn new(
        destination_id: DestinationId,
        trigger_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            destination_id,
            trigger_name: trigger_name.into(),
            example_payload: None,
            field_mapping: None,
            include_user_data: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Field mapping as a plain reference.
    pub fn mapping(&self) -> Option<&FieldMapping> {
        self.field_mapping.as_ref().map(|m| &m.0)
    }
}

/// Aggregate queue health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: i64,
    /// Jobs currently locked by a worker.
    pub processing: i64,
    /// Delivered jobs still retained.
    pub completed: i64,
    /// Operator-failed jobs.
    pub failed: i64,
    /// Jobs that will not be retried.
    pub permanently_failed: i64,
    /// All jobs.
    pub total: i64,
    /// Earliest `scheduled_at` among pending jobs.
    pub oldest_pending_scheduled_at: Option<DateTime<Utc>>,
    /// Pending jobs whose `scheduled_at` has passed.
    pub due_now: i64,
}

/// Delivery log counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogStats {
    /// All rows in the window.
    pub total: i64,
    /// Delivered.
    pub success: i64,
    /// Failed outside the retry path.
    pub error: i64,
    /// Awaiting a first attempt.
    pub pending: i64,
    /// Awaiting a retry.
    pub retry: i64,
    /// Given up.
    pub permanently_failed: i64,
}

impl LogStats {
    /// Adds one row with the given status.
    pub fn record(&mut self, status: LogStatus) {
        self.total += 1;
        match status {
            LogStatus::Pending => self.pending += 1,
            LogStatus::Success => self.success += 1,
            LogStatus::Error => self.error += 1,
            LogStatus::Retry => self.retry += 1,
            LogStatus::PermanentlyFailed => self.permanently_failed += 1,
        }
    }
}

/// Filter for job listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Restrict to one status.
    pub status: Option<JobStatus>,
    /// Restrict to one destination.
    pub destination_id: Option<DestinationId>,
    /// Restrict to one trigger.
    pub trigger_name: Option<String>,
}

impl JobFilter {
    /// Whether `job` passes this filter.
    pub fn matches(&self, job: &QueueJob) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.destination_id.is_none_or(|d| d == job.destination_id)
            && self.trigger_name.as_deref().is_none_or(|t| t == job.trigger_name)
    }
}

/// Filter for log listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Restrict to one status.
    pub status: Option<LogStatus>,
    /// Restrict to one destination.
    pub destination_id: Option<DestinationId>,
    /// Restrict to one trigger.
    pub trigger_name: Option<String>,
    /// Restrict to one event firing.
    pub event_uuid: Option<Uuid>,
}

impl LogFilter {
    /// Whether `log` passes this filter.
    pub fn matches(&self, log: &DeliveryLog) -> bool {
        self.status.is_none_or(|s| s == log.status)
            && self.destination_id.is_none_or(|d| d == log.destination_id)
            && self.trigger_name.as_deref().is_none_or(|t| t == log.trigger_name)
            && self.event_uuid.is_none_or(|u| Some(u) == log.event_uuid)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Rows on this page.
    pub items: Vec<T>,
    /// Rows across all pages.
    pub total: i64,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub per_page: u32,
    /// Number of pages.
    pub pages: u32,
}

impl<T> Page<T> {
    /// Assembles a page and derives the page count.
    pub fn new(items: Vec<T>, total: i64, page: u32, per_page: u32) -> Self {
        let per_page = per_page.max(1);
        let total_u = u64::try_from(total).unwrap_or(0);
        let pages = u32::try_from(total_u.div_ceil(u64::from(per_page))).unwrap_or(u32::MAX);
        Self { items, total, page, per_page, pages }
    }
}

/// Actor record merged into payloads when a schema asks for user data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Host identifier.
    pub id: i64,
    /// Login name.
    pub login: String,
    /// Email address.
    pub email: String,
    /// Display name.
    pub display_name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Assigned roles.
    pub roles: Vec<String>,
    /// Registration time as reported by the host.
    pub registered: Option<String>,
    /// Optional profile metadata (nickname, description, locale).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}
