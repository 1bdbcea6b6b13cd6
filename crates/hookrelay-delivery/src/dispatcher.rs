//! Event dispatch and job processing.
//!
//! `dispatch` turns one trigger firing into a pending log row and a queue
//! job per subscribed destination. `process_batch` claims due jobs, delivers
//! them one at a time and records the outcome on both the job and its log
//! row. The job write and the log write are separate operations; a crash
//! between them leaves the log behind the job until the next attempt.

use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::Bytes;
use hookrelay_core::{
    events::{DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent, EventHandler},
    models::{
        AttemptRecord, EventIdentity, JobId, JobStatus, LogId, LogStatus, LogUpdate,
        NewDeliveryLog, QueueJob,
    },
    time::Clock,
    NoOpEventHandler,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{HttpTransport, TransportRequest},
    envelope::{DestinationSnapshot, JobEnvelope},
    error::{DeliveryError, ErrorCategory, Result},
    log::DeliveryLogService,
    queue::{JobQueue, RescheduleOutcome},
    storage::DestinationDirectory,
    transform::{normalize_args, PayloadTransformer, TriggerArg},
};

/// Default number of jobs claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default age after which a processing lock is considered abandoned.
pub const DEFAULT_STALE_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Public URL of the host site, sent as `site.url`.
    pub site_url: String,
    /// Refuse endpoints that are not `https://`.
    pub require_https: bool,
    /// Lock age reclaimed before every batch.
    pub stale_lock_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            require_https: true,
            stale_lock_timeout: DEFAULT_STALE_LOCK_TIMEOUT,
        }
    }
}

/// Vetoes a trigger firing before any work is done.
pub trait DispatchGuard: Send + Sync {
    /// `false` cancels the dispatch.
    fn should_dispatch(&self, trigger: &str, args: &[TriggerArg]) -> bool;
}

impl<F> DispatchGuard for F
where
    F: Fn(&str, &[TriggerArg]) -> bool + Send + Sync,
{
    fn should_dispatch(&self, trigger: &str, args: &[TriggerArg]) -> bool {
        self(trigger, args)
    }
}

/// Rewrites the canonical payload before per-destination processing.
pub trait PayloadFilter: Send + Sync {
    /// Returns the payload to use.
    fn filter(&self, trigger: &str, payload: Value) -> Value;
}

impl<F> PayloadFilter for F
where
    F: Fn(&str, Value) -> Value + Send + Sync,
{
    fn filter(&self, trigger: &str, payload: Value) -> Value {
        self(trigger, payload)
    }
}

/// Adds headers to outgoing requests.
pub trait HeaderInjector: Send + Sync {
    /// Appends or edits `headers` for one request.
    fn inject(
        &self,
        destination: &DestinationSnapshot,
        trigger: &str,
        headers: &mut Vec<(String, String)>,
    );
}

impl<F> HeaderInjector for F
where
    F: Fn(&DestinationSnapshot, &str, &mut Vec<(String, String)>) + Send + Sync,
{
    fn inject(
        &self,
        destination: &DestinationSnapshot,
        trigger: &str,
        headers: &mut Vec<(String, String)>,
    ) {
        self(destination, trigger, headers);
    }
}

/// Caller-supplied hooks, run in registration order.
#[derive(Clone, Default)]
pub struct Extensions {
    guards: Vec<Arc<dyn DispatchGuard>>,
    payload_filters: Vec<Arc<dyn PayloadFilter>>,
    header_injectors: Vec<Arc<dyn HeaderInjector>>,
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("guards", &self.guards.len())
            .field("payload_filters", &self.payload_filters.len())
            .field("header_injectors", &self.header_injectors.len())
            .finish()
    }
}

impl Extensions {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dispatch guard.
    #[must_use]
    pub fn with_guard(mut self, guard: impl DispatchGuard + 'static) -> Self {
        self.guards.push(Arc::new(guard));
        self
    }

    /// Registers a payload filter.
    #[must_use]
    pub fn with_payload_filter(mut self, filter: impl PayloadFilter + 'static) -> Self {
        self.payload_filters.push(Arc::new(filter));
        self
    }

    /// Registers a header injector.
    #[must_use]
    pub fn with_header_injector(mut self, injector: impl HeaderInjector + 'static) -> Self {
        self.header_injectors.push(Arc::new(injector));
        self
    }

    fn allows(&self, trigger: &str, args: &[TriggerArg]) -> bool {
        self.guards.iter().all(|guard| guard.should_dispatch(trigger, args))
    }

    fn filter_payload(&self, trigger: &str, payload: Value) -> Value {
        self.payload_filters.iter().fold(payload, |payload, filter| filter.filter(trigger, payload))
    }

    fn inject_headers(
        &self,
        destination: &DestinationSnapshot,
        trigger: &str,
        headers: &mut Vec<(String, String)>,
    ) {
        for injector in &self.header_injectors {
            injector.inject(destination, trigger, headers);
        }
    }
}

/// Dedup keys seen by one logical dispatch. Share a scope across calls to
/// extend deduplication over all of them.
#[derive(Debug, Default)]
pub struct DispatchScope {
    seen: HashSet<String>,
}

impl DispatchScope {
    /// Creates an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key`, returning `false` if it was already present.
    fn insert(&mut self, key: String) -> bool {
        self.seen.insert(key)
    }
}

/// Result of a trigger firing.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A guard cancelled the dispatch.
    Vetoed,
    /// No destination subscribes to the trigger.
    NoDestinations,
    /// Jobs were enqueued.
    Dispatched(DispatchReport),
}

impl DispatchOutcome {
    /// Jobs enqueued by this firing.
    pub fn jobs(&self) -> &[JobId] {
        match self {
            Self::Dispatched(report) => &report.jobs,
            Self::Vetoed | Self::NoDestinations => &[],
        }
    }
}

/// Per-firing counts.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// Identity shared by every job of this firing.
    pub event: EventIdentity,
    /// Enqueued jobs in destination order.
    pub jobs: Vec<JobId>,
    /// Destinations skipped as duplicates within the scope.
    pub duplicates: usize,
    /// Destinations skipped because they are disabled.
    pub disabled: usize,
    /// Destinations whose transform, log or enqueue step failed.
    pub failures: usize,
}

/// Counts for one `process_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Jobs this worker locked.
    pub processed: usize,
    /// Delivered.
    pub succeeded: usize,
    /// Permanently failed.
    pub failed: usize,
    /// Put back with backoff.
    pub rescheduled: usize,
    /// Locked but gone by the time they were read back.
    pub skipped: usize,
    /// Stale locks reclaimed before claiming.
    pub stale_cleaned: u64,
    /// Storage errors encountered. Affected jobs are left for a later batch.
    pub errors: usize,
}

/// What happened to one locked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delivered.
    Succeeded,
    /// Failed and due again at `scheduled_at`.
    Rescheduled {
        /// Next eligible time.
        scheduled_at: chrono::DateTime<chrono::Utc>,
    },
    /// No further attempts.
    PermanentlyFailed,
}

/// Result of one delivery attempt, before anything is persisted.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Destination answered 2xx.
    pub success: bool,
    /// Failure may succeed on a later attempt.
    pub should_retry: bool,
    /// HTTP status, if a response arrived.
    pub http_code: Option<u16>,
    /// Truncated response body, if a response arrived.
    pub response_body: Option<String>,
    /// Failure, absent on success.
    pub error: Option<DeliveryError>,
    /// Time spent in the transport.
    pub duration_ms: u64,
}

impl SendOutcome {
    fn rejected(error: DeliveryError) -> Self {
        Self {
            success: false,
            should_retry: error.is_retryable(),
            http_code: None,
            response_body: None,
            error: Some(error),
            duration_ms: 0,
        }
    }

    fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Dispatches events and delivers queued jobs.
#[derive(Clone)]
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: JobQueue,
    log: DeliveryLogService,
    transformer: PayloadTransformer,
    destinations: Arc<dyn DestinationDirectory>,
    transport: Arc<dyn HttpTransport>,
    event_handler: Arc<dyn EventHandler>,
    extensions: Extensions,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("log", &self.log)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher that publishes no delivery events.
    pub fn new(
        config: DispatcherConfig,
        queue: JobQueue,
        log: DeliveryLogService,
        transformer: PayloadTransformer,
        destinations: Arc<dyn DestinationDirectory>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            queue,
            log,
            transformer,
            destinations,
            transport,
            event_handler: Arc::new(NoOpEventHandler::new()),
            extensions: Extensions::default(),
            clock,
        }
    }

    /// Publishes delivery outcomes to `handler`.
    #[must_use]
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Installs caller hooks.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Underlying job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Underlying delivery log.
    pub fn log(&self) -> &DeliveryLogService {
        &self.log
    }

    /// Fires `trigger` once with a fresh dedup scope.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if destinations cannot be
    /// loaded. Failures for individual destinations are counted in the
    /// report instead.
    pub async fn dispatch(&self, trigger: &str, args: &[TriggerArg]) -> Result<DispatchOutcome> {
        let mut scope = DispatchScope::new();
        self.dispatch_in_scope(&mut scope, trigger, args).await
    }

    /// Fires `trigger`, skipping (trigger, destination, payload) triples
    /// already recorded in `scope`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if destinations cannot be
    /// loaded.
    pub async fn dispatch_in_scope(
        &self,
        scope: &mut DispatchScope,
        trigger: &str,
        args: &[TriggerArg],
    ) -> Result<DispatchOutcome> {
        if !self.extensions.allows(trigger, args) {
            debug!(trigger, "dispatch vetoed");
            return Ok(DispatchOutcome::Vetoed);
        }

        let destinations = self.destinations.find_by_trigger(trigger).await?;
        if destinations.is_empty() {
            debug!(trigger, "no destinations subscribed");
            return Ok(DispatchOutcome::NoDestinations);
        }

        let event = EventIdentity::new(self.clock.now_utc());
        let payload = self.canonical_payload(trigger, args, &event);
        let dedup_basis = dedup_basis(&payload);

        let mut report = DispatchReport {
            event: event.clone(),
            jobs: Vec::with_capacity(destinations.len()),
            duplicates: 0,
            disabled: 0,
            failures: 0,
        };

        for destination in &destinations {
            if !destination.enabled {
                report.disabled += 1;
                continue;
            }

            let key = dedup_key(trigger, &destination.id.to_string(), &dedup_basis);
            if !scope.insert(key) {
                debug!(trigger, destination_id = %destination.id, "duplicate dispatch skipped");
                report.duplicates += 1;
                continue;
            }

            let snapshot = DestinationSnapshot::from(destination);
            match self.enqueue_for(&snapshot, trigger, &payload, args, &event).await {
                Ok(job_id) => report.jobs.push(job_id),
                Err(e) => {
                    error!(
                        trigger,
                        destination_id = %destination.id,
                        error = %e,
                        "failed to enqueue delivery"
                    );
                    report.failures += 1;
                },
            }
        }

        info!(
            trigger,
            event_id = %event.id,
            enqueued = report.jobs.len(),
            duplicates = report.duplicates,
            failures = report.failures,
            "event dispatched"
        );

        Ok(DispatchOutcome::Dispatched(report))
    }

    fn canonical_payload(
        &self,
        trigger: &str,
        args: &[TriggerArg],
        event: &EventIdentity,
    ) -> Value {
        let payload = json!({
            "event": {
                "id": event.id,
                "timestamp": event.timestamp.to_rfc3339(),
                "version": event.version,
            },
            "hook": trigger,
            "args": normalize_args(args),
            "timestamp": event.timestamp.timestamp(),
            "site": { "url": self.config.site_url },
        });

        self.extensions.filter_payload(trigger, payload)
    }

    async fn enqueue_for(
        &self,
        destination: &DestinationSnapshot,
        trigger: &str,
        payload: &Value,
        args: &[TriggerArg],
        event: &EventIdentity,
    ) -> Result<JobId> {
        let outcome = self.transformer.transform(destination.id, trigger, payload, args).await?;

        let log_id = self
            .log
            .log_pending(NewDeliveryLog {
                destination_id: destination.id,
                trigger_name: trigger.to_string(),
                request_payload: outcome.transformed.clone(),
                original_payload: outcome.original.clone(),
                mapping_applied: outcome.mapping_applied,
                event: Some(event.clone()),
            })
            .await?;

        let envelope = JobEnvelope {
            destination: destination.clone(),
            payload: outcome.transformed,
            original_payload: outcome.original,
            mapping_applied: outcome.mapping_applied,
            event: event.clone(),
        };

        let enqueued = match envelope.encode() {
            Ok(encoded) => {
                self.queue.enqueue(destination.id, trigger, encoded, None, Some(log_id)).await
            },
            Err(e) => Err(e),
        };

        match enqueued {
            Ok(job_id) => Ok(job_id),
            Err(e) => {
                let update = LogUpdate::status(LogStatus::Error).with_error(Some(e.to_string()));
                if let Err(log_error) = self.log.update(log_id, update).await {
                    error!(log_id = %log_id, error = %log_error, "failed to record enqueue error");
                }
                Err(e)
            },
        }
    }

    /// Reclaims stale locks, then delivers up to `batch_size` due jobs in
    /// order. Never fails; storage errors are logged and counted.
    pub async fn process_batch(&self, batch_size: usize) -> BatchSummary {
        let mut summary = BatchSummary::default();

        match self.queue.cleanup_stale(self.config.stale_lock_timeout).await {
            Ok(reclaimed) => summary.stale_cleaned = reclaimed,
            Err(e) => {
                error!(error = %e, "stale lock cleanup failed");
                summary.errors += 1;
            },
        }

        let jobs = match self.queue.claim_batch(batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to claim due jobs");
                summary.errors += 1;
                return summary;
            },
        };

        let lock_token = Uuid::new_v4().to_string();

        for candidate in jobs {
            match self.queue.lock(candidate.id, &lock_token).await {
                Ok(true) => {},
                Ok(false) => continue,
                Err(e) => {
                    error!(job_id = %candidate.id, error = %e, "failed to lock job");
                    summary.errors += 1;
                    continue;
                },
            }
            summary.processed += 1;

            let job = match self.queue.find(candidate.id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(job_id = %candidate.id, "job vanished after lock");
                    summary.skipped += 1;
                    continue;
                },
                Err(e) => {
                    error!(job_id = %candidate.id, error = %e, "failed to reload locked job");
                    summary.errors += 1;
                    self.release_after_error(candidate.id).await;
                    continue;
                },
            };

            match self.deliver_locked(&job).await {
                Ok(JobOutcome::Succeeded) => summary.succeeded += 1,
                Ok(JobOutcome::Rescheduled { .. }) => summary.rescheduled += 1,
                Ok(JobOutcome::PermanentlyFailed) => summary.failed += 1,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to record delivery outcome");
                    summary.errors += 1;
                    self.release_after_error(job.id).await;
                },
            }
        }

        if summary.processed > 0 || summary.stale_cleaned > 0 {
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                rescheduled = summary.rescheduled,
                failed = summary.failed,
                stale_cleaned = summary.stale_cleaned,
                "batch processed"
            );
        }

        summary
    }

    /// Delivers one job immediately, regardless of its schedule.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::JobNotFound` for unknown jobs,
    /// `DeliveryError::InvalidJobState` for processing or completed jobs or
    /// when another worker holds the lock, and `DeliveryError::DatabaseError`
    /// if storage fails.
    pub async fn execute_job(&self, job_id: JobId) -> Result<JobOutcome> {
        let job = self
            .queue
            .find(job_id)
            .await?
            .ok_or_else(|| DeliveryError::JobNotFound { job_id: job_id.to_string() })?;

        if matches!(job.status, JobStatus::Processing | JobStatus::Completed) {
            return Err(DeliveryError::InvalidJobState {
                job_id: job_id.to_string(),
                status: job.status.to_string(),
            });
        }

        if !self.queue.lock(job_id, &Uuid::new_v4().to_string()).await? {
            return Err(DeliveryError::InvalidJobState {
                job_id: job_id.to_string(),
                status: "locked".to_string(),
            });
        }

        info!(job_id = %job_id, trigger = %job.trigger_name, "executing job on demand");
        self.deliver_locked(&job).await
    }

    /// Posts an envelope's payload to its destination and classifies the
    /// result. Nothing is persisted.
    pub async fn send_to_webhook(
        &self,
        envelope: &JobEnvelope,
        trigger: &str,
        log_id: Option<LogId>,
        attempt_number: u32,
    ) -> SendOutcome {
        let destination = &envelope.destination;

        if let Err(e) = self.validate_endpoint(&destination.endpoint_url) {
            warn!(destination_id = %destination.id, error = %e, "endpoint rejected");
            return SendOutcome::rejected(e);
        }

        let body = match envelope.body() {
            Ok(body) => Bytes::from(body),
            Err(e) => return SendOutcome::rejected(e),
        };

        let request = TransportRequest {
            url: destination.endpoint_url.clone(),
            headers: self.build_headers(envelope, trigger, attempt_number),
            body,
            event_id: Some(envelope.event.id),
            attempt_number,
        };

        debug!(
            destination_id = %destination.id,
            log_id = ?log_id,
            attempt = attempt_number,
            "sending webhook"
        );

        let start = self.clock.now();
        let result = self.transport.send(request).await;
        let duration = self.clock.now().saturating_duration_since(start);
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(response) if response.is_success() => SendOutcome {
                success: true,
                should_retry: false,
                http_code: Some(response.status_code),
                response_body: Some(response.body),
                error: None,
                duration_ms,
            },
            Ok(response) => {
                let error = DeliveryError::from_status(response.status_code, response.body.clone());
                SendOutcome {
                    success: false,
                    should_retry: error.is_retryable(),
                    http_code: Some(response.status_code),
                    response_body: Some(response.body),
                    error: Some(error),
                    duration_ms,
                }
            },
            Err(error) => SendOutcome {
                success: false,
                should_retry: error.is_retryable(),
                http_code: None,
                response_body: None,
                error: Some(error),
                duration_ms,
            },
        }
    }

    fn validate_endpoint(&self, endpoint_url: &str) -> Result<()> {
        if endpoint_url.trim().is_empty() {
            return Err(DeliveryError::configuration("Empty endpoint URL"));
        }

        let url = reqwest::Url::parse(endpoint_url)
            .map_err(|_| DeliveryError::configuration("Invalid URL format"))?;

        match url.scheme() {
            "https" => Ok(()),
            "http" if !self.config.require_https => Ok(()),
            "http" => Err(DeliveryError::configuration("HTTPS is required for webhook URLs")),
            _ => Err(DeliveryError::configuration("Invalid URL format")),
        }
    }

    fn build_headers(
        &self,
        envelope: &JobEnvelope,
        trigger: &str,
        attempt_number: u32,
    ) -> Vec<(String, String)> {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];

        if let Some(auth) = envelope.destination.auth_header.as_deref().filter(|v| !v.is_empty()) {
            headers.push(("Authorization".to_string(), auth.to_string()));
        }

        headers.push(("X-Event-Id".to_string(), envelope.event.id.to_string()));
        headers.push(("X-Event-Timestamp".to_string(), envelope.event.timestamp.to_rfc3339()));
        headers.push(("X-Event-Trigger".to_string(), trigger.to_string()));
        headers.push(("X-Delivery-Attempt".to_string(), attempt_number.to_string()));

        self.extensions.inject_headers(&envelope.destination, trigger, &mut headers);
        headers
    }

    async fn deliver_locked(&self, job: &QueueJob) -> Result<JobOutcome> {
        let attempt_number = u32::try_from(job.attempts).unwrap_or(0).saturating_add(1);

        let envelope = match JobEnvelope::decode(&job.envelope) {
            Ok(envelope) => envelope,
            Err(e) => {
                let outcome = SendOutcome::rejected(e);
                self.fail_permanently(job, None, attempt_number, &outcome).await?;
                return Ok(JobOutcome::PermanentlyFailed);
            },
        };

        let outcome =
            self.send_to_webhook(&envelope, &job.trigger_name, job.log_id, attempt_number).await;

        if outcome.success {
            self.complete(job, &envelope, attempt_number, &outcome).await?;
            return Ok(JobOutcome::Succeeded);
        }

        if !outcome.should_retry {
            self.fail_permanently(job, Some(&envelope), attempt_number, &outcome).await?;
            return Ok(JobOutcome::PermanentlyFailed);
        }

        match self.queue.reschedule_with_backoff(job.id).await? {
            RescheduleOutcome::Rescheduled { scheduled_at, attempts } => {
                warn!(
                    job_id = %job.id,
                    attempts,
                    next_attempt_at = %scheduled_at,
                    error = %outcome.error_message().unwrap_or_default(),
                    "delivery failed, retry scheduled"
                );

                let update = LogUpdate::status(LogStatus::Retry)
                    .with_http_code(outcome.http_code)
                    .with_response_body(outcome.response_body.clone())
                    .with_error(outcome.error_message())
                    .with_duration_ms(outcome.duration_ms)
                    .with_next_attempt_at(Some(scheduled_at));
                self.record_attempt(job.log_id, update, attempt_number, LogStatus::Retry, &outcome)
                    .await;

                self.publish_failure(
                    job,
                    Some(&envelope),
                    attempt_number,
                    &outcome,
                    Some(scheduled_at),
                )
                .await;

                Ok(JobOutcome::Rescheduled { scheduled_at })
            },
            RescheduleOutcome::Exhausted { attempts } => {
                warn!(
                    job_id = %job.id,
                    reason = %DeliveryError::retries_exhausted(attempts),
                    "retry budget spent"
                );
                self.fail_permanently(job, Some(&envelope), attempt_number, &outcome).await?;
                Ok(JobOutcome::PermanentlyFailed)
            },
        }
    }

    async fn complete(
        &self,
        job: &QueueJob,
        envelope: &JobEnvelope,
        attempt_number: u32,
        outcome: &SendOutcome,
    ) -> Result<()> {
        self.queue.mark_completed(job.id).await?;

        info!(
            job_id = %job.id,
            destination_id = %job.destination_id,
            status_code = outcome.http_code.unwrap_or_default(),
            duration_ms = outcome.duration_ms,
            attempt = attempt_number,
            "webhook delivered"
        );

        let update = LogUpdate::status(LogStatus::Success)
            .with_http_code(outcome.http_code)
            .with_response_body(outcome.response_body.clone())
            .with_duration_ms(outcome.duration_ms)
            .with_next_attempt_at(None);
        self.record_attempt(job.log_id, update, attempt_number, LogStatus::Success, outcome).await;

        self.event_handler
            .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                job_id: job.id,
                log_id: job.log_id,
                destination_id: job.destination_id,
                trigger_name: job.trigger_name.clone(),
                endpoint_url: envelope.destination.endpoint_url.clone(),
                event_uuid: envelope.event.id,
                response_status: outcome.http_code.unwrap_or_default(),
                attempt_number,
                delivered_at: self.clock.now_utc(),
                duration_ms: outcome.duration_ms,
            }))
            .await;

        Ok(())
    }

    async fn fail_permanently(
        &self,
        job: &QueueJob,
        envelope: Option<&JobEnvelope>,
        attempt_number: u32,
        outcome: &SendOutcome,
    ) -> Result<()> {
        self.queue.mark_permanently_failed(job.id).await?;

        let category = outcome.error.as_ref().map(ErrorCategory::from);
        error!(
            job_id = %job.id,
            destination_id = %job.destination_id,
            attempt = attempt_number,
            category = ?category,
            error = %outcome.error_message().unwrap_or_default(),
            "delivery permanently failed"
        );

        let update = LogUpdate::status(LogStatus::PermanentlyFailed)
            .with_http_code(outcome.http_code)
            .with_response_body(outcome.response_body.clone())
            .with_error(outcome.error_message())
            .with_duration_ms(outcome.duration_ms)
            .with_next_attempt_at(None);
        self.record_attempt(
            job.log_id,
            update,
            attempt_number,
            LogStatus::PermanentlyFailed,
            outcome,
        )
        .await;

        self.publish_failure(job, envelope, attempt_number, outcome, None).await;
        Ok(())
    }

    /// Updates the log row and appends the attempt. Log failures are logged
    /// and do not change the job's outcome.
    async fn record_attempt(
        &self,
        log_id: Option<LogId>,
        update: LogUpdate,
        attempt_number: u32,
        status: LogStatus,
        outcome: &SendOutcome,
    ) {
        let Some(log_id) = log_id else {
            return;
        };

        if let Err(e) = self.log.update(log_id, update).await {
            error!(log_id = %log_id, error = %e, "failed to update delivery log");
        }

        let record = AttemptRecord {
            attempt: attempt_number,
            attempted_at: self.clock.now_utc(),
            http_code: outcome.http_code,
            status,
            error_message: outcome.error_message(),
            duration_ms: outcome.duration_ms,
            should_retry: outcome.should_retry,
        };
        if let Err(e) = self.log.append_attempt_history(log_id, record).await {
            error!(log_id = %log_id, error = %e, "failed to append attempt history");
        }
    }

    async fn publish_failure(
        &self,
        job: &QueueJob,
        envelope: Option<&JobEnvelope>,
        attempt_number: u32,
        outcome: &SendOutcome,
        next_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        self.event_handler
            .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                job_id: job.id,
                log_id: job.log_id,
                destination_id: job.destination_id,
                trigger_name: job.trigger_name.clone(),
                endpoint_url: envelope.map(|e| e.destination.endpoint_url.clone()),
                event_uuid: envelope.map(|e| e.event.id),
                response_status: outcome.http_code,
                attempt_number,
                failed_at: self.clock.now_utc(),
                error_message: outcome.error_message().unwrap_or_default(),
                is_retryable: outcome.should_retry,
                next_attempt_at,
            }))
            .await;
    }

    async fn release_after_error(&self, job_id: JobId) {
        if let Err(e) = self.queue.unlock(job_id).await {
            warn!(
                job_id = %job_id,
                error = %e,
                "failed to release job, stale cleanup will reclaim it"
            );
        }
    }
}

/// Canonical payload without the per-firing identity, so repeated firings
/// of the same data in one scope hash alike.
fn dedup_basis(payload: &Value) -> String {
    match payload {
        Value::Object(object) => {
            let mut object = object.clone();
            object.remove("event");
            Value::Object(object).to_string()
        },
        other => other.to_string(),
    }
}

fn dedup_key(trigger: &str, destination: &str, basis: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trigger.as_bytes());
    hasher.update(b"|");
    hasher.update(destination.as_bytes());
    hasher.update(b"|");
    hasher.update(basis.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_ignores_event_identity() {
        let a = json!({"event": {"id": "a"}, "hook": "save_post", "args": [1]});
        let b = json!({"event": {"id": "b"}, "hook": "save_post", "args": [1]});
        let c = json!({"event": {"id": "a"}, "hook": "save_post", "args": [2]});

        let key = |payload: &Value| dedup_key("save_post", "dest", &dedup_basis(payload));

        assert_eq!(key(&a), key(&b));
        assert_ne!(key(&a), key(&c));
        assert_eq!(key(&a).len(), 64);
    }

    #[test]
    fn dedup_key_separates_destinations() {
        let basis = dedup_basis(&json!({"hook": "t"}));
        assert_ne!(dedup_key("t", "a", &basis), dedup_key("t", "b", &basis));
    }

    #[test]
    fn extensions_run_in_order() {
        let extensions = Extensions::new()
            .with_payload_filter(|_: &str, mut payload: Value| {
                payload["steps"] = json!(["first"]);
                payload
            })
            .with_payload_filter(|_: &str, mut payload: Value| {
                if let Some(steps) = payload["steps"].as_array_mut() {
                    steps.push(json!("second"));
                }
                payload
            });

        let filtered = extensions.filter_payload("t", json!({}));

        assert_eq!(filtered, json!({"steps": ["first", "second"]}));
    }

    #[test]
    fn any_guard_can_veto() {
        let extensions = Extensions::new()
            .with_guard(|_: &str, _: &[TriggerArg]| true)
            .with_guard(|trigger: &str, _: &[TriggerArg]| trigger != "blocked");

        assert!(extensions.allows("save_post", &[]));
        assert!(!extensions.allows("blocked", &[]));
    }
}
