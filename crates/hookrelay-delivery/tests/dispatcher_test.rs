//! Integration tests for dispatch and batch processing.
//!
//! Every test runs against in-memory storage and a scripted transport so
//! retry schedules can be checked with a manual clock.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use std::time::Duration;

use common::{actor, Harness};
use hookrelay_core::{
    events::DeliveryEvent,
    models::{
        FieldMapping, JobStatus, LogStatus, MappingRule, QueueJob, TriggerSchema,
    },
    time::Clock,
};
use hookrelay_delivery::{
    client::mock::MockTransport,
    dispatcher::{DispatchOutcome, DispatchScope, DispatcherConfig, Extensions, JobOutcome},
    envelope::{DestinationSnapshot, JobEnvelope},
    transform::{HostEntity, InMemoryActorDirectory, TriggerArg},
    DeliveryError,
};
use serde_json::{json, Value};
use sqlx::types::Json;

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[tokio::test]
async fn retries_with_backoff_until_budget_is_spent() {
    let harness = Harness::builder()
        .max_attempts(3)
        .transport(MockTransport::always(503, "unavailable"))
        .build();
    harness.destination("https://example.com/hook", &["T"]).await;

    let outcome = harness.dispatcher.dispatch("T", &[]).await.unwrap();
    let job_id = outcome.jobs()[0];

    let job = harness.storage.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    let log_id = job.log_id.expect("job is linked to its log row");
    assert_eq!(harness.storage.log(log_id).await.unwrap().status, LogStatus::Pending);

    // First failure: 30s backoff.
    let start = harness.clock.now_utc();
    let summary = harness.dispatcher.process_batch(1).await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.rescheduled, 1);

    let job = harness.storage.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.scheduled_at, start + secs(30));
    assert!(!job.is_locked());

    let log = harness.storage.log(log_id).await.unwrap();
    assert_eq!(log.status, LogStatus::Retry);
    assert_eq!(log.http_code, Some(503));
    assert_eq!(log.next_attempt_at, Some(start + secs(30)));
    assert_eq!(log.error_message.as_deref(), Some("HTTP 503: unavailable"));

    // Not due yet.
    assert_eq!(harness.dispatcher.process_batch(1).await.processed, 0);

    // Second failure: 60s backoff.
    harness.clock.advance(Duration::from_secs(30));
    let second = harness.clock.now_utc();
    harness.dispatcher.process_batch(1).await;
    let job = harness.storage.job(job_id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.scheduled_at, second + secs(60));

    // Third failure exhausts the budget.
    harness.clock.advance(Duration::from_secs(60));
    let summary = harness.dispatcher.process_batch(1).await;
    assert_eq!(summary.failed, 1);

    let job = harness.storage.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::PermanentlyFailed);
    assert_eq!(job.attempts, 3);

    let log = harness.storage.log(log_id).await.unwrap();
    assert_eq!(log.status, LogStatus::PermanentlyFailed);
    assert_eq!(log.next_attempt_at, None);
    let history = log.attempts();
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(history.iter().all(|a| a.http_code == Some(503)));
    assert_eq!(history[2].status, LogStatus::PermanentlyFailed);

    let events = harness.events.events().await;
    assert_eq!(events.len(), 3);
    match events.last().unwrap() {
        DeliveryEvent::Failed(failed) => {
            assert!(failed.is_final());
            assert_eq!(failed.attempt_number, 3);
        },
        other => panic!("expected failure event, got {other:?}"),
    }
}

#[tokio::test]
async fn successful_delivery_completes_job_and_log() {
    let harness = Harness::new();
    harness.destination("https://example.com/hook", &["save_post"]).await;

    let outcome = harness.dispatcher.dispatch("save_post", &[json!(42).into()]).await.unwrap();
    let job_id = outcome.jobs()[0];

    let summary = harness.dispatcher.process_batch(10).await;
    assert_eq!(summary.succeeded, 1);

    let job = harness.storage.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.is_locked());

    let log = harness.storage.log(job.log_id.unwrap()).await.unwrap();
    assert_eq!(log.status, LogStatus::Success);
    assert_eq!(log.http_code, Some(200));
    assert_eq!(log.response_body.as_deref(), Some("OK"));
    assert_eq!(log.attempts().len(), 1);

    let events = harness.events.events().await;
    assert!(matches!(events.as_slice(), [DeliveryEvent::Succeeded(e)] if e.response_status == 200));
}

#[tokio::test]
async fn canonical_payload_shares_event_identity_across_destinations() {
    let harness = Harness::new();
    harness.destination("https://a.example.com/hook", &["save_post"]).await;
    harness.destination("https://b.example.com/hook", &["save_post"]).await;

    let outcome = harness
        .dispatcher
        .dispatch("save_post", &[json!(7).into(), json!({"draft": false}).into()])
        .await
        .unwrap();

    let DispatchOutcome::Dispatched(report) = outcome else {
        panic!("expected dispatch");
    };
    assert_eq!(report.jobs.len(), 2);

    let logs = harness.storage.logs().await;
    assert_eq!(logs.len(), 2);
    for log in &logs {
        assert_eq!(log.event_uuid, Some(report.event.id));
        let payload = &log.request_payload.0;
        assert_eq!(payload["hook"], json!("save_post"));
        assert_eq!(payload["args"], json!([7, {"draft": false}]));
        assert_eq!(payload["site"]["url"], json!("https://site.test"));
        assert_eq!(payload["event"]["id"], json!(report.event.id));
        assert_eq!(payload["timestamp"], json!(report.event.timestamp.timestamp()));
    }
}

#[tokio::test]
async fn duplicate_destination_enqueues_once() {
    let harness = Harness::new();
    let destination = harness.destination("https://example.com/hook", &["T"]).await;
    harness.storage.add_destination(destination).await;

    let outcome = harness.dispatcher.dispatch("T", &[]).await.unwrap();

    let DispatchOutcome::Dispatched(report) = outcome else {
        panic!("expected dispatch");
    };
    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(harness.storage.jobs().await.len(), 1);
}

#[tokio::test]
async fn shared_scope_deduplicates_repeated_firings() {
    let harness = Harness::new();
    harness.destination("https://example.com/hook", &["T"]).await;
    let mut scope = DispatchScope::new();

    let dispatcher = &harness.dispatcher;
    let first = dispatcher.dispatch_in_scope(&mut scope, "T", &[json!(1).into()]).await.unwrap();
    let second = dispatcher.dispatch_in_scope(&mut scope, "T", &[json!(1).into()]).await.unwrap();
    let different =
        dispatcher.dispatch_in_scope(&mut scope, "T", &[json!(2).into()]).await.unwrap();

    assert_eq!(first.jobs().len(), 1);
    assert!(second.jobs().is_empty());
    assert_eq!(different.jobs().len(), 1);
}

#[tokio::test]
async fn malformed_envelope_fails_without_sending() {
    let harness = Harness::new();
    let destination = harness.destination("https://example.com/hook", &["T"]).await;
    let now = harness.clock.now_utc();
    let job = QueueJob::new(destination.id, "T", "{\"payload\": ", 5, now, None, now);
    let job_id = job.id;
    harness.storage.put_job(job).await;

    let summary = harness.dispatcher.process_batch(10).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(harness.transport.request_count().await, 0);
    assert_eq!(harness.storage.job(job_id).await.unwrap().status, JobStatus::PermanentlyFailed);

    let events = harness.events.events().await;
    match events.as_slice() {
        [DeliveryEvent::Failed(failed)] => {
            assert!(failed.error_message.starts_with("Invalid job payload"));
            assert_eq!(failed.endpoint_url, None);
        },
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn client_error_fails_permanently_without_consuming_an_attempt() {
    let harness = Harness::builder().transport(MockTransport::always(404, "not found")).build();
    harness.destination("https://example.com/hook", &["T"]).await;
    let job_id = harness.dispatcher.dispatch("T", &[]).await.unwrap().jobs()[0];

    let summary = harness.dispatcher.process_batch(10).await;

    assert_eq!(summary.failed, 1);
    let job = harness.storage.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::PermanentlyFailed);
    assert_eq!(job.attempts, 0);

    let log = harness.storage.log(job.log_id.unwrap()).await.unwrap();
    assert_eq!(log.status, LogStatus::PermanentlyFailed);
    assert_eq!(log.http_code, Some(404));
    assert_eq!(log.error_message.as_deref(), Some("HTTP 404: not found"));
    assert!(!log.attempts()[0].should_retry);
}

#[tokio::test]
async fn rate_limit_and_transport_errors_are_retried() {
    let harness = Harness::new();
    harness.destination("https://example.com/hook", &["T"]).await;
    harness.transport.push_response(429, "slow down").await;
    harness.transport.push_error(DeliveryError::timeout(5)).await;
    let job_id = harness.dispatcher.dispatch("T", &[]).await.unwrap().jobs()[0];

    assert_eq!(harness.dispatcher.process_batch(10).await.rescheduled, 1);
    harness.clock.advance(Duration::from_secs(30));
    assert_eq!(harness.dispatcher.process_batch(10).await.rescheduled, 1);
    harness.clock.advance(Duration::from_secs(60));
    assert_eq!(harness.dispatcher.process_batch(10).await.succeeded, 1);

    let log_id = harness.storage.job(job_id).await.unwrap().log_id.unwrap();
    let log = harness.storage.log(log_id).await.unwrap();
    let codes: Vec<Option<u16>> = log.attempts().iter().map(|a| a.http_code).collect();
    assert_eq!(codes, vec![Some(429), None, Some(200)]);
    assert_eq!(log.status, LogStatus::Success);
}

#[tokio::test]
async fn guard_can_veto_dispatch() {
    let extensions = Extensions::new()
        .with_guard(|trigger: &str, _: &[TriggerArg]| !trigger.starts_with("private_"));
    let harness = Harness::builder().extensions(extensions).build();
    harness.destination("https://example.com/hook", &["private_note"]).await;

    let outcome = harness.dispatcher.dispatch("private_note", &[]).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Vetoed);
    assert!(harness.storage.jobs().await.is_empty());
}

#[tokio::test]
async fn unsubscribed_trigger_has_no_destinations() {
    let harness = Harness::new();
    harness.destination("https://example.com/hook", &["save_post"]).await;

    let outcome = harness.dispatcher.dispatch("delete_post", &[]).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::NoDestinations);
}

#[tokio::test]
async fn disabled_destinations_are_skipped() {
    let harness = Harness::new();
    let mut destination =
        hookrelay_core::models::Destination::new("off", "https://example.com/off", ["T"]);
    destination.enabled = false;
    harness.storage.add_destination(destination).await;
    harness.destination("https://example.com/on", &["T"]).await;

    let DispatchOutcome::Dispatched(report) = harness.dispatcher.dispatch("T", &[]).await.unwrap()
    else {
        panic!("expected dispatch");
    };

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.disabled, 1);
}

#[tokio::test]
async fn request_carries_auth_correlation_and_injected_headers() {
    let extensions = Extensions::new().with_header_injector(
        |destination: &DestinationSnapshot, _: &str, headers: &mut Vec<(String, String)>| {
            headers.push(("X-Destination".to_string(), destination.name.clone()));
        },
    );
    let harness = Harness::builder().extensions(extensions).build();
    let destination =
        hookrelay_core::models::Destination::new("crm", "https://example.com/hook", ["T"])
            .with_auth_header("Bearer token-1");
    harness.storage.add_destination(destination).await;

    let DispatchOutcome::Dispatched(report) = harness.dispatcher.dispatch("T", &[]).await.unwrap()
    else {
        panic!("expected dispatch");
    };
    harness.dispatcher.process_batch(10).await;

    let requests = harness.transport.requests().await;
    let request = &requests[0];
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("Authorization"), Some("Bearer token-1"));
    assert_eq!(request.header("X-Event-Id"), Some(report.event.id.to_string().as_str()));
    assert_eq!(request.header("X-Delivery-Attempt"), Some("1"));
    assert_eq!(request.header("X-Destination"), Some("crm"));

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["hook"], json!("T"));
}

#[tokio::test]
async fn plain_http_is_refused_when_https_is_required() {
    let harness = Harness::new();
    harness.destination("http://example.com/hook", &["T"]).await;
    let job_id = harness.dispatcher.dispatch("T", &[]).await.unwrap().jobs()[0];

    let summary = harness.dispatcher.process_batch(10).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(harness.transport.request_count().await, 0);
    let job = harness.storage.job(job_id).await.unwrap();
    let log = harness.storage.log(job.log_id.unwrap()).await.unwrap();
    assert!(log.error_message.unwrap().contains("HTTPS is required"));
}

#[tokio::test]
async fn plain_http_is_allowed_when_policy_is_relaxed() {
    let harness = Harness::builder()
        .dispatcher_config(DispatcherConfig { require_https: false, ..DispatcherConfig::default() })
        .build();
    harness.destination("http://localhost:8080/hook", &["T"]).await;
    harness.dispatcher.dispatch("T", &[]).await.unwrap();

    assert_eq!(harness.dispatcher.process_batch(10).await.succeeded, 1);
}

#[tokio::test]
async fn send_to_webhook_rejects_malformed_urls() {
    let harness = Harness::new();
    let destination = hookrelay_core::models::Destination::new("bad", "not a url", ["T"]);
    let envelope = JobEnvelope {
        destination: DestinationSnapshot::from(&destination),
        payload: json!({}),
        original_payload: None,
        mapping_applied: false,
        event: hookrelay_core::models::EventIdentity::new(harness.clock.now_utc()),
    };

    let outcome = harness.dispatcher.send_to_webhook(&envelope, "T", None, 1).await;

    assert!(!outcome.success);
    assert!(!outcome.should_retry);
    assert_eq!(outcome.error.unwrap().to_string(), "invalid configuration: Invalid URL format");
    assert_eq!(harness.transport.request_count().await, 0);
}

#[tokio::test]
async fn field_mapping_is_applied_and_original_kept() {
    let harness = Harness::new();
    let destination = harness.destination("https://example.com/hook", &["save_post"]).await;
    let mut schema = TriggerSchema::new(destination.id, "save_post", harness.clock.now_utc());
    schema.field_mapping = Some(Json(FieldMapping {
        mappings: vec![MappingRule::new("args.0", "post_id")],
        excluded: vec!["site".to_string(), "event".to_string()],
        include_unmapped: true,
    }));
    harness.storage.add_schema(schema).await;

    harness.dispatcher.dispatch("save_post", &[json!(99).into()]).await.unwrap();
    harness.dispatcher.process_batch(10).await;

    let log = &harness.storage.logs().await[0];
    assert!(log.mapping_applied);
    assert_eq!(log.request_payload.0["post_id"], json!(99));
    assert!(log.request_payload.0.get("site").is_none());
    assert_eq!(log.original_payload.as_ref().unwrap().0["args"], json!([99]));

    let body: Value = serde_json::from_slice(&harness.transport.requests().await[0].body).unwrap();
    assert_eq!(body, log.request_payload.0);

    let schema = harness.storage.schema(destination.id, "save_post").await.unwrap();
    assert!(schema.example_payload.is_some());
}

#[tokio::test]
async fn login_payload_is_enriched_with_actor() {
    let alice = actor(5, "alice");
    let harness = Harness::builder()
        .actors(InMemoryActorDirectory::new().with_actor(alice.clone()))
        .build();
    let destination = harness.destination("https://example.com/hook", &["wp_login"]).await;
    let mut schema = TriggerSchema::new(destination.id, "wp_login", harness.clock.now_utc());
    schema.include_user_data = true;
    harness.storage.add_schema(schema).await;

    let args = [json!("alice").into(), TriggerArg::Entity(HostEntity::actor("WP_User", alice))];
    harness.dispatcher.dispatch("wp_login", &args).await.unwrap();

    let log = &harness.storage.logs().await[0];
    assert!(log.mapping_applied);
    assert_eq!(log.request_payload.0["user"]["login"], json!("alice"));
    assert_eq!(log.request_payload.0["args"][1], json!({"__type": "WP_User", "id": 5}));
}

#[tokio::test]
async fn execute_job_runs_failed_jobs_on_demand() {
    let harness = Harness::new();
    harness.destination("https://example.com/hook", &["T"]).await;
    harness.transport.push_response(400, "bad").await;
    let job_id = harness.dispatcher.dispatch("T", &[]).await.unwrap().jobs()[0];
    harness.dispatcher.process_batch(10).await;
    assert_eq!(harness.storage.job(job_id).await.unwrap().status, JobStatus::PermanentlyFailed);

    let outcome = harness.dispatcher.execute_job(job_id).await.unwrap();

    assert_eq!(outcome, JobOutcome::Succeeded);
    assert_eq!(harness.storage.job(job_id).await.unwrap().status, JobStatus::Completed);

    let again = harness.dispatcher.execute_job(job_id).await.unwrap_err();
    assert!(matches!(again, DeliveryError::InvalidJobState { .. }));
}

#[tokio::test]
async fn execute_job_of_unknown_job_is_not_found() {
    let harness = Harness::new();

    let error =
        harness.dispatcher.execute_job(hookrelay_core::models::JobId::new()).await.unwrap_err();

    assert!(matches!(error, DeliveryError::JobNotFound { .. }));
}

#[tokio::test]
async fn claim_errors_are_counted_not_raised() {
    let harness = Harness::new();
    harness.storage.inject_claim_error("connection reset").await;

    let summary = harness.dispatcher.process_batch(10).await;

    assert_eq!(summary.errors, 1);
    assert_eq!(summary.processed, 0);
}

#[tokio::test]
async fn stale_locks_are_reclaimed_before_claiming() {
    let harness = Harness::new();
    harness.destination("https://example.com/hook", &["T"]).await;
    let job_id = harness.dispatcher.dispatch("T", &[]).await.unwrap().jobs()[0];
    assert!(harness.dispatcher.queue().lock(job_id, "crashed-worker").await.unwrap());

    harness.clock.advance(Duration::from_secs(6 * 60));
    let summary = harness.dispatcher.process_batch(10).await;

    assert_eq!(summary.stale_cleaned, 1);
    assert_eq!(summary.succeeded, 1);
}
