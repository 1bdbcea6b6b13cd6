//! Repository tests against a real PostgreSQL instance.
//!
//! Set `DATABASE_URL` to run them; without it every test returns early.
//! Rows use fresh ids, so the tests share one database safely.

#![allow(clippy::unwrap_used)]

use chrono::{DateTime, Duration, SubsecRound, Utc};
use hookrelay_core::{
    models::{
        AttemptRecord, DestinationId, JobStatus, LogStatus, LogUpdate, NewDeliveryLog, QueueJob,
    },
    Storage,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use uuid::Uuid;

static MIGRATED: Mutex<bool> = Mutex::const_new(false);

async fn storage() -> Option<Storage> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(&url).await.unwrap();
    let storage = Storage::new(pool);

    let mut migrated = MIGRATED.lock().await;
    if !*migrated {
        storage.migrate().await.unwrap();
        *migrated = true;
    }

    Some(storage)
}

/// Postgres keeps microseconds; whole seconds compare cleanly.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

async fn insert_job(storage: &Storage, scheduled_at: DateTime<Utc>) -> QueueJob {
    let job = QueueJob::new(DestinationId::new(), "save_post", "{}", 5, scheduled_at, None, now());
    storage.queue_jobs.insert(&job).await.unwrap();
    job
}

fn attempt(number: u32, attempted_at: DateTime<Utc>) -> AttemptRecord {
    AttemptRecord {
        attempt: number,
        attempted_at,
        http_code: Some(500),
        status: LogStatus::Retry,
        error_message: Some(format!("HTTP 500 on attempt {number}")),
        duration_ms: 12,
        should_retry: true,
    }
}

#[tokio::test]
async fn health_check_and_repeated_migrations_succeed() {
    let Some(storage) = storage().await else { return };

    storage.health_check().await.unwrap();
    storage.migrate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lock_attempts_have_exactly_one_winner() {
    let Some(storage) = storage().await else { return };
    let job = insert_job(&storage, now()).await;
    let id = job.id;

    let contenders = (0..8).map(|worker| {
        let storage = storage.clone();
        tokio::spawn(async move {
            let token = format!("worker-{worker}");
            let won = storage.queue_jobs.try_lock(id, &token, now()).await.unwrap();
            won.then_some(token)
        })
    });
    let winners: Vec<String> = futures::future::join_all(contenders)
        .await
        .into_iter()
        .filter_map(|result| result.unwrap())
        .collect();

    assert_eq!(winners.len(), 1);
    let locked = storage.queue_jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(locked.status, JobStatus::Processing);
    assert_eq!(locked.locked_by.as_deref(), Some(winners[0].as_str()));
    assert!(!storage.queue_jobs.try_lock(job.id, "late", now()).await.unwrap());
}

#[tokio::test]
async fn completed_jobs_cannot_be_locked_but_failed_ones_can() {
    let Some(storage) = storage().await else { return };
    let completed = insert_job(&storage, now()).await;
    let failed = insert_job(&storage, now()).await;

    storage.queue_jobs.release(completed.id, JobStatus::Completed).await.unwrap();
    storage.queue_jobs.release(failed.id, JobStatus::PermanentlyFailed).await.unwrap();

    assert!(!storage.queue_jobs.try_lock(completed.id, "w", now()).await.unwrap());
    assert!(storage.queue_jobs.try_lock(failed.id, "w", now()).await.unwrap());
}

#[tokio::test]
async fn reschedule_never_moves_the_schedule_backwards() {
    let Some(storage) = storage().await else { return };
    let later = now() + Duration::hours(1);
    let job = insert_job(&storage, later).await;
    assert!(storage.queue_jobs.try_lock(job.id, "w", now()).await.unwrap());

    storage.queue_jobs.reschedule(job.id, 1, now()).await.unwrap();

    let kept = storage.queue_jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(kept.scheduled_at, later);
    assert_eq!(kept.attempts, 1);
    assert_eq!(kept.status, JobStatus::Pending);
    assert!(!kept.is_locked());

    let even_later = later + Duration::hours(1);
    storage.queue_jobs.reschedule(job.id, 2, even_later).await.unwrap();

    let moved = storage.queue_jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(moved.scheduled_at, even_later);
    assert_eq!(moved.attempts, 2);
}

#[tokio::test]
async fn stale_reset_only_releases_old_locks() {
    let Some(storage) = storage().await else { return };
    let stale = insert_job(&storage, now()).await;
    let fresh = insert_job(&storage, now()).await;
    storage.queue_jobs.try_lock(stale.id, "w1", now() - Duration::minutes(10)).await.unwrap();
    storage.queue_jobs.try_lock(fresh.id, "w2", now()).await.unwrap();

    let reset = storage.queue_jobs.reset_stale(now() - Duration::minutes(5)).await.unwrap();

    assert!(reset >= 1);
    let stale = storage.queue_jobs.find_by_id(stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, JobStatus::Pending);
    assert!(!stale.is_locked());
    let fresh = storage.queue_jobs.find_by_id(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Processing);
    assert_eq!(fresh.locked_by.as_deref(), Some("w2"));
}

#[tokio::test]
async fn attempt_history_keeps_the_newest_entries_in_order() {
    let Some(storage) = storage().await else { return };
    let log = NewDeliveryLog {
        destination_id: DestinationId::new(),
        trigger_name: "save_post".to_string(),
        request_payload: json!({"hook": "save_post"}),
        original_payload: None,
        mapping_applied: false,
        event: None,
    }
    .into_log(now());
    storage.delivery_logs.insert(&log).await.unwrap();

    let attempted_at = now();
    for number in 1..=7 {
        let record = attempt(number, attempted_at);
        assert!(storage.delivery_logs.append_attempt(log.id, &record, 5).await.unwrap());
    }

    let stored = storage.delivery_logs.find_by_id(log.id).await.unwrap().unwrap();
    let numbers: Vec<u32> = stored.attempts().iter().map(|a| a.attempt).collect();
    assert_eq!(numbers, vec![3, 4, 5, 6, 7]);
    assert_eq!(stored.attempts()[4], attempt(7, attempted_at));
}

#[tokio::test]
async fn partial_update_distinguishes_keep_from_clear() {
    let Some(storage) = storage().await else { return };
    let log = NewDeliveryLog {
        destination_id: DestinationId::new(),
        trigger_name: "wp_login".to_string(),
        request_payload: json!({}),
        original_payload: None,
        mapping_applied: false,
        event: None,
    }
    .into_log(now());
    storage.delivery_logs.insert(&log).await.unwrap();
    let retry_at = now() + Duration::minutes(1);

    let retry = LogUpdate::status(LogStatus::Retry)
        .with_http_code(Some(503))
        .with_next_attempt_at(Some(retry_at));
    storage.delivery_logs.update(log.id, &retry).await.unwrap();
    storage.delivery_logs.update(log.id, &LogUpdate::status(LogStatus::Retry)).await.unwrap();

    let kept = storage.delivery_logs.find_by_id(log.id).await.unwrap().unwrap();
    assert_eq!(kept.next_attempt_at, Some(retry_at));
    assert_eq!(kept.http_code, Some(503));

    let done = LogUpdate::status(LogStatus::Success).with_next_attempt_at(None);
    storage.delivery_logs.update(log.id, &done).await.unwrap();

    let cleared = storage.delivery_logs.find_by_id(log.id).await.unwrap().unwrap();
    assert_eq!(cleared.status, LogStatus::Success);
    assert_eq!(cleared.next_attempt_at, None);
    assert_eq!(cleared.http_code, Some(503));
}

#[tokio::test]
async fn destinations_are_found_by_subscribed_trigger() {
    let Some(storage) = storage().await else { return };
    let trigger = format!("custom_{}", Uuid::new_v4().simple());
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&std::env::var("DATABASE_URL").unwrap())
        .await
        .unwrap();

    for (name, triggers, offset) in [
        ("first", vec![trigger.clone(), "save_post".to_string()], 0),
        ("second", vec![trigger.clone()], 1),
        ("other", vec!["save_post".to_string()], 2),
    ] {
        sqlx::query(
            "INSERT INTO destinations (id, name, endpoint_url, triggers, created_at) \
             VALUES ($1, $2, 'https://example.com/hook', $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(&triggers)
        .bind(now() + Duration::seconds(offset))
        .execute(&pool)
        .await
        .unwrap();
    }

    let found = storage.destinations.find_by_trigger(&trigger).await.unwrap();

    let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["first", "second"]);
    assert!(found.iter().all(|d| d.enabled && d.auth_header.is_none()));
}
