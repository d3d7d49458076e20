//! Sync against a mock HTTP job store.

use crate::helpers::{EchoExecutor, start_scheduler, utc};
use chrono::{DateTime, Utc};
use recurra::SchedulerError;
use recurra::config::SchedulerConfig;
use recurra::scheduler::{Job, Schedule, SchedulerHandle, Stores};
use serde_json::{Value, json};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sync_config(server: &MockServer) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.recovery.catch_up_on_start = false;
    config.sync.enabled = true;
    config.sync.base_url = Some(server.uri());
    config.sync.api_key = Some("secret".to_owned());
    config.sync.principal = Some("alice".to_owned());
    config
}

fn row(id: &str, name: &str, schedule: Value, updated_at: &str) -> Value {
    let mut row = json!({
        "id": id,
        "name": name,
        "query": format!("echo {name}"),
        "enabled": true,
        "createdAt": "2026-09-01T00:00:00Z",
        "updatedAt": updated_at,
    });
    if let (Some(target), Some(fields)) = (row.as_object_mut(), schedule.as_object()) {
        target.extend(fields.clone());
    }
    row
}

async fn mock_list(server: &MockServer, rows: Value) {
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .and(query_param("principal", "alice"))
        .and(header("Authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .mount(server)
        .await;
}

async fn start_with(server: &MockServer, locals: Vec<Job>) -> SchedulerHandle {
    let stores = Stores::in_memory();
    stores.jobs.set(locals).await.unwrap();
    start_scheduler(
        sync_config(server),
        stores,
        utc(2026, 10, 1, 10, 0),
        Arc::new(EchoExecutor),
    )
    .await
}

fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap()
}

#[tokio::test]
async fn startup_sync_pulls_new_rows_and_pushes_local_jobs() {
    let server = MockServer::start().await;
    let local = Job::new(
        "local",
        "echo local",
        Schedule::Hourly { every: 2 },
        utc(2026, 9, 30, 8, 0),
    );
    mock_list(
        &server,
        json!([row(
            "remote-1",
            "remote",
            json!({"scheduleKind": "daily", "scheduleTime": "06:15"}),
            "2026-09-02T00:00:00Z",
        )]),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .and(body_partial_json(json!({
            "principal": "alice",
            "id": local.id,
            "scheduleKind": "hourly",
            "scheduleInterval": 2,
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(row(
            &local.id,
            "local",
            json!({"scheduleKind": "hourly", "scheduleInterval": 2}),
            "2026-10-01T10:00:05Z",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let handle = start_with(&server, vec![local.clone()]).await;

    let jobs = handle.jobs().list().await.unwrap();
    assert_eq!(jobs.len(), 2);
    let pulled = handle.jobs().get("remote-1").await.unwrap().unwrap();
    assert_eq!(
        pulled.schedule,
        Schedule::Daily {
            time: "06:15".parse().unwrap()
        }
    );
    assert!(handle.wake().get("remote-1").is_some());

    let pushed = handle.jobs().get(&local.id).await.unwrap().unwrap();
    assert_eq!(pushed.updated_at, ts("2026-10-01T10:00:05Z"));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn newer_remote_row_replaces_local_definition() {
    let server = MockServer::start().await;
    let local = Job::new(
        "digest",
        "echo digest",
        Schedule::Hourly { every: 2 },
        utc(2026, 9, 30, 8, 0),
    );
    mock_list(
        &server,
        json!([row(
            &local.id,
            "digest",
            json!({"scheduleKind": "minutely", "scheduleInterval": 30}),
            "2026-10-01T09:00:00Z",
        )]),
    )
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let handle = start_with(&server, vec![local.clone()]).await;
    let updated = handle.jobs().get(&local.id).await.unwrap().unwrap();
    assert_eq!(updated.schedule, Schedule::Minutely { every: 30 });
    assert_eq!(updated.updated_at, ts("2026-10-01T09:00:00Z"));
    assert_eq!(
        handle.wake().get(&local.id).unwrap().schedule,
        Schedule::Minutely { every: 30 }
    );

    // Timestamps now tie, so nothing moves either way.
    let report = handle.sync_now().await.unwrap();
    assert!(report.is_noop());
    assert!(report.errors.is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn newer_local_edit_is_patched_upstream() {
    let server = MockServer::start().await;
    let mut local = Job::new(
        "renamed",
        "echo digest",
        Schedule::Hourly { every: 2 },
        utc(2026, 9, 30, 8, 0),
    );
    local.updated_at = utc(2026, 10, 1, 9, 30);
    mock_list(
        &server,
        json!([row(
            &local.id,
            "original",
            json!({"scheduleKind": "hourly", "scheduleInterval": 2}),
            "2026-10-01T09:00:00Z",
        )]),
    )
    .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/jobs/{}", local.id)))
        .and(body_partial_json(json!({"name": "renamed"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(row(
            &local.id,
            "renamed",
            json!({"scheduleKind": "hourly", "scheduleInterval": 2}),
            "2026-10-01T09:31:00Z",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let handle = start_with(&server, vec![local.clone()]).await;
    let after = handle.jobs().get(&local.id).await.unwrap().unwrap();
    assert_eq!(after.name, "renamed");
    assert_eq!(after.updated_at, ts("2026-10-01T09:31:00Z"));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_row_is_reported_and_left_alone() {
    let server = MockServer::start().await;
    mock_list(
        &server,
        json!([row(
            "weird",
            "weird",
            json!({"scheduleKind": "weekly", "scheduleInterval": 1}),
            "2026-10-01T09:00:00Z",
        )]),
    )
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let handle = start_with(&server, Vec::new()).await;
    let report = handle.sync_now().await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("pull weird"));
    assert!(handle.jobs().list().await.unwrap().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_credentials_fail_the_pass() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "bad token"})))
        .mount(&server)
        .await;

    // A failing start-up sync is logged, not fatal.
    let handle = start_with(&server, Vec::new()).await;
    match handle.sync_now().await {
        Err(SchedulerError::Remote(message)) => {
            assert!(message.contains("unauthorized"), "{message}");
            assert!(message.contains("bad token"), "{message}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    handle.shutdown().await.unwrap();
}
