//! Host command flows over the in-process channel.

use crate::helpers::{EchoExecutor, start_scheduler, utc};
use recurra::config::SchedulerConfig;
use recurra::host::channel::{HostCommandClient, command_channel};
use recurra::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use recurra::scheduler::{SchedulerHandle, Stores};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Host {
    client: HostCommandClient,
    events: broadcast::Receiver<EventEnvelope>,
    handle: SchedulerHandle,
    next_id: u32,
}

impl Host {
    async fn start() -> Self {
        let handle = start_scheduler(
            SchedulerConfig::default(),
            Stores::in_memory(),
            utc(2026, 10, 1, 10, 0),
            Arc::new(EchoExecutor),
        )
        .await;
        let (client, server) = command_channel(16, 64, handle.clone());
        let events = client.subscribe_events();
        tokio::spawn(server.run());
        Self {
            client,
            events,
            handle,
            next_id: 0,
        }
    }

    async fn send(&mut self, command: CommandName, payload: Value) -> ResponseEnvelope {
        self.next_id += 1;
        let request_id = format!("req-{}", self.next_id);
        let response = self
            .client
            .send(CommandEnvelope::new(request_id.clone(), command, payload))
            .await
            .unwrap();
        assert_eq!(response.request_id, request_id);
        response
    }

    async fn next_event(&mut self, name: &str) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.unwrap();
                if event.event == name {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {name} event"))
    }
}

#[tokio::test]
async fn job_and_run_flow() {
    let mut host = Host::start().await;

    let created = host
        .send(
            CommandName::JobsCreate,
            json!({
                "name": "greeting",
                "query": "hello",
                "schedule": {"kind": "hourly", "every": 6}
            }),
        )
        .await;
    assert!(created.ok, "{:?}", created.error);
    let id = created.payload["job"]["id"].as_str().unwrap().to_owned();
    assert_eq!(host.next_event("job.created").await.payload["id"], id.as_str());

    let updated = host
        .send(
            CommandName::JobsUpdate,
            json!({"id": id, "name": "greeting v2", "query": "hello again"}),
        )
        .await;
    assert!(updated.ok, "{:?}", updated.error);
    assert_eq!(updated.payload["job"]["name"], "greeting v2");
    assert_eq!(updated.payload["job"]["schedule"]["every"], 6);

    let rescheduled = host
        .send(
            CommandName::JobsSetSchedule,
            json!({"id": id, "schedule": {"kind": "daily", "time": "08:05"}}),
        )
        .await;
    assert_eq!(rescheduled.payload["job"]["schedule"]["time"], "08:05");

    let started = host.send(CommandName::RunsRunNow, json!({"id": id})).await;
    assert!(started.ok, "{:?}", started.error);
    let run_id = started.payload["run_id"].as_str().unwrap().to_owned();
    let finished = host.next_event("run.finished").await;
    assert_eq!(finished.payload["run_id"], run_id.as_str());
    assert_eq!(finished.payload["status"], "completed");
    assert_eq!(finished.payload["result"], "hello again");

    let runs = host.send(CommandName::RunsList, Value::Null).await;
    let runs = runs.payload["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["trigger"], "manual");

    let deleted = host.send(CommandName::JobsDelete, json!({"id": id})).await;
    assert_eq!(deleted.payload["deleted"], true);
    let listed = host.send(CommandName::JobsList, json!({})).await;
    assert!(listed.payload["jobs"].as_array().unwrap().is_empty());

    host.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn scheduler_errors_come_back_as_error_envelopes() {
    let mut host = Host::start().await;

    let sync = host.send(CommandName::SyncNow, json!({})).await;
    assert!(!sync.ok);
    assert!(sync.error.unwrap().starts_with("config error"));

    let missing = host
        .send(CommandName::RunsRunNow, json!({"id": "ghost"}))
        .await;
    assert_eq!(missing.error.as_deref(), Some("job not found: ghost"));

    let bad_time = host
        .send(
            CommandName::JobsCreate,
            json!({"name": "n", "query": "q", "schedule": {"kind": "daily", "time": "25:00"}}),
        )
        .await;
    assert!(!bad_time.ok);
    assert!(bad_time.error.unwrap().starts_with("invalid request"));

    let version = host.send(CommandName::HostVersion, json!({})).await;
    assert_eq!(version.payload["contract_version"], 1);
    assert_eq!(version.payload["version"], env!("CARGO_PKG_VERSION"));

    let stop = host.send(CommandName::RuntimeStop, json!({})).await;
    assert!(stop.ok);
    assert!(!host.handle.is_running());
}
