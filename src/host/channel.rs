//! Host command channel and router over a running scheduler.

use crate::error::{Result, SchedulerError};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use crate::scheduler::engine::RunEvent;
use crate::scheduler::job::Schedule;
use crate::scheduler::jobs::JobPatch;
use crate::scheduler::runner::SchedulerHandle;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct CreateJobPayload {
    name: String,
    query: String,
    schedule: Schedule,
}

#[derive(Debug, Deserialize)]
struct UpdateJobPayload {
    id: String,
    #[serde(flatten)]
    patch: JobPatch,
}

#[derive(Debug, Deserialize)]
struct SetEnabledPayload {
    id: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct SetSchedulePayload {
    id: String,
    schedule: Schedule,
}

#[derive(Debug, Default, Deserialize)]
struct RunsListPayload {
    #[serde(default)]
    job_id: Option<String>,
}

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<ResponseEnvelope>,
}

#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostCommandClient {
    /// Submit a command and wait for its response.
    ///
    /// Scheduler failures come back as `ok: false` envelopes; `Err` means
    /// the envelope was malformed or the server is gone.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            SchedulerError::InvalidRequest(format!(
                "invalid host command envelope {}: {e}",
                envelope.request_id
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| {
                SchedulerError::Channel(format!("failed to send host command request: {e}"))
            })?;

        response_rx
            .await
            .map_err(|e| SchedulerError::Channel(format!("host command response dropped: {e}")))
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }
}

pub struct HostCommandServer {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
    scheduler: SchedulerHandle,
}

#[must_use]
pub fn command_channel(
    request_capacity: usize,
    event_capacity: usize,
    scheduler: SchedulerHandle,
) -> (HostCommandClient, HostCommandServer) {
    let (event_tx, _event_rx) = broadcast::channel(event_capacity.max(1));
    command_channel_with_events(request_capacity, event_tx, scheduler)
}

/// Create a command channel publishing on an existing event sender.
#[must_use]
pub fn command_channel_with_events(
    request_capacity: usize,
    event_tx: broadcast::Sender<EventEnvelope>,
    scheduler: SchedulerHandle,
) -> (HostCommandClient, HostCommandServer) {
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));

    (
        HostCommandClient {
            request_tx,
            event_tx: event_tx.clone(),
        },
        HostCommandServer {
            request_rx,
            event_tx,
            scheduler,
        },
    )
}

impl HostCommandServer {
    /// Serve requests and forward run lifecycle events until every client
    /// is dropped.
    pub async fn run(mut self) {
        let mut runs = Some(self.scheduler.subscribe_runs());
        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some(request) = request else { break };
                    let response = self.dispatch(&request.envelope).await;
                    let _ = request.response_tx.send(response);
                }
                event = recv_run_event(&mut runs) => match event {
                    Ok(event) => self.forward_run_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "host bridge fell behind on run events");
                    }
                    Err(RecvError::Closed) => runs = None,
                },
            }
        }
        debug!("host command server stopped");
    }

    /// Route a command and fold scheduler errors into an error envelope.
    pub async fn dispatch(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        match self.route(envelope).await {
            Ok(response) => response,
            Err(e) => {
                debug!(command = envelope.command.as_str(), error = %e, "host command failed");
                ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
            }
        }
    }

    /// Route a command envelope to the scheduler.
    pub async fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let request_id = envelope.request_id.clone();
        let payload = match envelope.command {
            CommandName::HostPing => serde_json::json!({"pong": true}),
            CommandName::HostVersion => serde_json::json!({
                "contract_version": crate::host::contract::EVENT_VERSION,
                "channel": "recurra_host_v1",
                "version": env!("CARGO_PKG_VERSION"),
            }),
            CommandName::JobsList => {
                serde_json::json!({"jobs": self.scheduler.jobs().list().await?})
            }
            CommandName::JobsCreate => {
                let body: CreateJobPayload = parse_payload(envelope)?;
                let job = self
                    .scheduler
                    .jobs()
                    .create_job(body.name, body.query, body.schedule)
                    .await?;
                self.emit_event("job.created", serde_json::json!({"id": job.id}));
                serde_json::json!({"job": job})
            }
            CommandName::JobsUpdate => {
                let body: UpdateJobPayload = parse_payload(envelope)?;
                let job = self.scheduler.jobs().update_job(&body.id, body.patch).await?;
                self.emit_event("job.updated", serde_json::json!({"id": job.id}));
                serde_json::json!({"job": job})
            }
            CommandName::JobsSetEnabled => {
                let body: SetEnabledPayload = parse_payload(envelope)?;
                let job = self
                    .scheduler
                    .jobs()
                    .set_enabled(&body.id, body.enabled)
                    .await?;
                self.emit_event("job.updated", serde_json::json!({"id": job.id}));
                serde_json::json!({"job": job})
            }
            CommandName::JobsSetSchedule => {
                let body: SetSchedulePayload = parse_payload(envelope)?;
                let job = self
                    .scheduler
                    .jobs()
                    .set_job_schedule(&body.id, body.schedule)
                    .await?;
                self.emit_event("job.updated", serde_json::json!({"id": job.id}));
                serde_json::json!({"job": job})
            }
            CommandName::JobsDelete => {
                let id = parse_id(&envelope.payload, "id", envelope.command)?;
                let deleted = self.scheduler.jobs().delete_job(&id).await?;
                if deleted {
                    self.emit_event("job.deleted", serde_json::json!({"id": id}));
                }
                serde_json::json!({"id": id, "deleted": deleted})
            }
            CommandName::RunsList => {
                let body: RunsListPayload = if envelope.payload.is_null() {
                    RunsListPayload::default()
                } else {
                    parse_payload(envelope)?
                };
                let runs = self.scheduler.runs(body.job_id.as_deref()).await?;
                serde_json::json!({"runs": runs})
            }
            CommandName::RunsRunNow => {
                let id = parse_id(&envelope.payload, "id", envelope.command)?;
                // The run keeps going after the handle is dropped.
                let handle = self.scheduler.run_now(&id).await?;
                serde_json::json!({"run_id": handle.run_id, "job_id": handle.job_id})
            }
            CommandName::RunsCancel => {
                let run_id = parse_id(&envelope.payload, "run_id", envelope.command)?;
                let outcome = self.scheduler.cancel_run(&run_id);
                serde_json::json!({"run_id": run_id, "outcome": outcome})
            }
            CommandName::SyncNow => {
                let report = self.scheduler.sync_now().await?;
                self.emit_event("sync.completed", serde_json::to_value(&report).unwrap_or_default());
                serde_json::json!({"report": report})
            }
            CommandName::RuntimeStop => {
                self.scheduler.shutdown().await?;
                self.emit_event("runtime.stopped", serde_json::json!({"request_id": request_id}));
                serde_json::json!({"accepted": true})
            }
        };
        Ok(ResponseEnvelope::ok(request_id, payload))
    }

    fn forward_run_event(&self, event: &RunEvent) {
        let name = match event {
            RunEvent::Started { .. } => "run.started",
            RunEvent::Finished { .. } => "run.finished",
        };
        match serde_json::to_value(event) {
            Ok(payload) => self.emit_event(name, payload),
            Err(e) => warn!(error = %e, "cannot encode run event"),
        }
    }

    fn emit_event(&self, event: &str, payload: serde_json::Value) {
        let envelope = EventEnvelope::new(uuid::Uuid::new_v4().to_string(), event, payload);
        let _ = self.event_tx.send(envelope);
    }
}

async fn recv_run_event(
    runs: &mut Option<broadcast::Receiver<RunEvent>>,
) -> std::result::Result<RunEvent, RecvError> {
    match runs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn parse_payload<T: DeserializeOwned>(envelope: &CommandEnvelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        SchedulerError::InvalidRequest(format!(
            "{} payload is invalid: {e}",
            envelope.command.as_str()
        ))
    })
}

fn parse_id(payload: &serde_json::Value, field: &str, command: CommandName) -> Result<String> {
    match payload.get(field).and_then(serde_json::Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_owned()),
        _ => Err(SchedulerError::InvalidRequest(format!(
            "{} requires payload.{field}",
            command.as_str()
        ))),
    }
}
