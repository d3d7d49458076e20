//! Last-write-wins reconciliation of job definitions with a remote store.
//!
//! Local and remote rows are matched by id and compared on `updatedAt`.
//! The newer side wins; on a tie the remote is kept. Every change the
//! reconciler makes locally goes through [`JobService`] so wake triggers
//! follow the pulled definitions.

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Job, Schedule};
use crate::scheduler::jobs::JobService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A job row as the remote backend stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJob {
    pub id: String,
    pub name: String,
    pub query: String,
    pub schedule_kind: String,
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde(default)]
    pub schedule_interval: Option<u32>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Definition fields sent when pushing a local edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePatch {
    pub name: String,
    pub query: String,
    pub schedule_kind: String,
    pub schedule_time: Option<String>,
    pub schedule_interval: Option<u32>,
    pub enabled: bool,
}

/// Flattened wire form of a [`Schedule`].
struct WireSchedule {
    kind: &'static str,
    time: Option<String>,
    interval: Option<u32>,
}

impl From<&Schedule> for WireSchedule {
    fn from(schedule: &Schedule) -> Self {
        let (time, interval) = match schedule {
            Schedule::Daily { time } => (Some(time.to_string()), None),
            Schedule::Hourly { every } | Schedule::Minutely { every } => (None, Some(*every)),
        };
        Self {
            kind: schedule.kind_str(),
            time,
            interval,
        }
    }
}

/// Rebuild a [`Schedule`] from its flattened wire form.
///
/// Exactly one of `time` / `interval` must be present, matching `kind`.
pub fn schedule_from_wire(
    kind: &str,
    time: Option<&str>,
    interval: Option<u32>,
) -> Result<Schedule> {
    let schedule = match (kind, time, interval) {
        ("daily", Some(time), None) => Schedule::Daily {
            time: time.parse()?,
        },
        ("hourly", None, Some(every)) => Schedule::Hourly { every },
        ("minutely", None, Some(every)) => Schedule::Minutely { every },
        ("daily" | "hourly" | "minutely", _, _) => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "{kind} schedule needs exactly one of scheduleTime/scheduleInterval"
            )));
        }
        (other, _, _) => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "unknown schedule kind {other:?}"
            )));
        }
    };
    schedule.validate()?;
    Ok(schedule)
}

impl RemoteJob {
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        let wire = WireSchedule::from(&job.schedule);
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            query: job.query.clone(),
            schedule_kind: wire.kind.to_owned(),
            schedule_time: wire.time,
            schedule_interval: wire.interval,
            enabled: job.enabled,
            created_at: job.created_at,
            updated_at: job.updated_at,
            last_run_at: job.last_run_at,
        }
    }
}

impl TryFrom<RemoteJob> for Job {
    type Error = SchedulerError;

    fn try_from(remote: RemoteJob) -> Result<Self> {
        let schedule = schedule_from_wire(
            &remote.schedule_kind,
            remote.schedule_time.as_deref(),
            remote.schedule_interval,
        )?;
        Ok(Self {
            id: remote.id,
            name: remote.name,
            query: remote.query,
            schedule,
            enabled: remote.enabled,
            created_at: remote.created_at,
            updated_at: remote.updated_at,
            last_run_at: remote.last_run_at,
        })
    }
}

impl RemotePatch {
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        let wire = WireSchedule::from(&job.schedule);
        Self {
            name: job.name.clone(),
            query: job.query.clone(),
            schedule_kind: wire.kind.to_owned(),
            schedule_time: wire.time,
            schedule_interval: wire.interval,
            enabled: job.enabled,
        }
    }
}

/// Remote job store keyed by principal.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn list_jobs(&self, principal: &str) -> Result<Vec<RemoteJob>>;

    async fn create_job(&self, principal: &str, job: &RemoteJob) -> Result<RemoteJob>;

    async fn update_job(&self, id: &str, patch: &RemotePatch) -> Result<RemoteJob>;
}

/// Sink for per-job sync failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &str, error: &SchedulerError);
}

/// Reports sync failures to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, context: &str, error: &SchedulerError) {
        warn!(context, error = %error, "sync error");
    }
}

/// Counts of what one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pulled_new: usize,
    pub pulled_updated: usize,
    pub pushed_new: usize,
    pub pushed_updated: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    /// Whether the pass changed nothing on either side.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.pulled_new == 0
            && self.pulled_updated == 0
            && self.pushed_new == 0
            && self.pushed_updated == 0
    }
}

/// Bidirectional merge of local and remote job definitions.
#[derive(Clone)]
pub struct SyncReconciler {
    jobs: JobService,
    remote: Arc<dyn RemoteBackend>,
    reporter: Arc<dyn ErrorReporter>,
    principal: String,
    /// Serializes passes started from different tasks.
    pass: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for SyncReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReconciler")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

impl SyncReconciler {
    #[must_use]
    pub fn new(
        jobs: JobService,
        remote: Arc<dyn RemoteBackend>,
        reporter: Arc<dyn ErrorReporter>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            remote,
            reporter,
            principal: principal.into(),
            pass: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Run one reconcile pass.
    ///
    /// Failing to list remote jobs aborts the pass. Any other failure is
    /// scoped to one job: it is reported and recorded, and the pass goes on.
    pub async fn reconcile(&self) -> Result<SyncReport> {
        let _pass = self.pass.lock().await;
        let rows = self.remote.list_jobs(&self.principal).await?;
        let locals = self.jobs.list().await?;
        let local_by_id: HashMap<&str, &Job> =
            locals.iter().map(|job| (job.id.as_str(), job)).collect();

        let mut report = SyncReport::default();
        let mut remote_by_id: HashMap<String, Option<Job>> = HashMap::new();

        for row in rows {
            let id = row.id.clone();
            let remote = match Job::try_from(row) {
                Ok(job) => job,
                Err(e) => {
                    self.fail(&mut report, &format!("pull {id}"), &e);
                    remote_by_id.insert(id, None);
                    continue;
                }
            };

            match local_by_id.get(id.as_str()) {
                None => match self.jobs.apply_remote(remote.clone()).await {
                    Ok(_) => report.pulled_new += 1,
                    Err(e) => self.fail(&mut report, &format!("insert {id}"), &e),
                },
                Some(local) if remote.updated_at > local.updated_at => {
                    match self.jobs.apply_remote(remote.clone()).await {
                        Ok(_) => report.pulled_updated += 1,
                        Err(e) => self.fail(&mut report, &format!("update {id}"), &e),
                    }
                }
                Some(_) => {}
            }
            remote_by_id.insert(id, Some(remote));
        }

        for local in &locals {
            match remote_by_id.get(&local.id) {
                None => match self.push_new(local).await {
                    Ok(()) => report.pushed_new += 1,
                    Err(e) => self.fail(&mut report, &format!("push {}", local.id), &e),
                },
                Some(Some(remote))
                    if local.updated_at > remote.updated_at && !local.same_definition(remote) =>
                {
                    match self.push_update(local).await {
                        Ok(()) => report.pushed_updated += 1,
                        Err(e) => self.fail(&mut report, &format!("push {}", local.id), &e),
                    }
                }
                // Malformed remote row: leave both sides alone.
                Some(_) => {}
            }
        }

        if !report.is_noop() || !report.errors.is_empty() {
            info!(
                pulled_new = report.pulled_new,
                pulled_updated = report.pulled_updated,
                pushed_new = report.pushed_new,
                pushed_updated = report.pushed_updated,
                errors = report.errors.len(),
                "sync reconcile finished"
            );
        }
        Ok(report)
    }

    async fn push_new(&self, local: &Job) -> Result<()> {
        let created = self
            .remote
            .create_job(&self.principal, &RemoteJob::from_job(local))
            .await?;
        self.jobs
            .adopt_remote_timestamp(&local.id, created.updated_at)
            .await?;
        Ok(())
    }

    async fn push_update(&self, local: &Job) -> Result<()> {
        let updated = self
            .remote
            .update_job(&local.id, &RemotePatch::from_job(local))
            .await?;
        self.jobs
            .adopt_remote_timestamp(&local.id, updated.updated_at)
            .await?;
        Ok(())
    }

    fn fail(&self, report: &mut SyncReport, context: &str, error: &SchedulerError) {
        self.reporter.report(context, error);
        report.errors.push(format!("{context}: {error}"));
    }
}
