//! The single entry point for changing job definitions.
//!
//! Every path that alters a job's schedule or enabled flag goes through
//! [`JobService`], which keeps the wake trigger table in step with the
//! store: a disabled or deleted job has no trigger, and an enabled job
//! whose schedule changed gets its trigger recreated.

use crate::error::{Result, SchedulerError};
use crate::scheduler::clock::Clock;
use crate::scheduler::job::{Job, Schedule};
use crate::scheduler::store::Collection;
use crate::scheduler::wake::WakeScheduler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Fields a user edit may change. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl JobPatch {
    fn apply(&self, job: &mut Job) {
        if let Some(name) = &self.name {
            job.name.clone_from(name);
        }
        if let Some(query) = &self.query {
            job.query.clone_from(query);
        }
        if let Some(schedule) = self.schedule {
            job.schedule = schedule;
        }
        if let Some(enabled) = self.enabled {
            job.enabled = enabled;
        }
    }
}

/// Job CRUD with wake-trigger bookkeeping.
#[derive(Clone)]
pub struct JobService {
    jobs: Collection<Job>,
    wake: Arc<WakeScheduler>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl JobService {
    #[must_use]
    pub fn new(jobs: Collection<Job>, wake: Arc<WakeScheduler>, clock: Arc<dyn Clock>) -> Self {
        Self { jobs, wake, clock }
    }

    #[must_use]
    pub fn wake(&self) -> &Arc<WakeScheduler> {
        &self.wake
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.jobs.get().await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let job_id = job_id.to_owned();
        self.jobs
            .read(move |jobs| jobs.iter().find(|job| job.id == job_id).cloned())
            .await
    }

    /// Create an enabled job and its trigger.
    pub async fn create_job(
        &self,
        name: impl Into<String>,
        query: impl Into<String>,
        schedule: Schedule,
    ) -> Result<Job> {
        schedule.validate()?;
        let job = Job::new(name, query, schedule, self.clock.now());
        let record = job.clone();
        self.jobs.update(move |jobs| jobs.push(record)).await?;
        self.sync_trigger(None, &job);
        info!(job_id = %job.id, name = %job.name, schedule = %job.schedule, "job created");
        Ok(job)
    }

    /// Apply a user edit. `updated_at` moves only when something changed.
    pub async fn update_job(&self, job_id: &str, patch: JobPatch) -> Result<Job> {
        if let Some(schedule) = &patch.schedule {
            schedule.validate()?;
        }
        let now = self.clock.now();
        let id = job_id.to_owned();
        let (before, after) = self
            .jobs
            .update(move |jobs| {
                let job = jobs
                    .iter_mut()
                    .find(|job| job.id == id)
                    .ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?;
                let before = job.clone();
                patch.apply(job);
                if !job.same_definition(&before) {
                    job.updated_at = now;
                }
                Ok::<_, SchedulerError>((before, job.clone()))
            })
            .await??;
        self.sync_trigger(Some(&before), &after);
        if !after.same_definition(&before) {
            info!(job_id, enabled = after.enabled, schedule = %after.schedule, "job updated");
        }
        Ok(after)
    }

    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<Job> {
        self.update_job(
            job_id,
            JobPatch {
                enabled: Some(enabled),
                ..JobPatch::default()
            },
        )
        .await
    }

    pub async fn set_job_schedule(&self, job_id: &str, schedule: Schedule) -> Result<Job> {
        self.update_job(
            job_id,
            JobPatch {
                schedule: Some(schedule),
                ..JobPatch::default()
            },
        )
        .await
    }

    /// Delete a job and its trigger. Its runs are kept.
    ///
    /// Returns `false` if no such job existed.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let id = job_id.to_owned();
        let removed = self
            .jobs
            .update(move |jobs| {
                let before = jobs.len();
                jobs.retain(|job| job.id != id);
                jobs.len() != before
            })
            .await?;
        self.wake.clear(job_id);
        if removed {
            info!(job_id, "job deleted");
        }
        Ok(removed)
    }

    /// Store a job pulled from the remote, inserting or overwriting by id.
    ///
    /// The later of the two `last_run_at` values is kept, and the trigger is
    /// always cleared and recreated so it reflects the pulled schedule.
    pub async fn apply_remote(&self, remote: Job) -> Result<Job> {
        let stored = self
            .jobs
            .update(move |jobs| match jobs.iter_mut().find(|job| job.id == remote.id) {
                Some(local) => {
                    let last_run_at = later(local.last_run_at, remote.last_run_at);
                    *local = remote;
                    local.last_run_at = last_run_at;
                    local.clone()
                }
                None => {
                    jobs.push(remote.clone());
                    remote
                }
            })
            .await?;
        self.wake.clear(&stored.id);
        self.wake.ensure(&stored);
        Ok(stored)
    }

    /// Adopt the server-assigned `updated_at` after a push.
    pub async fn adopt_remote_timestamp(
        &self,
        job_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let id = job_id.to_owned();
        self.jobs
            .update(move |jobs| match jobs.iter_mut().find(|job| job.id == id) {
                Some(job) => {
                    job.updated_at = updated_at;
                    true
                }
                None => false,
            })
            .await
    }

    fn sync_trigger(&self, before: Option<&Job>, after: &Job) {
        if !after.enabled {
            self.wake.clear(&after.id);
            return;
        }
        if before.is_some_and(|before| before.schedule != after.schedule) {
            self.wake.clear(&after.id);
        }
        self.wake.ensure(after);
    }
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
