//! Run lifecycle bookkeeping on top of the job and run stores.

use crate::error::Result;
use crate::scheduler::clock::Clock;
use crate::scheduler::job::Job;
use crate::scheduler::run::{JOB_TIMED_OUT, Run, RunStatus, RunTransition, RunTrigger};
use crate::scheduler::store::Stores;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of runs kept per job.
pub const DEFAULT_MAX_RUNS_PER_JOB: usize = 15;

/// Creates, finishes and retires run records.
#[derive(Clone)]
pub struct RunLedger {
    stores: Stores,
    clock: Arc<dyn Clock>,
    max_runs_per_job: usize,
}

impl std::fmt::Debug for RunLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLedger")
            .field("max_runs_per_job", &self.max_runs_per_job)
            .finish_non_exhaustive()
    }
}

impl RunLedger {
    /// `max_runs_per_job` is clamped to at least one.
    #[must_use]
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, max_runs_per_job: usize) -> Self {
        Self {
            stores,
            clock,
            max_runs_per_job: max_runs_per_job.max(1),
        }
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn max_runs_per_job(&self) -> usize {
        self.max_runs_per_job
    }

    /// Append a new `Running` run and evict the oldest runs of the same job
    /// beyond the retention limit.
    pub async fn create_run(&self, job_id: &str, trigger: RunTrigger) -> Result<Run> {
        let run = Run::start(job_id, trigger, self.clock.now());
        let record = run.clone();
        let owner = job_id.to_owned();
        let keep = self.max_runs_per_job;
        let evicted = self
            .stores
            .runs
            .update(move |runs| {
                runs.push(record);
                enforce_retention(runs, &owner, keep)
            })
            .await?;
        if evicted > 0 {
            debug!(job_id, evicted, "evicted old runs");
        }
        Ok(run)
    }

    /// Apply a terminal transition to a running run.
    ///
    /// Returns `false` when the run is absent or already terminal.
    pub async fn update_run(&self, run_id: &str, transition: RunTransition) -> Result<bool> {
        let run_id = run_id.to_owned();
        self.stores
            .runs
            .update(move |runs| {
                runs.iter_mut()
                    .find(|run| run.id == run_id)
                    .is_some_and(|run| run.finish(transition))
            })
            .await
    }

    /// Stamp a job's `last_run_at`. Returns `false` if the job is gone.
    pub async fn update_job_last_run(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let job_id = job_id.to_owned();
        self.stores
            .jobs
            .update(move |jobs| match jobs.iter_mut().find(|job| job.id == job_id) {
                Some(job) => {
                    job.last_run_at = Some(at);
                    true
                }
                None => false,
            })
            .await
    }

    /// Fail every `Running` run older than `threshold` that is not in `live`.
    ///
    /// Returns the ids of the runs that were timed out.
    pub async fn fail_stale_runs(
        &self,
        threshold: chrono::Duration,
        live: HashSet<String>,
    ) -> Result<Vec<String>> {
        let now = self.clock.now();
        let reaped = self
            .stores
            .runs
            .update(move |runs| {
                let mut reaped = Vec::new();
                for run in runs.iter_mut() {
                    // An out-of-range threshold means nothing is old enough.
                    let stale = run.status == RunStatus::Running
                        && run
                            .started_at
                            .checked_add_signed(threshold)
                            .is_some_and(|deadline| now > deadline)
                        && !live.contains(&run.id);
                    if stale
                        && run.finish(RunTransition::Fail {
                            at: now,
                            reason: JOB_TIMED_OUT.to_owned(),
                        })
                    {
                        reaped.push(run.id.clone());
                    }
                }
                reaped
            })
            .await?;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "timed out stale runs");
        }
        Ok(reaped)
    }

    /// All runs in insertion order.
    pub async fn runs(&self) -> Result<Vec<Run>> {
        self.stores.runs.get().await
    }

    /// Runs of one job, newest first.
    pub async fn runs_for_job(&self, job_id: &str) -> Result<Vec<Run>> {
        let job_id = job_id.to_owned();
        self.stores
            .runs
            .read(move |runs| {
                runs.iter()
                    .rev()
                    .filter(|run| run.job_id == job_id)
                    .cloned()
                    .collect()
            })
            .await
    }

    pub async fn run(&self, run_id: &str) -> Result<Option<Run>> {
        let run_id = run_id.to_owned();
        self.stores
            .runs
            .read(move |runs| runs.iter().find(|run| run.id == run_id).cloned())
            .await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<Job>> {
        let job_id = job_id.to_owned();
        self.stores
            .jobs
            .read(move |jobs| jobs.iter().find(|job| job.id == job_id).cloned())
            .await
    }
}

/// Drop the oldest runs of `job_id` so that at most `keep` remain.
fn enforce_retention(runs: &mut Vec<Run>, job_id: &str, keep: usize) -> usize {
    let count = runs.iter().filter(|run| run.job_id == job_id).count();
    let evicted = count.saturating_sub(keep);
    let mut remaining = evicted;
    runs.retain(|run| {
        if remaining > 0 && run.job_id == job_id {
            remaining -= 1;
            false
        } else {
            true
        }
    });
    evicted
}
