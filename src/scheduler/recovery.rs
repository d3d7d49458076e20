//! Start-up recovery: stale-run reaping and missed-run catch-up.

use crate::error::Result;
use crate::scheduler::clock::Clock;
use crate::scheduler::engine::{ExecutionEngine, RunHandle};
use crate::scheduler::run::{RunStatus, RunTrigger};
use crate::scheduler::wake::WakeScheduler;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Default age after which a `Running` run with no live handle is timed out.
pub const DEFAULT_STALE_RUN_THRESHOLD_SECS: u64 = 10 * 60;

/// Default window in which any run counts as "already ran".
pub const DEFAULT_MISSED_RUN_LOOKBACK_SECS: u64 = 24 * 60 * 60;

/// Recovery tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub stale_run_threshold: chrono::Duration,
    pub missed_run_lookback: chrono::Duration,
    pub catch_up_on_start: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            stale_run_threshold: secs(DEFAULT_STALE_RUN_THRESHOLD_SECS),
            missed_run_lookback: secs(DEFAULT_MISSED_RUN_LOOKBACK_SECS),
            catch_up_on_start: true,
        }
    }
}

pub(crate) fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

/// Runs dispatched by one catch-up pass.
#[derive(Debug, Default)]
pub struct CatchUpReport {
    pub dispatched: Vec<RunHandle>,
    /// Another pass was in progress, so this one did nothing.
    pub already_running: bool,
    pub errors: Vec<String>,
}

/// What [`Recovery::startup`] did.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub reaped: Vec<String>,
    pub triggers_created: usize,
    pub catch_up: CatchUpReport,
}

/// Recovery subsystem bound to one engine and wake scheduler.
pub struct Recovery {
    engine: ExecutionEngine,
    wake: Arc<WakeScheduler>,
    policy: RecoveryPolicy,
    catching_up: AtomicBool,
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recovery")
            .field("policy", &self.policy)
            .field("catching_up", &self.catching_up.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct CatchUpGuard<'a>(&'a AtomicBool);

impl<'a> CatchUpGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CatchUpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Recovery {
    #[must_use]
    pub fn new(engine: ExecutionEngine, wake: Arc<WakeScheduler>, policy: RecoveryPolicy) -> Self {
        Self {
            engine,
            wake,
            policy,
            catching_up: AtomicBool::new(false),
        }
    }

    /// Reap, reconcile triggers, then catch up (when enabled by policy).
    pub async fn startup(&self) -> Result<StartupReport> {
        let reaped = self.reap_stale_runs().await?;
        let jobs = self.engine.ledger().stores().jobs.get().await?;
        let triggers_created = self.wake.reconcile(&jobs);
        let catch_up = if self.policy.catch_up_on_start {
            self.catch_up_missed_runs().await?
        } else {
            CatchUpReport::default()
        };
        info!(
            reaped = reaped.len(),
            triggers_created,
            caught_up = catch_up.dispatched.len(),
            "startup recovery complete"
        );
        Ok(StartupReport {
            reaped,
            triggers_created,
            catch_up,
        })
    }

    /// Time out `Running` runs older than the threshold that this process
    /// is not executing. Returns the reaped run ids.
    pub async fn reap_stale_runs(&self) -> Result<Vec<String>> {
        self.engine
            .ledger()
            .fail_stale_runs(self.policy.stale_run_threshold, self.engine.live_runs())
            .await
    }

    /// Dispatch a `CatchUp` run for every enabled job that missed a fire.
    ///
    /// A job is skipped when any of its runs is still running or started
    /// inside the lookback window.
    pub async fn catch_up_missed_runs(&self) -> Result<CatchUpReport> {
        let Some(_guard) = CatchUpGuard::try_acquire(&self.catching_up) else {
            return Ok(CatchUpReport {
                already_running: true,
                ..CatchUpReport::default()
            });
        };

        let ledger = self.engine.ledger();
        let jobs = ledger.stores().jobs.get().await?;
        let runs = ledger.runs().await?;
        let clock = ledger.clock();
        let now = clock.now();
        let local_now = clock.local_now();
        // A window reaching past the calendar covers every run.
        let window_start = now
            .checked_sub_signed(self.policy.missed_run_lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = CatchUpReport::default();
        for job in jobs.iter().filter(|job| job.enabled) {
            let mut job_runs = runs.iter().filter(|run| run.job_id == job.id);
            let recently_ran = job_runs
                .any(|run| run.status == RunStatus::Running || run.started_at > window_start);
            if recently_ran || !job.missed_fire(local_now) {
                continue;
            }
            if let Err(e) = job.schedule.validate() {
                warn!(job_id = %job.id, error = %e, "not catching up job with invalid schedule");
                continue;
            }

            info!(job_id = %job.id, schedule = %job.schedule, "catching up missed run");
            match self.engine.dispatch(&job.id, RunTrigger::CatchUp).await {
                Ok(Some(handle)) => report.dispatched.push(handle),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "catch-up dispatch failed");
                    report.errors.push(format!("{}: {e}", job.id));
                }
            }
        }
        Ok(report)
    }
}
