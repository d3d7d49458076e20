//! Scheduler supervisor: wiring, start-up and the steady-state loop.
//!
//! [`Scheduler`] assembles the stores, wake scheduler, execution engine,
//! recovery and (optionally) sync. [`Scheduler::start`] runs start-up
//! recovery, performs an initial sync when a principal is configured, and
//! spawns the loop that turns wake events into runs, repairs triggers when
//! the job store changes, and syncs periodically.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::remote::HttpRemoteBackend;
use crate::scheduler::clock::Clock;
use crate::scheduler::engine::{
    CancelOutcome, EnvironmentProvider, ExecutionEngine, RunEvent, RunHandle, TaskExecutor,
};
use crate::scheduler::jobs::JobService;
use crate::scheduler::ledger::RunLedger;
use crate::scheduler::recovery::Recovery;
use crate::scheduler::run::{Run, RunTrigger};
use crate::scheduler::store::Stores;
use crate::scheduler::sync::{
    ErrorReporter, RemoteBackend, SyncReconciler, SyncReport, TracingErrorReporter,
};
use crate::scheduler::wake::{WakeEvent, WakeScheduler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builder for a running scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    executor: Arc<dyn TaskExecutor>,
    environments: Arc<dyn EnvironmentProvider>,
    stores: Option<Stores>,
    clock: Option<Arc<dyn Clock>>,
    remote: Option<Arc<dyn RemoteBackend>>,
    reporter: Arc<dyn ErrorReporter>,
}

/// Counts from start-up recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupSummary {
    pub reaped: usize,
    pub triggers_created: usize,
    pub caught_up: usize,
}

impl Scheduler {
    /// Create a scheduler. Stores default to the configured data directory
    /// and the clock to the configured zone.
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn TaskExecutor>,
        environments: Arc<dyn EnvironmentProvider>,
    ) -> Self {
        Self {
            config,
            executor,
            environments,
            stores: None,
            clock: None,
            remote: None,
            reporter: Arc::new(TracingErrorReporter),
        }
    }

    /// Use pre-opened stores (e.g. in-memory for tests).
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom remote instead of the HTTP backend from `[sync]`.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Recover, sync once, and spawn the supervisor loop.
    pub async fn start(self) -> Result<SchedulerHandle> {
        let config = self.config;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(config.schedule.clock()),
        };
        let stores = match self.stores {
            Some(stores) => stores,
            None => Stores::open_dir(&config.storage.resolved_data_dir())?,
        };

        let (wake, wake_rx) = WakeScheduler::new(Arc::clone(&clock));
        let wake = Arc::new(wake);
        let ledger = RunLedger::new(
            stores.clone(),
            Arc::clone(&clock),
            config.retention.max_runs_per_job,
        );
        let engine = ExecutionEngine::new(ledger, self.executor, self.environments);
        let jobs = JobService::new(stores.jobs.clone(), Arc::clone(&wake), Arc::clone(&clock));

        let sync = match config.sync.active_principal() {
            Some(principal) => {
                let remote: Arc<dyn RemoteBackend> = match self.remote {
                    Some(remote) => remote,
                    None => Arc::new(HttpRemoteBackend::from_config(&config.sync)?),
                };
                Some(SyncReconciler::new(
                    jobs.clone(),
                    remote,
                    self.reporter,
                    principal,
                ))
            }
            None => None,
        };

        let recovery = Recovery::new(engine.clone(), Arc::clone(&wake), config.recovery.policy());
        let report = recovery.startup().await?;
        let startup = StartupSummary {
            reaped: report.reaped.len(),
            triggers_created: report.triggers_created,
            caught_up: report.catch_up.dispatched.len(),
        };

        if let Some(sync) = &sync {
            if let Err(e) = sync.reconcile().await {
                warn!(error = %e, "start-up sync failed");
            }
        }

        let shutdown = CancellationToken::new();
        let supervisor = Supervisor {
            engine: engine.clone(),
            jobs: jobs.clone(),
            sync: sync.clone(),
            sync_interval: config
                .sync
                .interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            wake_rx,
            jobs_watch: stores.jobs.watch(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(supervisor.run());
        info!(
            reaped = startup.reaped,
            triggers = wake.len(),
            caught_up = startup.caught_up,
            sync = sync.is_some(),
            "scheduler started"
        );

        Ok(SchedulerHandle {
            inner: Arc::new(HandleInner {
                jobs,
                engine,
                sync,
                startup,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        })
    }
}

struct Supervisor {
    engine: ExecutionEngine,
    jobs: JobService,
    sync: Option<SyncReconciler>,
    sync_interval: Option<Duration>,
    wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
    jobs_watch: watch::Receiver<u64>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let mut sync_ticker = match (&self.sync, self.sync_interval) {
            (Some(_), Some(period)) => match Instant::now().checked_add(period) {
                Some(start) => {
                    let mut ticker = tokio::time::interval_at(start, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    Some(ticker)
                }
                None => {
                    warn!(secs = period.as_secs(), "sync interval out of range; periodic sync off");
                    None
                }
            },
            _ => None,
        };

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = self.wake_rx.recv() => {
                    let Some(event) = event else { break };
                    self.on_wake(event);
                }
                changed = self.jobs_watch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.repair_triggers().await;
                }
                () = next_tick(&mut sync_ticker) => self.periodic_sync(),
            }
        }
        debug!("scheduler supervisor stopped");
    }

    /// Dispatch off the loop; environment acquisition may be slow.
    fn on_wake(&self, event: WakeEvent) {
        debug!(job_id = %event.job_id, trigger = %event.trigger, "wake trigger fired");
        let engine = self.engine.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            match engine.dispatch(&event.job_id, RunTrigger::Wake).await {
                Ok(Some(_handle)) => {}
                Ok(None) => {
                    // The job vanished; its trigger is stale.
                    jobs.wake().clear(&event.job_id);
                }
                Err(e) => warn!(job_id = %event.job_id, error = %e, "wake dispatch failed"),
            }
        });
    }

    /// Bring the trigger table back in line with the job store.
    async fn repair_triggers(&self) {
        match self.jobs.list().await {
            Ok(jobs) => {
                let pruned = self.jobs.wake().prune(&jobs);
                let created = self.jobs.wake().reconcile(&jobs);
                if pruned > 0 || created > 0 {
                    debug!(pruned, created, "wake triggers repaired");
                }
            }
            Err(e) => warn!(error = %e, "cannot read jobs to repair triggers"),
        }
    }

    fn periodic_sync(&self) {
        let Some(sync) = self.sync.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = sync.reconcile().await {
                warn!(error = %e, "periodic sync failed");
            }
        });
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct HandleInner {
    jobs: JobService,
    engine: ExecutionEngine,
    sync: Option<SyncReconciler>,
    startup: StartupSummary,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a started scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("startup", &self.inner.startup)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SchedulerHandle {
    /// Job editing surface.
    #[must_use]
    pub fn jobs(&self) -> &JobService {
        &self.inner.jobs
    }

    #[must_use]
    pub fn engine(&self) -> &ExecutionEngine {
        &self.inner.engine
    }

    #[must_use]
    pub fn wake(&self) -> &Arc<WakeScheduler> {
        self.inner.jobs.wake()
    }

    #[must_use]
    pub fn startup(&self) -> StartupSummary {
        self.inner.startup
    }

    /// Runs, newest first, optionally for one job.
    pub async fn runs(&self, job_id: Option<&str>) -> Result<Vec<Run>> {
        let ledger = self.inner.engine.ledger();
        match job_id {
            Some(job_id) => ledger.runs_for_job(job_id).await,
            None => {
                let mut runs = ledger.runs().await?;
                runs.reverse();
                Ok(runs)
            }
        }
    }

    /// Start a manual run.
    pub async fn run_now(&self, job_id: &str) -> Result<RunHandle> {
        self.inner
            .engine
            .dispatch(job_id, RunTrigger::Manual)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_owned()))
    }

    pub fn cancel_run(&self, run_id: &str) -> CancelOutcome {
        self.inner.engine.cancel_run(run_id)
    }

    /// Reconcile with the remote now.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        match &self.inner.sync {
            Some(sync) => sync.reconcile().await,
            None => Err(SchedulerError::Config(
                "sync is not enabled or no principal is set".to_owned(),
            )),
        }
    }

    #[must_use]
    pub fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.engine.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stop the supervisor loop and remove all wake triggers.
    ///
    /// Runs already executing are left to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let task = match self.inner.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.wake().clear_all();
        if let Some(task) = task {
            task.await
                .map_err(|e| SchedulerError::Channel(format!("supervisor task failed: {e}")))?;
            info!("scheduler stopped");
        }
        Ok(())
    }
}
