//! Turns wake signals and manual triggers into runs.
//!
//! A dispatch resolves the job, acquires a work environment, records a
//! `Running` run and registers a cancellation token, then drives the
//! external [`TaskExecutor`] in a spawned task. The run is always
//! finalized, the token dropped and the environment released, whatever
//! the executor does (including panicking).

use crate::error::{Result, SchedulerError};
use crate::scheduler::clock::Clock;
use crate::scheduler::job::Job;
use crate::scheduler::ledger::RunLedger;
use crate::scheduler::run::{CANCELLED_BY_USER, RunStatus, RunTransition, RunTrigger, TaskOutput};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result text recorded when the executor panics.
pub const EXECUTOR_PANICKED: &str = "Task executor crashed";

const EVENT_CAPACITY: usize = 64;

/// Where a task executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkEnvironment {
    pub id: String,
    /// Working directory, when the provider hands out one.
    pub path: Option<PathBuf>,
}

impl WorkEnvironment {
    /// Environment with no backing directory.
    #[must_use]
    pub fn detached(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
        }
    }
}

/// Executor failure.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The executor observed the cancellation token.
    #[error("task cancelled")]
    Cancelled,

    /// The task ran and failed.
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Performs the work described by a job's query.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        query: &str,
        environment: &WorkEnvironment,
        cancel: CancellationToken,
    ) -> std::result::Result<TaskOutput, TaskError>;
}

/// Hands out and takes back work environments.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn acquire(&self) -> Result<WorkEnvironment>;

    async fn release(&self, environment: WorkEnvironment) -> Result<()>;
}

/// Provider for executors that need no environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnvironment;

#[async_trait]
impl EnvironmentProvider for NoEnvironment {
    async fn acquire(&self) -> Result<WorkEnvironment> {
        Ok(WorkEnvironment::detached(uuid::Uuid::new_v4().to_string()))
    }

    async fn release(&self, _environment: WorkEnvironment) -> Result<()> {
        Ok(())
    }
}

/// Run lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        job_id: String,
        trigger: RunTrigger,
    },
    Finished {
        run_id: String,
        job_id: String,
        status: RunStatus,
        result: String,
    },
}

/// Final state of a dispatched run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub job_id: String,
    pub status: RunStatus,
    pub result: String,
}

/// Handle to a dispatched run.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    pub job_id: String,
    cancel: CancellationToken,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to be finalized.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|e| SchedulerError::Channel(format!("run task failed: {e}")))
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

/// Live cancellation tokens keyed by run id.
#[derive(Debug, Default)]
struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(&self, run_id: &str, token: CancellationToken) {
        self.lock().insert(run_id.to_owned(), token);
    }

    fn remove(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    fn cancel(&self, run_id: &str) -> bool {
        match self.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn ids(&self) -> HashSet<String> {
        self.lock().keys().cloned().collect()
    }
}

struct EngineInner {
    ledger: RunLedger,
    executor: Arc<dyn TaskExecutor>,
    environments: Arc<dyn EnvironmentProvider>,
    cancels: CancelRegistry,
    events: broadcast::Sender<RunEvent>,
}

/// Dispatches and finalizes runs. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("live_runs", &self.inner.cancels.ids().len())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(
        ledger: RunLedger,
        executor: Arc<dyn TaskExecutor>,
        environments: Arc<dyn EnvironmentProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                ledger,
                executor,
                environments,
                cancels: CancelRegistry::default(),
                events,
            }),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &RunLedger {
        &self.inner.ledger
    }

    /// Receive run lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Start a run of `job_id`.
    ///
    /// Returns `Ok(None)` when the job does not exist. An environment
    /// failure is returned as an error and no run is recorded.
    pub async fn dispatch(&self, job_id: &str, trigger: RunTrigger) -> Result<Option<RunHandle>> {
        let inner = &self.inner;
        let Some(job) = inner.ledger.job(job_id).await? else {
            debug!(job_id, %trigger, "dispatch skipped, job not found");
            return Ok(None);
        };

        let environment = inner.environments.acquire().await.map_err(|e| match e {
            SchedulerError::Environment(_) => e,
            other => SchedulerError::Environment(other.to_string()),
        })?;

        let run = match inner.ledger.create_run(&job.id, trigger).await {
            Ok(run) => run,
            Err(e) => {
                if let Err(release_err) = inner.environments.release(environment).await {
                    warn!(job_id, error = %release_err, "environment release failed");
                }
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        inner.cancels.insert(&run.id, token.clone());
        info!(job_id = %job.id, run_id = %run.id, %trigger, "run started");
        let _ = inner.events.send(RunEvent::Started {
            run_id: run.id.clone(),
            job_id: job.id.clone(),
            trigger,
        });

        let task = tokio::spawn(Arc::clone(inner).drive(
            job,
            run.id.clone(),
            environment,
            token.clone(),
        ));
        Ok(Some(RunHandle {
            run_id: run.id,
            job_id: job_id.to_owned(),
            cancel: token,
            task,
        }))
    }

    /// Dispatch and wait for completion.
    pub async fn execute_job(
        &self,
        job_id: &str,
        trigger: RunTrigger,
    ) -> Result<Option<RunOutcome>> {
        match self.dispatch(job_id, trigger).await? {
            Some(handle) => handle.wait().await.map(Some),
            None => Ok(None),
        }
    }

    /// Cancel a live run started by this process.
    pub fn cancel_run(&self, run_id: &str) -> CancelOutcome {
        if self.inner.cancels.cancel(run_id) {
            info!(run_id, "run cancellation requested");
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::NotFound
        }
    }

    /// Ids of runs with a live cancellation token.
    #[must_use]
    pub fn live_runs(&self) -> HashSet<String> {
        self.inner.cancels.ids()
    }
}

impl EngineInner {
    async fn drive(
        self: Arc<Self>,
        job: Job,
        run_id: String,
        environment: WorkEnvironment,
        token: CancellationToken,
    ) -> RunOutcome {
        let execution = AssertUnwindSafe(self.executor.execute(
            &job.query,
            &environment,
            token.clone(),
        ))
        .catch_unwind()
        .await;

        let now = self.ledger.clock().now();
        let (status, result, transition) = match execution {
            Ok(Ok(output)) => (
                RunStatus::Completed,
                output.result.clone(),
                RunTransition::Complete { at: now, output },
            ),
            Ok(Err(err)) => {
                let reason = if token.is_cancelled() {
                    CANCELLED_BY_USER.to_owned()
                } else {
                    err.to_string()
                };
                (
                    RunStatus::Failed,
                    reason.clone(),
                    RunTransition::Fail { at: now, reason },
                )
            }
            Err(_) => {
                error!(job_id = %job.id, run_id, "task executor panicked");
                (
                    RunStatus::Failed,
                    EXECUTOR_PANICKED.to_owned(),
                    RunTransition::Fail {
                        at: now,
                        reason: EXECUTOR_PANICKED.to_owned(),
                    },
                )
            }
        };

        match self.ledger.update_run(&run_id, transition).await {
            Ok(true) => {}
            Ok(false) => debug!(run_id, "run already terminal or evicted"),
            Err(e) => error!(run_id, error = %e, "failed to record run outcome"),
        }
        self.cancels.remove(&run_id);
        if let Err(e) = self.ledger.update_job_last_run(&job.id, now).await {
            warn!(job_id = %job.id, error = %e, "failed to stamp last run");
        }
        if let Err(e) = self.environments.release(environment).await {
            warn!(job_id = %job.id, run_id, error = %e, "environment release failed");
        }

        info!(job_id = %job.id, run_id, %status, "run finished");
        let _ = self.events.send(RunEvent::Finished {
            run_id: run_id.clone(),
            job_id: job.id.clone(),
            status,
            result: result.clone(),
        });
        RunOutcome {
            run_id,
            job_id: job.id,
            status,
            result,
        }
    }
}
