//! Shared helpers for integration tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use recurra::config::SchedulerConfig;
use recurra::scheduler::{
    ManualClock, NoEnvironment, Run, RunStatus, Scheduler, SchedulerHandle, Stores, TaskError,
    TaskExecutor, TaskOutput, WorkEnvironment,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Completes every run with its query as the result.
pub(crate) struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        query: &str,
        _environment: &WorkEnvironment,
        _cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput::text(query))
    }
}

/// Runs until cancelled.
pub(crate) struct BlockingExecutor;

#[async_trait]
impl TaskExecutor for BlockingExecutor {
    async fn execute(
        &self,
        _query: &str,
        _environment: &WorkEnvironment,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        cancel.cancelled().await;
        Err(TaskError::Cancelled)
    }
}

pub(crate) fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

/// Start a scheduler on `stores` with a clock pinned at `now`.
pub(crate) async fn start_scheduler(
    config: SchedulerConfig,
    stores: Stores,
    now: DateTime<Utc>,
    executor: Arc<dyn TaskExecutor>,
) -> SchedulerHandle {
    Scheduler::new(config, executor, Arc::new(NoEnvironment))
        .with_stores(stores)
        .with_clock(Arc::new(ManualClock::new(now)))
        .start()
        .await
        .expect("scheduler starts")
}

/// Poll until `run_id` reaches a terminal state.
pub(crate) async fn wait_for_terminal(handle: &SchedulerHandle, run_id: &str) -> Run {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let runs = handle.runs(None).await.unwrap();
            if let Some(run) = runs.into_iter().find(|run| run.id == run_id) {
                if run.status != RunStatus::Running {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run did not finish in time")
}
