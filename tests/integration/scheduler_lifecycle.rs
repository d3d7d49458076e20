//! Job editing, manual runs, cancellation and retention through the
//! public scheduler handle.

use crate::helpers::{BlockingExecutor, EchoExecutor, start_scheduler, utc, wait_for_terminal};
use recurra::config::SchedulerConfig;
use recurra::scheduler::run::CANCELLED_BY_USER;
use recurra::scheduler::{CancelOutcome, JobPatch, RunStatus, RunTrigger, Schedule, Stores};
use std::sync::Arc;

#[tokio::test]
async fn cancelled_run_fails_with_user_reason() {
    let handle = start_scheduler(
        SchedulerConfig::default(),
        Stores::in_memory(),
        utc(2026, 10, 1, 10, 0),
        Arc::new(BlockingExecutor),
    )
    .await;
    let job = handle
        .jobs()
        .create_job("long", "wait", Schedule::Hourly { every: 4 })
        .await
        .unwrap();

    let run = handle.run_now(&job.id).await.unwrap();
    let run_id = run.run_id.clone();
    assert_eq!(handle.cancel_run(&run_id), CancelOutcome::Cancelled);

    let finished = wait_for_terminal(&handle, &run_id).await;
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.trigger, RunTrigger::Manual);
    assert_eq!(finished.result.as_deref(), Some(CANCELLED_BY_USER));
    assert_eq!(handle.cancel_run(&run_id), CancelOutcome::NotFound);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn history_is_capped_per_job() {
    let mut config = SchedulerConfig::default();
    config.retention.max_runs_per_job = 3;
    let handle = start_scheduler(
        config,
        Stores::in_memory(),
        utc(2026, 10, 1, 10, 0),
        Arc::new(EchoExecutor),
    )
    .await;
    let job = handle
        .jobs()
        .create_job("echo", "hi", Schedule::Minutely { every: 30 })
        .await
        .unwrap();

    for _ in 0..5 {
        let outcome = handle.run_now(&job.id).await.unwrap().wait().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.result, "hi");
    }
    let runs = handle.runs(Some(&job.id)).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|run| run.status == RunStatus::Completed));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn edits_keep_triggers_in_step() {
    let handle = start_scheduler(
        SchedulerConfig::default(),
        Stores::in_memory(),
        utc(2026, 10, 1, 10, 0),
        Arc::new(EchoExecutor),
    )
    .await;
    let jobs = handle.jobs();
    let job = jobs
        .create_job("digest", "q", Schedule::Hourly { every: 1 })
        .await
        .unwrap();
    assert_eq!(
        handle.wake().get(&job.id).unwrap().schedule,
        Schedule::Hourly { every: 1 }
    );

    let daily = Schedule::Daily {
        time: "18:45".parse().unwrap(),
    };
    jobs.set_job_schedule(&job.id, daily).await.unwrap();
    assert_eq!(handle.wake().get(&job.id).unwrap().schedule, daily);

    let patch = JobPatch {
        enabled: Some(false),
        ..JobPatch::default()
    };
    let disabled = jobs.update_job(&job.id, patch).await.unwrap();
    assert!(!disabled.enabled);
    assert!(handle.wake().get(&job.id).is_none());

    jobs.set_enabled(&job.id, true).await.unwrap();
    jobs.set_enabled(&job.id, true).await.unwrap();
    assert_eq!(handle.wake().names().len(), 1);
    assert_eq!(handle.wake().get(&job.id).unwrap().schedule, daily);

    assert!(jobs.delete_job(&job.id).await.unwrap());
    assert!(handle.wake().is_empty());
    assert!(!jobs.delete_job(&job.id).await.unwrap());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn jobs_survive_restart_on_disk() {
    let temp = tempfile::tempdir().unwrap();
    let now = utc(2026, 10, 1, 10, 0);

    let handle = start_scheduler(
        SchedulerConfig::default(),
        Stores::open_dir(temp.path()).unwrap(),
        now,
        Arc::new(EchoExecutor),
    )
    .await;
    handle
        .jobs()
        .create_job("on", "q", Schedule::Hourly { every: 3 })
        .await
        .unwrap();
    let off = handle
        .jobs()
        .create_job("off", "q", Schedule::Minutely { every: 10 })
        .await
        .unwrap();
    handle.jobs().set_enabled(&off.id, false).await.unwrap();
    handle.shutdown().await.unwrap();
    assert!(temp.path().join("jobs.json").is_file());

    let restarted = start_scheduler(
        SchedulerConfig::default(),
        Stores::open_dir(temp.path()).unwrap(),
        now,
        Arc::new(EchoExecutor),
    )
    .await;
    assert_eq!(restarted.jobs().list().await.unwrap().len(), 2);
    assert_eq!(restarted.startup().triggers_created, 1);
    assert_eq!(restarted.wake().len(), 1);
    restarted.shutdown().await.unwrap();
}
