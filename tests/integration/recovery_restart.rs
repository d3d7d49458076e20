//! Start-up recovery against an on-disk store left behind by a crash.

use crate::helpers::{EchoExecutor, start_scheduler, utc, wait_for_terminal};
use recurra::config::SchedulerConfig;
use recurra::scheduler::run::JOB_TIMED_OUT;
use recurra::scheduler::{Job, Run, RunStatus, RunTrigger, Schedule, Stores};
use std::sync::Arc;

#[tokio::test]
async fn crash_leftovers_are_reaped_and_missed_jobs_caught_up() {
    let temp = tempfile::tempdir().unwrap();
    let now = utc(2026, 10, 1, 12, 0);

    let daily = Job::new(
        "morning report",
        "report",
        Schedule::Daily {
            time: "09:00".parse().unwrap(),
        },
        utc(2026, 9, 20, 0, 0),
    );
    let hourly = Job::new(
        "poller",
        "poll",
        Schedule::Hourly { every: 1 },
        utc(2026, 9, 1, 0, 0),
    );
    let orphan = Run::start(&hourly.id, RunTrigger::Wake, utc(2026, 10, 1, 11, 0));

    {
        let stores = Stores::open_dir(temp.path()).unwrap();
        stores
            .jobs
            .set(vec![daily.clone(), hourly.clone()])
            .await
            .unwrap();
        stores.runs.set(vec![orphan.clone()]).await.unwrap();
    }

    let handle = start_scheduler(
        SchedulerConfig::default(),
        Stores::open_dir(temp.path()).unwrap(),
        now,
        Arc::new(EchoExecutor),
    )
    .await;
    let startup = handle.startup();
    assert_eq!(startup.reaped, 1);
    assert_eq!(startup.triggers_created, 2);
    // The poller ran an hour ago, so only the daily job is caught up.
    assert_eq!(startup.caught_up, 1);

    let caught_up = handle.runs(Some(&daily.id)).await.unwrap();
    assert_eq!(caught_up.len(), 1);
    assert_eq!(caught_up[0].trigger, RunTrigger::CatchUp);
    let finished = wait_for_terminal(&handle, &caught_up[0].id).await;
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.result.as_deref(), Some("report"));
    handle.shutdown().await.unwrap();

    let reopened = Stores::open_dir(temp.path()).unwrap();
    let runs = reopened.runs.get().await.unwrap();
    let reaped = runs.iter().find(|run| run.id == orphan.id).unwrap();
    assert_eq!(reaped.status, RunStatus::Failed);
    assert_eq!(reaped.result.as_deref(), Some(JOB_TIMED_OUT));
    assert_eq!(reaped.completed_at, Some(now));

    let jobs = reopened.jobs.get().await.unwrap();
    let daily_after = jobs.iter().find(|job| job.id == daily.id).unwrap();
    assert_eq!(daily_after.last_run_at, Some(now));
}

#[tokio::test]
async fn recent_running_run_is_left_alone() {
    let now = utc(2026, 10, 1, 12, 0);
    let job = Job::new(
        "poller",
        "poll",
        Schedule::Minutely { every: 5 },
        utc(2026, 9, 1, 0, 0),
    );
    let recent = Run::start(&job.id, RunTrigger::Wake, utc(2026, 10, 1, 11, 55));

    let stores = Stores::in_memory();
    stores.jobs.set(vec![job.clone()]).await.unwrap();
    stores.runs.set(vec![recent.clone()]).await.unwrap();

    let handle = start_scheduler(
        SchedulerConfig::default(),
        stores.clone(),
        now,
        Arc::new(EchoExecutor),
    )
    .await;
    assert_eq!(handle.startup().reaped, 0);
    assert_eq!(handle.startup().caught_up, 0);
    let runs = stores.runs.get().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn catch_up_can_be_disabled() {
    let mut config = SchedulerConfig::default();
    config.recovery.catch_up_on_start = false;
    let job = Job::new(
        "daily",
        "q",
        Schedule::Daily {
            time: "06:00".parse().unwrap(),
        },
        utc(2026, 9, 1, 0, 0),
    );
    let stores = Stores::in_memory();
    stores.jobs.set(vec![job]).await.unwrap();

    let handle = start_scheduler(
        config,
        stores.clone(),
        utc(2026, 10, 1, 12, 0),
        Arc::new(EchoExecutor),
    )
    .await;
    assert_eq!(handle.startup().caught_up, 0);
    assert!(stores.runs.get().await.unwrap().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn out_of_range_values_do_not_stop_startup() {
    let mut config = SchedulerConfig::default();
    config.recovery.stale_run_threshold_secs = 9_000_000_000_000;
    config.recovery.missed_run_lookback_secs = 9_000_000_000_000;
    let now = utc(2026, 10, 1, 12, 0);

    // Written by an older build that accepted any interval.
    let oversized = Job::new(
        "forever",
        "q",
        Schedule::Hourly {
            every: 3_000_000_000,
        },
        utc(2020, 1, 1, 0, 0),
    );
    let daily = Job::new(
        "daily",
        "d",
        Schedule::Daily {
            time: "09:00".parse().unwrap(),
        },
        utc(2026, 9, 1, 0, 0),
    );
    let orphan = Run::start("gone", RunTrigger::Wake, utc(2026, 1, 1, 0, 0));
    let stores = Stores::in_memory();
    stores
        .jobs
        .set(vec![oversized.clone(), daily.clone()])
        .await
        .unwrap();
    stores.runs.set(vec![orphan]).await.unwrap();

    let handle = start_scheduler(config, stores.clone(), now, Arc::new(EchoExecutor)).await;
    let startup = handle.startup();
    assert_eq!(startup.reaped, 0);
    assert_eq!(startup.triggers_created, 1);
    assert_eq!(startup.caught_up, 1);
    assert!(handle.wake().get(&oversized.id).is_none());
    assert!(handle.wake().get(&daily.id).is_some());
    assert!(handle.runs(Some(&oversized.id)).await.unwrap().is_empty());
    handle.shutdown().await.unwrap();
}
