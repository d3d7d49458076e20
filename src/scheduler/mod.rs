//! Recurring job scheduler.
//!
//! Jobs fire from wake triggers, run through the execution engine, and
//! leave a bounded history of runs. Start-up recovery reaps runs orphaned
//! by a crash and catches up fires missed while the process was down.
//! Job definitions can be reconciled with a remote store.

pub mod clock;
pub mod engine;
pub mod job;
pub mod jobs;
pub mod ledger;
pub mod recovery;
pub mod run;
pub mod runner;
pub mod store;
pub mod sync;
pub mod wake;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    CancelOutcome, EnvironmentProvider, ExecutionEngine, NoEnvironment, RunEvent, RunHandle,
    RunOutcome, TaskError, TaskExecutor, WorkEnvironment,
};
pub use job::{Job, Schedule, TimeOfDay};
pub use jobs::{JobPatch, JobService};
pub use ledger::RunLedger;
pub use recovery::{Recovery, RecoveryPolicy};
pub use run::{Run, RunStatus, RunTransition, RunTrigger, TaskOutput};
pub use runner::{Scheduler, SchedulerHandle, StartupSummary};
pub use store::{Collection, Stores};
pub use sync::{RemoteBackend, RemoteJob, RemotePatch, SyncReconciler, SyncReport};
pub use wake::{WakeEvent, WakeScheduler};
