//! Recurra: a recurring job scheduler.
//!
//! Jobs carry a daily, hourly or minutely schedule and fire from in-process
//! wake triggers. Each fire creates a run record, executes the job's query
//! through a [`scheduler::TaskExecutor`] inside a per-run work environment,
//! and finalizes the run exactly once, even when the executor panics or the
//! run is cancelled.
//!
//! # Architecture
//!
//! - **Store**: single-writer collections of jobs and runs, persisted as
//!   versioned JSON snapshots
//! - **Wake triggers**: one timer task per enabled job
//! - **Execution engine**: run lifecycle, cancellation, reentrancy guard
//! - **Recovery**: stale-run reaping and missed-run catch-up at start-up
//! - **Sync**: last-write-wins reconciliation with a remote job store
//! - **Host bridge**: versioned JSON commands and events over stdio

pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod logging;
pub mod recurra_dirs;
pub mod remote;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use executor::{ShellTaskExecutor, WorkspaceProvider};
pub use remote::HttpRemoteBackend;
pub use scheduler::{Job, Run, RunStatus, Schedule, Scheduler, SchedulerHandle};
