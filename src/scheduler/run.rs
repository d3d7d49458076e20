//! Run records: one execution attempt of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result text recorded when a run is cancelled through its handle.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Result text recorded when a run is reaped as stale at start-up.
pub const JOB_TIMED_OUT: &str = "Job timed out";

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and Failed are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// A wake trigger fired.
    Wake,
    /// An explicit `run_now` request.
    Manual,
    /// Start-up catch-up of a missed fire.
    CatchUp,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Wake => "wake",
            Self::Manual => "manual",
            Self::CatchUp => "catch_up",
        };
        f.write_str(label)
    }
}

/// Successful executor output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Human-readable result text.
    pub result: String,
    #[serde(default)]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub execution_log: Vec<String>,
}

impl TaskOutput {
    /// Output carrying only a result string.
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            ..Self::default()
        }
    }
}

/// A terminal transition applied to a running run.
///
/// The only way to move a run out of `Running`, so `completed_at` is
/// always set together with a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTransition {
    Complete {
        at: DateTime<Utc>,
        output: TaskOutput,
    },
    Fail {
        at: DateTime<Utc>,
        reason: String,
    },
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    /// Owning job; the job may since have been deleted.
    pub job_id: String,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub execution_log: Vec<String>,
}

impl Run {
    /// A fresh `Running` record.
    pub fn start(job_id: impl Into<String>, trigger: RunTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            status: RunStatus::Running,
            trigger,
            started_at: now,
            completed_at: None,
            result: None,
            final_answer: None,
            execution_log: Vec::new(),
        }
    }

    /// Apply a terminal transition. Returns `false` if already terminal.
    pub fn finish(&mut self, transition: RunTransition) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match transition {
            RunTransition::Complete { at, output } => {
                self.status = RunStatus::Completed;
                self.completed_at = Some(at);
                self.result = Some(output.result);
                self.final_answer = output.final_answer;
                self.execution_log = output.execution_log;
            }
            RunTransition::Fail { at, reason } => {
                self.status = RunStatus::Failed;
                self.completed_at = Some(at);
                self.result = Some(reason);
            }
        }
        true
    }

    /// Seconds between start and completion, if terminal.
    #[must_use]
    pub fn duration_secs(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_seconds().max(0))
    }
}
