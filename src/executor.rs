//! Built-in task executor and work-environment provider.
//!
//! [`ShellTaskExecutor`] runs a job's query as `<shell> -c <query>` inside
//! the run's workspace. [`WorkspaceProvider`] hands each run a fresh
//! scratch directory and deletes it afterwards.

use crate::config::ExecutorConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::engine::{EnvironmentProvider, TaskError, TaskExecutor, WorkEnvironment};
use crate::scheduler::run::TaskOutput;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Runs queries through a shell.
#[derive(Debug, Clone)]
pub struct ShellTaskExecutor {
    shell: String,
    max_output_chars: usize,
}

impl ShellTaskExecutor {
    #[must_use]
    pub fn new(shell: impl Into<String>, max_output_chars: usize) -> Self {
        Self {
            shell: shell.into(),
            max_output_chars,
        }
    }

    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.shell.clone(), config.max_output_chars)
    }
}

impl Default for ShellTaskExecutor {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

#[async_trait]
impl TaskExecutor for ShellTaskExecutor {
    async fn execute(
        &self,
        query: &str,
        environment: &WorkEnvironment,
        cancel: CancellationToken,
    ) -> std::result::Result<TaskOutput, TaskError> {
        let mut command = tokio::process::Command::new(&self.shell);
        command
            .arg("-c")
            .arg(query)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &environment.path {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        // Dropping the wait future on cancellation kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            () = cancel.cancelled() => {
                debug!(environment = %environment.id, "shell task killed on cancel");
                return Err(TaskError::Cancelled);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_owned(), |c| c.to_string());
            let detail = truncate(stderr.trim(), self.max_output_chars);
            return Err(TaskError::Failed(if detail.is_empty() {
                format!("command exited with status {code}")
            } else {
                format!("command exited with status {code}: {detail}")
            }));
        }

        let result = truncate(stdout.trim_end(), self.max_output_chars);
        let final_answer = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_owned);
        let execution_log = stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(TaskOutput {
            result,
            final_answer,
            execution_log,
        })
    }
}

/// Keep at most `max` characters, marking the cut.
fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text.to_owned(),
    }
}

/// One scratch directory per run under a root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceProvider {
    root: PathBuf,
}

impl WorkspaceProvider {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Provider rooted at [`crate::recurra_dirs::workspaces_dir`].
    #[must_use]
    pub fn default_root() -> Self {
        Self::new(crate::recurra_dirs::workspaces_dir())
    }
}

#[async_trait]
impl EnvironmentProvider for WorkspaceProvider {
    async fn acquire(&self) -> Result<WorkEnvironment> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.root.join(&id);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            SchedulerError::Environment(format!("cannot create workspace {}: {e}", path.display()))
        })?;
        Ok(WorkEnvironment {
            id,
            path: Some(path),
        })
    }

    async fn release(&self, environment: WorkEnvironment) -> Result<()> {
        let Some(path) = environment.path else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SchedulerError::Environment(format!(
                "cannot remove workspace {}: {e}",
                path.display()
            ))),
        }
    }
}
