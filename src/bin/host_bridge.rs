//! Headless scheduler host speaking newline-delimited JSON on stdin/stdout.
//!
//! Loads `config.toml` from the recurra config directory, starts the
//! scheduler with the shell executor, and serves host commands until stdin
//! closes or `runtime.stop` arrives. Diagnostics go to stderr and the log
//! directory so stdout stays a clean protocol channel.

use recurra::config::SchedulerConfig;
use recurra::executor::{ShellTaskExecutor, WorkspaceProvider};
use recurra::host::stdio::run_stdio_bridge;
use recurra::scheduler::Scheduler;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = SchedulerConfig::default_config_path();
    let config = SchedulerConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", config_path.display()))?;
    let _log_guard = recurra::logging::init(&config.logging)
        .map_err(|e| anyhow::anyhow!("cannot initialise logging: {e}"))?;

    tracing::info!(config = %config_path.display(), "recurra-host starting");

    let executor = Arc::new(ShellTaskExecutor::from_config(&config.executor));
    let handle = Scheduler::new(config, executor, Arc::new(WorkspaceProvider::default_root()))
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("scheduler failed to start: {e}"))?;

    let startup = handle.startup();
    tracing::info!(
        reaped = startup.reaped,
        triggers = startup.triggers_created,
        caught_up = startup.caught_up,
        "scheduler ready"
    );

    let bridge = run_stdio_bridge(handle.clone()).await;
    handle
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("scheduler shutdown failed: {e}"))?;

    bridge.map_err(|e| {
        tracing::error!(error = %e, "recurra-host exited with error");
        anyhow::anyhow!("recurra-host failed: {e}")
    })?;

    tracing::info!("recurra-host shut down cleanly");
    Ok(())
}
