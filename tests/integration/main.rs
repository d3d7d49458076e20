//! Integration tests, consolidated into a single binary.

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

#[cfg(unix)]
mod host_bridge_e2e;
mod host_commands;
mod recovery_restart;
mod remote_sync;
mod scheduler_lifecycle;
