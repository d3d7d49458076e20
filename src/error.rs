//! Error types for the recurra scheduler.

/// Top-level error type for job scheduling, execution and sync.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Malformed schedule or job definition.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A job id did not resolve to a stored job.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Work environment could not be acquired or released.
    #[error("environment error: {0}")]
    Environment(String),

    /// Persistent store read, write or actor failure.
    #[error("store error: {0}")]
    Store(String),

    /// Remote backend request failed.
    #[error("remote error: {0}")]
    Remote(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Host command rejected before reaching the scheduler.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;
