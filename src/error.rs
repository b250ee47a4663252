use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a registry implementation.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Commit rejected: {0}")]
    CommitRejected(String),

    /// Another writer took the job or the worker first.
    #[error("Assignment conflict: {0}")]
    Conflict(String),

    #[error("Registry lock poisoned")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Everything that can go wrong during one scan of one worker.
///
/// None of these escape a scanner loop: they are fed to the failure judge
/// (or handled directly, for `CannotBuild` and lost jobs).
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Worker {worker} unreachable: {reason}")]
    WorkerUnreachable { worker: String, reason: String },

    #[error("Worker {worker} cannot build: {reason}")]
    CannotBuild { worker: String, reason: String },

    #[error("Worker {worker} isolation violation: {detail}")]
    WorkerIsolationViolation { worker: String, detail: String },

    #[error("Worker {worker} did not abort job {job_id} within {deadline:?}")]
    CancellationTimeout {
        worker: String,
        job_id: Uuid,
        deadline: Duration,
    },

    #[error("Registry commit failed: {0}")]
    RegistryCommitFailure(#[source] RegistryError),

    #[error("Worker {worker} protocol error: {reason}")]
    WorkerProtocol { worker: String, reason: String },

    #[error("Worker {worker} reported a builder failure for job {job_id}")]
    BuilderFailure { worker: String, job_id: Uuid },

    #[error("Worker {worker} aborted job {job_id} which was not being cancelled")]
    UnexpectedAbort { worker: String, job_id: Uuid },

    #[error("Registry read failed: {0}")]
    Registry(#[from] RegistryError),
}

impl ScanError {
    /// Isolation violations are judged fail/fail regardless of counts.
    pub fn is_isolation_violation(&self) -> bool {
        matches!(self, ScanError::WorkerIsolationViolation { .. })
    }

    pub fn is_commit_failure(&self) -> bool {
        matches!(self, ScanError::RegistryCommitFailure(_))
    }
}

/// Service-level errors surfaced to the operator.
#[derive(Error, Debug)]
pub enum BuildfarmError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Registry commit failed during shutdown for worker(s): {}", .0.join(", "))]
    RegistryCommitFailure(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildfarmError>;
