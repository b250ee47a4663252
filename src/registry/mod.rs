//! Persisted worker and job state.
//!
//! Reads return plain value snapshots ([`WorkerVitals`], [`JobSnapshot`]).
//! Writes are never applied one at a time: a scan records them in a
//! [`ChangeSet`] and hands the whole batch to [`Registry::commit`], which
//! applies all of it or none of it.

pub mod job;
pub mod memory;
pub mod worker;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RegistryError;

pub use job::{JobOutcome, JobRequirements, JobSnapshot, JobStatus};
pub use memory::MemoryRegistry;
pub use worker::{CleanStatus, WorkerCapabilities, WorkerVitals};

/// Read access to the worker fleet.
pub trait WorkerRegistry: Send + Sync {
    fn list_all(&self) -> Result<Vec<WorkerVitals>, RegistryError>;

    fn get_vitals(&self, name: &str) -> Result<WorkerVitals, RegistryError>;
}

/// Read access to the job queue.
pub trait JobRegistry: Send + Sync {
    fn get_job(&self, id: Uuid) -> Result<JobSnapshot, RegistryError>;

    /// The job whose build carries `cookie`, if any.
    fn job_by_cookie(&self, cookie: &str) -> Result<Option<JobSnapshot>, RegistryError>;

    /// Dispatchable jobs the given worker can build, best candidate first:
    /// highest score, then oldest submission.
    fn pending_jobs_for(
        &self,
        capabilities: &WorkerCapabilities,
    ) -> Result<Vec<JobSnapshot>, RegistryError>;
}

/// A registry that can apply a batch of changes atomically.
pub trait Registry: WorkerRegistry + JobRegistry {
    fn commit(&self, changes: ChangeSet) -> Result<(), RegistryError>;
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    SetHealthy {
        worker: String,
        healthy: bool,
        note: Option<String>,
    },
    SetCleanStatus {
        worker: String,
        status: CleanStatus,
    },
    IncrementWorkerFailure {
        worker: String,
    },
    ResetWorkerFailure {
        worker: String,
    },
    SetVersion {
        worker: String,
        version: String,
    },
    MarkBuilding {
        job: Uuid,
        worker: String,
    },
    MarkStarted {
        job: Uuid,
        at: DateTime<Utc>,
    },
    RecordProgress {
        job: Uuid,
        log_tail: String,
    },
    RecordArtifacts {
        job: Uuid,
        artifacts: Vec<String>,
    },
    MarkTerminal {
        job: Uuid,
        outcome: JobOutcome,
        at: DateTime<Utc>,
    },
    ResetJob {
        job: Uuid,
    },
    MarkCancelled {
        job: Uuid,
        at: DateTime<Utc>,
    },
    Evict {
        job: Uuid,
    },
    IncrementJobFailure {
        job: Uuid,
    },
    ResetJobFailure {
        job: Uuid,
    },
}

/// An ordered batch of writes produced by one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    mutations: Vec<Mutation>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    fn push(&mut self, mutation: Mutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    // Worker writes

    pub fn set_healthy(&mut self, worker: &str, healthy: bool, note: Option<String>) -> &mut Self {
        self.push(Mutation::SetHealthy {
            worker: worker.to_string(),
            healthy,
            note,
        })
    }

    pub fn set_clean_status(&mut self, worker: &str, status: CleanStatus) -> &mut Self {
        self.push(Mutation::SetCleanStatus {
            worker: worker.to_string(),
            status,
        })
    }

    pub fn increment_worker_failure(&mut self, worker: &str) -> &mut Self {
        self.push(Mutation::IncrementWorkerFailure {
            worker: worker.to_string(),
        })
    }

    pub fn reset_worker_failure(&mut self, worker: &str) -> &mut Self {
        self.push(Mutation::ResetWorkerFailure {
            worker: worker.to_string(),
        })
    }

    pub fn set_version(&mut self, worker: &str, version: impl Into<String>) -> &mut Self {
        self.push(Mutation::SetVersion {
            worker: worker.to_string(),
            version: version.into(),
        })
    }

    // Job writes

    pub fn mark_building(&mut self, job: Uuid, worker: &str) -> &mut Self {
        self.push(Mutation::MarkBuilding {
            job,
            worker: worker.to_string(),
        })
    }

    pub fn mark_started(&mut self, job: Uuid, at: DateTime<Utc>) -> &mut Self {
        self.push(Mutation::MarkStarted { job, at })
    }

    pub fn record_progress(&mut self, job: Uuid, log_tail: impl Into<String>) -> &mut Self {
        self.push(Mutation::RecordProgress {
            job,
            log_tail: log_tail.into(),
        })
    }

    pub fn record_artifacts(&mut self, job: Uuid, artifacts: Vec<String>) -> &mut Self {
        self.push(Mutation::RecordArtifacts { job, artifacts })
    }

    pub fn mark_terminal(&mut self, job: Uuid, outcome: JobOutcome, at: DateTime<Utc>) -> &mut Self {
        self.push(Mutation::MarkTerminal { job, outcome, at })
    }

    /// Return an active job to the queue, unassigned.
    pub fn reset_job(&mut self, job: Uuid) -> &mut Self {
        self.push(Mutation::ResetJob { job })
    }

    pub fn mark_cancelled(&mut self, job: Uuid, at: DateTime<Utc>) -> &mut Self {
        self.push(Mutation::MarkCancelled { job, at })
    }

    /// Drop a job from the queue without touching its status or result.
    pub fn evict(&mut self, job: Uuid) -> &mut Self {
        self.push(Mutation::Evict { job })
    }

    pub fn increment_job_failure(&mut self, job: Uuid) -> &mut Self {
        self.push(Mutation::IncrementJobFailure { job })
    }

    pub fn reset_job_failure(&mut self, job: Uuid) -> &mut Self {
        self.push(Mutation::ResetJobFailure { job })
    }
}
