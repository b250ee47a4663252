use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Building,
    Cancelling,
    Cancelled,
    Succeeded,
    Failed,
    DependencyWait,
}

impl JobStatus {
    /// Statuses in which the job occupies a worker.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Building | JobStatus::Cancelling)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled
                | JobStatus::Succeeded
                | JobStatus::Failed
                | JobStatus::DependencyWait
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Building => write!(f, "building"),
            JobStatus::Cancelling => write!(f, "cancelling"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::DependencyWait => write!(f, "dependency-wait"),
        }
    }
}

/// How a job left the worker, as recorded by `mark_terminal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded,
    /// The build itself failed (package or chroot failure, or a scheduler
    /// decision); the note is kept for operators.
    Failed { note: String },
    DependencyWait { dependencies: String },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::DependencyWait { .. } => JobStatus::DependencyWait,
        }
    }
}

/// What a worker must offer to take a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirements {
    /// Architecture tag; `None` builds anywhere.
    pub processor: Option<String>,
    pub virtualized: bool,
    /// Restricted (private) jobs only go to trusted workers.
    #[serde(default)]
    pub restricted: bool,
}

/// A plain snapshot of one job as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub cookie: String,
    pub status: JobStatus,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    #[serde(default)]
    pub requirements: JobRequirements,
    #[serde(default)]
    pub score: i64,
    pub submitted_at: DateTime<Utc>,
    pub build_kind: String,
    pub chroot: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_args: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_in_queue")]
    pub in_queue: bool,
    #[serde(default)]
    pub log_tail: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub failure_note: Option<String>,
    #[serde(default)]
    pub dependencies: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_in_queue() -> bool {
    true
}

impl JobSnapshot {
    /// A new pending job with a fresh id and cookie.
    pub fn new(build_kind: impl Into<String>, chroot: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            cookie: format!("{}-{}", id.simple(), Utc::now().timestamp()),
            status: JobStatus::Pending,
            failure_count: 0,
            assigned_worker: None,
            requirements: JobRequirements::default(),
            score: 0,
            submitted_at: Utc::now(),
            build_kind: build_kind.into(),
            chroot: chroot.into(),
            files: BTreeMap::new(),
            extra_args: serde_json::Map::new(),
            in_queue: true,
            log_tail: None,
            artifacts: Vec::new(),
            failure_note: None,
            dependencies: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    pub fn with_requirements(mut self, requirements: JobRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = cookie.into();
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, identity: impl Into<String>) -> Self {
        self.files.insert(name.into(), identity.into());
        self
    }

    /// Whether the job can be dispatched right now.
    pub fn is_dispatchable(&self) -> bool {
        self.status == JobStatus::Pending && self.in_queue
    }
}
