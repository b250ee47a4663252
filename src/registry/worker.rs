use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::job::JobRequirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanStatus {
    Clean,
    Dirty,
    Cleaning,
}

impl std::fmt::Display for CleanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanStatus::Clean => write!(f, "clean"),
            CleanStatus::Dirty => write!(f, "dirty"),
            CleanStatus::Cleaning => write!(f, "cleaning"),
        }
    }
}

/// A plain snapshot of one worker's persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerVitals {
    pub name: String,
    pub url: String,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub virtualized: bool,
    #[serde(default = "default_clean_status")]
    pub clean_status: CleanStatus,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub failure_note: Option<String>,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub trusted: bool,
    /// The job currently bound to this worker. Derived by the registry from
    /// the jobs table, never stored on the worker record.
    #[serde(skip)]
    pub current_job: Option<Uuid>,
}

fn default_healthy() -> bool {
    true
}

fn default_clean_status() -> CleanStatus {
    CleanStatus::Clean
}

impl WorkerVitals {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            healthy: true,
            virtualized: false,
            clean_status: CleanStatus::Clean,
            version: None,
            manual: false,
            failure_count: 0,
            failure_note: None,
            processors: Vec::new(),
            trusted: false,
            current_job: None,
        }
    }

    pub fn with_processors<I, S>(mut self, processors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.processors = processors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_virtualized(mut self, virtualized: bool) -> Self {
        self.virtualized = virtualized;
        self
    }

    pub fn with_trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn with_clean_status(mut self, status: CleanStatus) -> Self {
        self.clean_status = status;
        self
    }

    pub fn with_manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            processors: self.processors.clone(),
            virtualized: self.virtualized,
            trusted: self.trusted,
        }
    }
}

/// What a worker can build; used to select pending jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCapabilities {
    pub processors: Vec<String>,
    pub virtualized: bool,
    pub trusted: bool,
}

impl WorkerCapabilities {
    pub fn satisfies(&self, requirements: &JobRequirements) -> bool {
        if requirements.virtualized != self.virtualized {
            return false;
        }
        if requirements.restricted && !self.trusted {
            return false;
        }
        match &requirements.processor {
            Some(processor) => self.processors.iter().any(|p| p == processor),
            None => true,
        }
    }
}
