//! Talking to build workers.
//!
//! The scheduler treats a worker purely through the five operations of
//! [`WorkerClient`]; the transport behind them is substitutable.
//!
//! # Components
//!
//! - [`WorkerClient`]: status / abort / start-build / clean / fetch-file
//! - [`WorkerClientFactory`]: builds a client for a newly discovered worker
//! - [`http::HttpWorkerClient`]: HTTP+JSON transport over `reqwest`
//!
//! # Timeouts
//!
//! Every call is bounded by the configured RPC timeout. A call that times out
//! or cannot connect fails with [`ScanError::WorkerUnreachable`], which the
//! scanner feeds to the failure judge like any other transient fault.

pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::registry::{JobSnapshot, WorkerVitals};

pub use http::{HttpClientFactory, HttpWorkerClient};

/// Build identity of the log file every worker produces.
pub const BUILD_LOG: &str = "buildlog";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Idle,
    Building,
    /// Finished a build and is holding its results for collection.
    Waiting,
    Aborting,
    Aborted,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Building => write!(f, "building"),
            WorkerState::Waiting => write!(f, "waiting"),
            WorkerState::Aborting => write!(f, "aborting"),
            WorkerState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Result of a finished build as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildOutcome {
    Ok,
    PackageFail,
    DepFail,
    ChrootFail,
    BuilderFail,
    GivenBack,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub state: WorkerState,
    /// Cookie of the job the worker believes it is running.
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub log_tail: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Set once the worker is WAITING or ABORTED.
    #[serde(default)]
    pub outcome: Option<BuildOutcome>,
    /// Produced files, name to fetchable identity.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Option<String>,
}

impl WorkerStatusReport {
    pub fn idle() -> Self {
        Self {
            state: WorkerState::Idle,
            cookie: None,
            log_tail: None,
            version: None,
            outcome: None,
            files: BTreeMap::new(),
            dependencies: None,
        }
    }

    pub fn building(cookie: impl Into<String>) -> Self {
        Self {
            state: WorkerState::Building,
            cookie: Some(cookie.into()),
            ..Self::idle()
        }
    }

    pub fn waiting(cookie: impl Into<String>, outcome: BuildOutcome) -> Self {
        Self {
            state: WorkerState::Waiting,
            cookie: Some(cookie.into()),
            outcome: Some(outcome),
            ..Self::idle()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_log_tail(mut self, tail: impl Into<String>) -> Self {
        self.log_tail = Some(tail.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, identity: impl Into<String>) -> Self {
        self.files.insert(name.into(), identity.into());
        self
    }

    /// Whether the worker has nothing running and nothing to collect.
    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle && self.cookie.is_none()
    }
}

/// Everything a worker needs to start a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub cookie: String,
    pub build_kind: String,
    pub chroot: String,
    pub files: BTreeMap<String, String>,
    pub extra_args: serde_json::Map<String, serde_json::Value>,
}

impl From<&JobSnapshot> for BuildRequest {
    fn from(job: &JobSnapshot) -> Self {
        Self {
            cookie: job.cookie.clone(),
            build_kind: job.build_kind.clone(),
            chroot: job.chroot.clone(),
            files: job.files.clone(),
            extra_args: job.extra_args.clone(),
        }
    }
}

/// RPC surface of one remote worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn status(&self) -> Result<WorkerStatusReport, ScanError>;

    /// Ask the worker to abandon its current build. Idempotent.
    async fn abort(&self) -> Result<(), ScanError>;

    async fn start_build(&self, request: &BuildRequest) -> Result<(), ScanError>;

    /// Reset an idle worker. `true` when done, `false` when still cleaning.
    async fn clean(&self) -> Result<bool, ScanError>;

    async fn fetch_file(&self, identity: &str) -> Result<Vec<u8>, ScanError>;
}

/// Builds a client for a worker discovered by the fleet scanner.
pub trait WorkerClientFactory: Send + Sync {
    fn client_for(&self, vitals: &WorkerVitals) -> Result<Arc<dyn WorkerClient>, ScanError>;
}
