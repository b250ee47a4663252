use std::path::PathBuf;
use std::time::Duration;

use crate::error::BuildfarmError;

/// Failure-count thresholds used by the failure judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JudgeThresholds {
    /// Equal worker/job counts at or above this reset the job.
    pub job_reset: u32,
    /// Worker counts at or above this (and above the job's) fail the worker.
    pub worker_failure: u32,
}

impl Default for JudgeThresholds {
    fn default() -> Self {
        Self {
            job_reset: 3,
            worker_failure: 5,
        }
    }
}

/// Configuration for the scheduling service and its scanners.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between scans of a single worker.
    pub poll_interval: Duration,
    /// Interval between fleet discovery cycles.
    pub fleet_interval: Duration,
    /// How long a worker gets to honour an abort request.
    pub cancel_deadline: Duration,
    /// Network timeout for every worker RPC.
    pub rpc_timeout: Duration,
    /// Upper bound on waiting for in-flight scans at shutdown.
    pub shutdown_timeout: Duration,
    /// A scanner is reported stale after this many poll intervals without
    /// completing a scan.
    pub stale_scan_factor: u32,
    /// Delay each scanner's first scan by a random fraction of the poll
    /// interval so a large fleet is not polled in lockstep.
    pub jitter_first_scan: bool,
    pub thresholds: JudgeThresholds,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            fleet_interval: Duration::from_secs(15),
            cancel_deadline: Duration::from_secs(180),
            rpc_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            stale_scan_factor: 10,
            jitter_first_scan: true,
            thresholds: JudgeThresholds::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_fleet_interval(mut self, interval: Duration) -> Self {
        self.fleet_interval = interval;
        self
    }

    pub fn with_cancel_deadline(mut self, deadline: Duration) -> Self {
        self.cancel_deadline = deadline;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter_first_scan: bool) -> Self {
        self.jitter_first_scan = jitter_first_scan;
        self
    }

    pub fn with_thresholds(mut self, thresholds: JudgeThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Age after which a scanner's last completed scan is considered stale.
    pub fn stale_after(&self) -> Duration {
        self.poll_interval * self.stale_scan_factor
    }

    /// Reject configurations the scanners cannot run with.
    pub fn validate(&self) -> Result<(), BuildfarmError> {
        if self.poll_interval.is_zero() {
            return Err(BuildfarmError::Config("poll interval must be non-zero".into()));
        }
        if self.fleet_interval.is_zero() {
            return Err(BuildfarmError::Config("fleet interval must be non-zero".into()));
        }
        if self.thresholds.job_reset == 0 || self.thresholds.worker_failure == 0 {
            return Err(BuildfarmError::Config("failure thresholds must be positive".into()));
        }
        Ok(())
    }
}

/// Where the binary loads the fleet from and persists it back to.
#[derive(Debug, Clone)]
pub struct FleetFileConfig {
    pub path: PathBuf,
    /// Write the registry back to `path` on shutdown.
    pub persist_on_shutdown: bool,
}
