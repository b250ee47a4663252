use crate::config::JudgeThresholds;
use crate::error::ScanError;

/// What to do with one side (worker or job) after a failed scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Reset,
    Fail,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::None => write!(f, "none"),
            Action::Reset => write!(f, "reset"),
            Action::Fail => write!(f, "fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub worker: Action,
    pub job: Action,
}

impl Verdict {
    pub const fn new(worker: Action, job: Action) -> Self {
        Self { worker, job }
    }
}

/// Decides who to blame for a failed scan.
///
/// Counts are compared rather than thresholded alone: a worker failing on
/// every job is broken, a job failing on every worker is the culprit, and
/// equal counts are resolved by bounded retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureJudge {
    thresholds: JudgeThresholds,
}

impl FailureJudge {
    pub fn new(thresholds: JudgeThresholds) -> Self {
        Self { thresholds }
    }

    /// `worker_failures` and `job_failures` are the consecutive failure counts
    /// including the failure being judged; `job_failures` is 0 when no job is
    /// involved.
    pub fn judge(
        &self,
        worker_failures: u32,
        job_failures: u32,
        error: &ScanError,
        retry_allowed: bool,
    ) -> Verdict {
        if error.is_isolation_violation() {
            return Verdict::new(Action::Fail, Action::Fail);
        }

        if worker_failures == job_failures {
            if !retry_allowed || worker_failures >= self.thresholds.job_reset {
                Verdict::new(Action::None, Action::Reset)
            } else {
                Verdict::new(Action::None, Action::None)
            }
        } else if worker_failures > job_failures {
            if worker_failures < self.thresholds.worker_failure {
                Verdict::new(Action::Reset, Action::Reset)
            } else {
                Verdict::new(Action::Fail, Action::Reset)
            }
        } else {
            Verdict::new(Action::None, Action::Fail)
        }
    }
}
