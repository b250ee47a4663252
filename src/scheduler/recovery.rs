use chrono::{DateTime, Utc};

use crate::error::ScanError;
use crate::registry::{ChangeSet, CleanStatus, JobOutcome, JobSnapshot, JobStatus, WorkerVitals};
use crate::scheduler::judge::{Action, Verdict};

/// What happened to the job once a verdict was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// No job, or the verdict left it alone.
    Untouched,
    Reset,
    Failed,
    /// Already succeeded; only dropped from the queue.
    Evicted,
    Cancelled,
}

/// The verdict as actually applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedVerdict {
    pub verdict: Verdict,
    pub worker: Action,
    pub job: JobDisposition,
}

/// Record the changes a verdict implies.
///
/// A job already in CANCELLING is always cancelled, whatever the verdict says
/// about it.
pub fn apply_verdict(
    changes: &mut ChangeSet,
    worker: &WorkerVitals,
    job: Option<&JobSnapshot>,
    verdict: Verdict,
    error: &ScanError,
    now: DateTime<Utc>,
) -> AppliedVerdict {
    let note = error.to_string();

    let disposition = match job {
        None => JobDisposition::Untouched,
        Some(job) if job.status == JobStatus::Cancelling => {
            tracing::info!(
                worker = %worker.name,
                job_id = %job.id,
                verdict = %verdict.job,
                "Job was being cancelled; marking cancelled"
            );
            changes.mark_cancelled(job.id, now);
            JobDisposition::Cancelled
        }
        Some(job) => match verdict.job {
            Action::None => JobDisposition::Untouched,
            Action::Reset => {
                tracing::info!(worker = %worker.name, job_id = %job.id, "Resetting job");
                changes.reset_job(job.id);
                JobDisposition::Reset
            }
            Action::Fail => {
                // The job, not the worker, was blamed.
                changes.reset_worker_failure(&worker.name);
                if job.status == JobStatus::Succeeded {
                    tracing::error!(
                        worker = %worker.name,
                        job_id = %job.id,
                        error = %note,
                        "Failure attributed to an already successful job; dropping it from the queue"
                    );
                    changes.evict(job.id);
                    JobDisposition::Evicted
                } else {
                    tracing::warn!(worker = %worker.name, job_id = %job.id, error = %note, "Failing job");
                    changes.mark_terminal(job.id, JobOutcome::Failed { note: note.clone() }, now);
                    JobDisposition::Failed
                }
            }
        },
    };

    match verdict.worker {
        Action::None => {}
        Action::Reset => {
            tracing::info!(worker = %worker.name, "Marking worker dirty for recovery");
            changes.set_clean_status(&worker.name, CleanStatus::Dirty);
        }
        Action::Fail => {
            tracing::warn!(worker = %worker.name, error = %note, "Failing worker");
            changes.set_healthy(&worker.name, false, Some(note));
        }
    }

    AppliedVerdict {
        verdict,
        worker: verdict.worker,
        job: disposition,
    }
}
