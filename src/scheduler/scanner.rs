use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{elapsed_since, start_jitter, Clock};
use crate::config::ManagerConfig;
use crate::error::{RegistryError, ScanError};
use crate::registry::{
    ChangeSet, CleanStatus, JobOutcome, JobSnapshot, JobStatus, Registry, WorkerVitals,
};
use crate::scheduler::judge::{FailureJudge, Verdict};
use crate::scheduler::recovery::{apply_verdict, AppliedVerdict, JobDisposition};
use crate::worker::{
    BuildOutcome, BuildRequest, WorkerClient, WorkerState, WorkerStatusReport, BUILD_LOG,
};

/// Bytes of the build log kept as the job's log tail after collection.
const LOG_TAIL_BYTES: usize = 2048;

/// Where a worker stood at the end of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    IdleClean,
    IdleCleaning,
    BusyDispatching,
    BusyBuilding,
    BusyCancelling,
    Lost,
    Failed,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScannerState::IdleClean => write!(f, "idle-clean"),
            ScannerState::IdleCleaning => write!(f, "idle-cleaning"),
            ScannerState::BusyDispatching => write!(f, "busy-dispatching"),
            ScannerState::BusyBuilding => write!(f, "busy-building"),
            ScannerState::BusyCancelling => write!(f, "busy-cancelling"),
            ScannerState::Lost => write!(f, "lost"),
            ScannerState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub state: ScannerState,
    /// An error surfaced by the scan, whether or not it was judged.
    pub error: Option<String>,
    /// Set when the scan went through the failure judge.
    pub applied: Option<AppliedVerdict>,
    pub commit_failed: bool,
}

impl ScanReport {
    fn ok(state: ScannerState) -> Self {
        Self {
            state,
            error: None,
            applied: None,
            commit_failed: false,
        }
    }

    fn surfaced(state: ScannerState, error: &ScanError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::ok(state)
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.applied.map(|a| a.verdict)
    }
}

/// Totals reported when a scanner loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannerSummary {
    pub worker: String,
    pub scans: u64,
    pub failures: u64,
    /// Whether the most recent scan ended with a rejected registry commit.
    pub last_commit_failed: bool,
}

/// A scan error plus whether the judge may retry in place.
#[derive(Debug)]
struct Failure {
    error: ScanError,
    retry_allowed: bool,
}

impl From<ScanError> for Failure {
    fn from(error: ScanError) -> Self {
        Self {
            error,
            retry_allowed: true,
        }
    }
}

impl From<RegistryError> for Failure {
    fn from(error: RegistryError) -> Self {
        ScanError::Registry(error).into()
    }
}

/// Drives one worker through its poll / dispatch / collect cycle.
///
/// Per-worker memory (the pending abort deadline, the last completed scan)
/// lives here rather than in any shared cache.
pub struct WorkerScanner {
    name: String,
    registry: Arc<dyn Registry>,
    client: Arc<dyn WorkerClient>,
    clock: Arc<dyn Clock>,
    judge: FailureJudge,
    poll_interval: Duration,
    cancel_deadline: Duration,
    jitter_first_scan: bool,
    /// Job we sent an abort for, and when.
    abort_sent: Option<(Uuid, DateTime<Utc>)>,
    /// Job involved in the scan in progress.
    involved_job: Option<Uuid>,
    state: ScannerState,
    completed_tx: watch::Sender<Option<DateTime<Utc>>>,
}

impl WorkerScanner {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<dyn Registry>,
        client: Arc<dyn WorkerClient>,
        clock: Arc<dyn Clock>,
        config: &ManagerConfig,
    ) -> Self {
        let (completed_tx, _) = watch::channel(None);
        Self {
            name: name.into(),
            registry,
            client,
            clock,
            judge: FailureJudge::new(config.thresholds),
            poll_interval: config.poll_interval,
            cancel_deadline: config.cancel_deadline,
            jitter_first_scan: config.jitter_first_scan,
            abort_sent: None,
            involved_job: None,
            state: ScannerState::IdleClean,
            completed_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Completion time of the most recent scan, updated after every scan.
    pub fn subscribe_completions(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.completed_tx.subscribe()
    }

    /// Scan on the poll interval until `token` is cancelled.
    ///
    /// Cancellation is only observed between scans, so a scan in progress
    /// always finishes. Ticks missed while a scan runs are skipped.
    pub async fn run(mut self, token: CancellationToken) -> ScannerSummary {
        let mut summary = ScannerSummary {
            worker: self.name.clone(),
            ..ScannerSummary::default()
        };

        if self.jitter_first_scan {
            let delay = start_jitter(self.poll_interval);
            tokio::select! {
                _ = token.cancelled() => return summary,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(worker = %self.name, interval_ms = self.poll_interval.as_millis() as u64, "Scanner started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.scan().await;
                    summary.scans += 1;
                    if report.applied.is_some() {
                        summary.failures += 1;
                    }
                    summary.last_commit_failed = report.commit_failed;
                }
            }
        }

        tracing::info!(worker = %self.name, scans = summary.scans, "Scanner stopped");
        summary
    }

    /// Run one scan. Never fails: errors go through the failure judge.
    pub async fn scan(&mut self) -> ScanReport {
        self.involved_job = None;
        let report = match self.try_scan().await {
            Ok(report) => report,
            Err(failure) => self.handle_failure(failure),
        };
        self.state = report.state;
        self.completed_tx.send_replace(Some(self.clock.now()));
        tracing::debug!(worker = %self.name, state = %report.state, "Scan complete");
        report
    }

    async fn try_scan(&mut self) -> Result<ScanReport, Failure> {
        let vitals = self.registry.get_vitals(&self.name)?;
        let job = match vitals.current_job {
            Some(id) => Some(self.registry.get_job(id)?),
            None => None,
        };
        self.involved_job = job.as_ref().map(|j| j.id);

        match job {
            Some(job) => {
                if vitals.clean_status != CleanStatus::Dirty {
                    return Err(ScanError::WorkerIsolationViolation {
                        worker: self.name.clone(),
                        detail: format!(
                            "job {} assigned while worker is {}",
                            job.id, vitals.clean_status
                        ),
                    }
                    .into());
                }
                self.scan_busy(&vitals, job).await
            }
            None => {
                self.abort_sent = None;
                self.scan_idle(&vitals).await
            }
        }
    }

    async fn scan_busy(
        &mut self,
        vitals: &WorkerVitals,
        job: JobSnapshot,
    ) -> Result<ScanReport, Failure> {
        if !vitals.healthy {
            return self.handle_lost(&job, "worker is disabled");
        }

        let status = self.client.status().await?;
        if status.cookie.as_deref() != Some(job.cookie.as_str()) {
            let reason = format!(
                "worker reports {} with cookie {:?}",
                status.state, status.cookie
            );
            return self.handle_lost(&job, &reason);
        }

        let mut changes = ChangeSet::new();
        self.note_contact(vitals, Some(&job), &status, &mut changes);

        let state = match status.state {
            WorkerState::Waiting | WorkerState::Aborted => {
                self.collect(vitals, &job, &status, &mut changes).await?
            }
            WorkerState::Building | WorkerState::Aborting | WorkerState::Idle => {
                if let Some(tail) = &status.log_tail {
                    changes.record_progress(job.id, tail.clone());
                }
                if job.status == JobStatus::Cancelling {
                    self.check_cancellation(&job).await?
                } else {
                    tracing::debug!(worker = %self.name, job_id = %job.id, state = %status.state, "Build in progress");
                    ScannerState::BusyBuilding
                }
            }
        };

        self.commit(changes)?;
        Ok(ScanReport::ok(state))
    }

    async fn check_cancellation(&mut self, job: &JobSnapshot) -> Result<ScannerState, Failure> {
        let now = self.clock.now();
        match self.abort_sent {
            Some((id, sent_at)) if id == job.id => {
                if elapsed_since(sent_at, now) >= self.cancel_deadline {
                    return Err(ScanError::CancellationTimeout {
                        worker: self.name.clone(),
                        job_id: job.id,
                        deadline: self.cancel_deadline,
                    }
                    .into());
                }
                tracing::debug!(worker = %self.name, job_id = %job.id, "Waiting for worker to abort");
            }
            _ => {
                self.client.abort().await?;
                self.abort_sent = Some((job.id, now));
                tracing::info!(worker = %self.name, job_id = %job.id, "Abort requested");
            }
        }
        Ok(ScannerState::BusyCancelling)
    }

    /// Gather a finished build and release the worker.
    async fn collect(
        &mut self,
        vitals: &WorkerVitals,
        job: &JobSnapshot,
        status: &WorkerStatusReport,
        changes: &mut ChangeSet,
    ) -> Result<ScannerState, Failure> {
        let outcome = match (status.outcome, status.state) {
            (Some(outcome), _) => outcome,
            (None, WorkerState::Aborted) => BuildOutcome::Aborted,
            (None, _) => {
                return Err(ScanError::WorkerProtocol {
                    worker: self.name.clone(),
                    reason: "waiting without a build outcome".into(),
                }
                .into())
            }
        };
        let now = self.clock.now();

        match outcome {
            BuildOutcome::Ok => {
                let mut artifacts = Vec::with_capacity(status.files.len());
                for (name, identity) in &status.files {
                    let bytes = self.client.fetch_file(identity).await?;
                    tracing::debug!(worker = %self.name, job_id = %job.id, file = %name, size = bytes.len(), "Fetched artifact");
                    artifacts.push(name.clone());
                }
                self.fetch_log(job, changes).await?;
                changes
                    .record_artifacts(job.id, artifacts)
                    .mark_terminal(job.id, JobOutcome::Succeeded, now);
            }
            BuildOutcome::PackageFail => {
                self.fetch_log(job, changes).await?;
                changes.mark_terminal(
                    job.id,
                    JobOutcome::Failed {
                        note: "package build failed".into(),
                    },
                    now,
                );
            }
            BuildOutcome::ChrootFail => {
                self.fetch_log(job, changes).await?;
                changes.mark_terminal(
                    job.id,
                    JobOutcome::Failed {
                        note: "chroot problem".into(),
                    },
                    now,
                );
            }
            BuildOutcome::DepFail => {
                self.fetch_log(job, changes).await?;
                changes.mark_terminal(
                    job.id,
                    JobOutcome::DependencyWait {
                        dependencies: status.dependencies.clone().unwrap_or_default(),
                    },
                    now,
                );
            }
            BuildOutcome::GivenBack => {
                tracing::info!(worker = %self.name, job_id = %job.id, "Build given back; requeueing");
                changes.reset_job(job.id);
            }
            BuildOutcome::Aborted if job.status == JobStatus::Cancelling => {
                changes.mark_cancelled(job.id, now);
            }
            BuildOutcome::Aborted => {
                return Err(ScanError::UnexpectedAbort {
                    worker: self.name.clone(),
                    job_id: job.id,
                }
                .into());
            }
            BuildOutcome::BuilderFail => {
                return Err(ScanError::BuilderFailure {
                    worker: self.name.clone(),
                    job_id: job.id,
                }
                .into());
            }
        }

        // Released workers are cleaned before their next dispatch.
        changes.set_clean_status(&vitals.name, CleanStatus::Dirty);
        self.abort_sent = None;
        tracing::info!(worker = %self.name, job_id = %job.id, outcome = ?outcome, "Collected build");
        Ok(ScannerState::IdleCleaning)
    }

    async fn fetch_log(&self, job: &JobSnapshot, changes: &mut ChangeSet) -> Result<(), Failure> {
        let log = self.client.fetch_file(BUILD_LOG).await?;
        changes.record_progress(job.id, log_tail(&log));
        Ok(())
    }

    async fn scan_idle(&mut self, vitals: &WorkerVitals) -> Result<ScanReport, Failure> {
        if !vitals.healthy {
            tracing::debug!(worker = %self.name, "Worker disabled; skipping");
            return Ok(ScanReport::ok(ScannerState::Failed));
        }

        match vitals.clean_status {
            CleanStatus::Clean => {
                let status = self.client.status().await?;
                if !status.is_idle() {
                    // Blame the job whose build the worker reports, when we know it.
                    if let Some(cookie) = status.cookie.as_deref() {
                        self.involved_job = self
                            .registry
                            .job_by_cookie(cookie)
                            .ok()
                            .flatten()
                            .map(|j| j.id);
                    }
                    return Err(ScanError::WorkerIsolationViolation {
                        worker: self.name.clone(),
                        detail: format!(
                            "clean idle worker reports {} with cookie {:?}",
                            status.state, status.cookie
                        ),
                    }
                    .into());
                }

                let mut changes = ChangeSet::new();
                self.note_contact(vitals, None, &status, &mut changes);
                if vitals.manual {
                    self.commit(changes)?;
                    return Ok(ScanReport::ok(ScannerState::IdleClean));
                }

                let candidates = self.registry.pending_jobs_for(&vitals.capabilities())?;
                self.dispatch(vitals, changes, candidates).await
            }
            CleanStatus::Dirty | CleanStatus::Cleaning => {
                let done = self.client.clean().await?;
                let mut changes = ChangeSet::new();
                if vitals.failure_count > 0 {
                    changes.reset_worker_failure(&vitals.name);
                }
                let state = if done {
                    tracing::info!(worker = %self.name, "Worker clean");
                    changes.set_clean_status(&vitals.name, CleanStatus::Clean);
                    ScannerState::IdleClean
                } else {
                    if vitals.clean_status == CleanStatus::Dirty {
                        changes.set_clean_status(&vitals.name, CleanStatus::Cleaning);
                    }
                    ScannerState::IdleCleaning
                };
                self.commit(changes)?;
                Ok(ScanReport::ok(state))
            }
        }
    }

    /// Bind the best candidate to this worker, then ask the worker to build it.
    ///
    /// The assignment goes into the same batch as the contact changes and is
    /// committed before the RPC, so a crash in between leaves a job the next
    /// scan reports lost rather than a build nobody tracks. Candidates another
    /// writer took first are skipped.
    async fn dispatch(
        &mut self,
        vitals: &WorkerVitals,
        contact: ChangeSet,
        candidates: Vec<JobSnapshot>,
    ) -> Result<ScanReport, Failure> {
        for job in candidates {
            let mut changes = contact.clone();
            changes
                .mark_building(job.id, &vitals.name)
                .set_clean_status(&vitals.name, CleanStatus::Dirty)
                .mark_started(job.id, self.clock.now());
            match self.registry.commit(changes) {
                Ok(()) => return self.send_build(job).await,
                Err(RegistryError::Conflict(reason)) => {
                    tracing::debug!(worker = %self.name, job_id = %job.id, reason = %reason, "Candidate taken; trying next");
                }
                Err(e) => return Err(ScanError::RegistryCommitFailure(e).into()),
            }
        }

        self.commit(contact)?;
        Ok(ScanReport::ok(ScannerState::IdleClean))
    }

    async fn send_build(&mut self, job: JobSnapshot) -> Result<ScanReport, Failure> {
        self.state = ScannerState::BusyDispatching;
        self.involved_job = Some(job.id);

        tracing::info!(worker = %self.name, job_id = %job.id, cookie = %job.cookie, "Dispatching job");
        match self.client.start_build(&BuildRequest::from(&job)).await {
            Ok(()) => Ok(ScanReport::ok(ScannerState::BusyBuilding)),
            Err(e @ ScanError::CannotBuild { .. }) => {
                tracing::warn!(worker = %self.name, job_id = %job.id, error = %e, "Dispatch rejected; requeueing job");
                let mut changes = ChangeSet::new();
                changes.reset_job(job.id);
                self.commit(changes)?;
                Ok(ScanReport::surfaced(ScannerState::IdleCleaning, &e))
            }
            Err(e) => Err(Failure {
                error: e,
                retry_allowed: false,
            }),
        }
    }

    /// Registry and worker disagree about the job: requeue it without blame.
    fn handle_lost(&mut self, job: &JobSnapshot, reason: &str) -> Result<ScanReport, Failure> {
        tracing::warn!(
            worker = %self.name,
            job_id = %job.id,
            cookie = %job.cookie,
            reason,
            "Job lost"
        );
        let mut changes = ChangeSet::new();
        if job.status == JobStatus::Cancelling {
            changes.mark_cancelled(job.id, self.clock.now());
        } else {
            changes.reset_job(job.id);
        }
        self.commit(changes)?;
        self.abort_sent = None;
        Ok(ScanReport::ok(ScannerState::Lost))
    }

    /// Record what a successful status call tells us.
    fn note_contact(
        &self,
        vitals: &WorkerVitals,
        job: Option<&JobSnapshot>,
        status: &WorkerStatusReport,
        changes: &mut ChangeSet,
    ) {
        if vitals.failure_count > 0 {
            changes.reset_worker_failure(&vitals.name);
        }
        if let Some(job) = job.filter(|j| j.failure_count > 0) {
            changes.reset_job_failure(job.id);
        }
        if let Some(version) = &status.version {
            if vitals.version.as_ref() != Some(version) {
                changes.set_version(&vitals.name, version.clone());
            }
        }
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), Failure> {
        self.registry
            .commit(changes)
            .map_err(|e| ScanError::RegistryCommitFailure(e).into())
    }

    fn handle_failure(&mut self, failure: Failure) -> ScanReport {
        let Failure {
            error,
            retry_allowed,
        } = failure;

        if error.is_commit_failure() {
            tracing::error!(worker = %self.name, error = %error, "Registry commit failed; scan changes discarded");
            return ScanReport {
                commit_failed: true,
                ..ScanReport::surfaced(ScannerState::Failed, &error)
            };
        }
        if error.is_isolation_violation() {
            tracing::error!(worker = %self.name, error = %error, "Worker isolation violation");
        } else {
            tracing::warn!(worker = %self.name, error = %error, "Scan failed");
        }

        let vitals = match self.registry.get_vitals(&self.name) {
            Ok(vitals) => vitals,
            Err(e) => {
                tracing::error!(worker = %self.name, error = %e, "Cannot load worker to judge failure");
                return ScanReport::surfaced(ScannerState::Failed, &error);
            }
        };
        let job = self
            .involved_job
            .or(vitals.current_job)
            .and_then(|id| self.registry.get_job(id).ok())
            .filter(|j| !j.status.is_terminal() || j.status == JobStatus::Succeeded);

        let worker_failures = vitals.failure_count + 1;
        let job_failures = job.as_ref().map_or(0, |j| j.failure_count + 1);
        let verdict = self
            .judge
            .judge(worker_failures, job_failures, &error, retry_allowed);

        let mut changes = ChangeSet::new();
        changes.increment_worker_failure(&vitals.name);
        if let Some(job) = &job {
            changes.increment_job_failure(job.id);
        }
        let applied = apply_verdict(
            &mut changes,
            &vitals,
            job.as_ref(),
            verdict,
            &error,
            self.clock.now(),
        );
        tracing::info!(
            worker = %self.name,
            worker_failures,
            job_failures,
            worker_action = %verdict.worker,
            job_action = %verdict.job,
            "Failure judged"
        );

        let commit_failed = match self.registry.commit(changes) {
            Ok(()) => false,
            Err(e) => {
                tracing::error!(worker = %self.name, error = %e, "Registry commit failed while applying verdict");
                true
            }
        };
        if !commit_failed && applied.job != JobDisposition::Untouched {
            self.abort_sent = None;
        }

        ScanReport {
            state: ScannerState::Failed,
            error: Some(error.to_string()),
            applied: Some(applied),
            commit_failed,
        }
    }
}

/// Last `LOG_TAIL_BYTES` of a log, decoded lossily on a char boundary.
fn log_tail(log: &[u8]) -> String {
    let text = String::from_utf8_lossy(log);
    if text.len() <= LOG_TAIL_BYTES {
        return text.into_owned();
    }
    let mut start = text.len() - LOG_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
