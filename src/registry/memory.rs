use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::registry::{
    ChangeSet, CleanStatus, JobOutcome, JobRegistry, JobSnapshot, JobStatus, Mutation, Registry,
    WorkerCapabilities, WorkerRegistry, WorkerVitals,
};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// On-disk layout of a fleet file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub workers: Vec<WorkerVitals>,
    #[serde(default)]
    pub jobs: Vec<JobSnapshot>,
}

#[derive(Debug, Clone, Default)]
struct RegistryState {
    workers: BTreeMap<String, WorkerVitals>,
    jobs: HashMap<Uuid, JobSnapshot>,
}

impl RegistryState {
    fn active_job_for(&self, worker: &str) -> Option<&JobSnapshot> {
        self.jobs
            .values()
            .find(|j| j.status.is_active() && j.assigned_worker.as_deref() == Some(worker))
    }

    fn vitals(&self, name: &str) -> Option<WorkerVitals> {
        let mut vitals = self.workers.get(name)?.clone();
        vitals.current_job = self.active_job_for(name).map(|j| j.id);
        Some(vitals)
    }

    fn worker_mut(&mut self, name: &str) -> Result<&mut WorkerVitals, RegistryError> {
        self.workers
            .get_mut(name)
            .ok_or_else(|| RegistryError::WorkerNotFound(name.to_string()))
    }

    fn job_mut(&mut self, id: Uuid) -> Result<&mut JobSnapshot, RegistryError> {
        self.jobs.get_mut(&id).ok_or(RegistryError::JobNotFound(id))
    }

    fn apply(&mut self, mutation: Mutation) -> Result<(), RegistryError> {
        match mutation {
            Mutation::SetHealthy {
                worker,
                healthy,
                note,
            } => {
                let w = self.worker_mut(&worker)?;
                w.healthy = healthy;
                w.failure_note = note;
            }
            Mutation::SetCleanStatus { worker, status } => {
                self.worker_mut(&worker)?.clean_status = status;
            }
            Mutation::IncrementWorkerFailure { worker } => {
                self.worker_mut(&worker)?.failure_count += 1;
            }
            Mutation::ResetWorkerFailure { worker } => {
                self.worker_mut(&worker)?.failure_count = 0;
            }
            Mutation::SetVersion { worker, version } => {
                self.worker_mut(&worker)?.version = Some(version);
            }
            Mutation::MarkBuilding { job, worker } => {
                if !self.workers.contains_key(&worker) {
                    return Err(RegistryError::WorkerNotFound(worker));
                }
                if let Some(other) = self.active_job_for(&worker) {
                    return Err(RegistryError::Conflict(format!(
                        "worker {} already runs job {}",
                        worker, other.id
                    )));
                }
                let j = self.job_mut(job)?;
                if !j.is_dispatchable() {
                    return Err(RegistryError::Conflict(format!(
                        "job {} is {} and cannot be dispatched",
                        job, j.status
                    )));
                }
                j.status = JobStatus::Building;
                j.assigned_worker = Some(worker);
            }
            Mutation::MarkStarted { job, at } => {
                self.job_mut(job)?.started_at = Some(at);
            }
            Mutation::RecordProgress { job, log_tail } => {
                self.job_mut(job)?.log_tail = Some(log_tail);
            }
            Mutation::RecordArtifacts { job, artifacts } => {
                self.job_mut(job)?.artifacts = artifacts;
            }
            Mutation::MarkTerminal { job, outcome, at } => {
                let j = self.job_mut(job)?;
                j.status = outcome.status();
                match outcome {
                    JobOutcome::Failed { note } => j.failure_note = Some(note),
                    JobOutcome::DependencyWait { dependencies } => {
                        j.dependencies = Some(dependencies)
                    }
                    JobOutcome::Succeeded => {}
                }
                j.assigned_worker = None;
                j.in_queue = false;
                j.finished_at = Some(at);
            }
            Mutation::ResetJob { job } => {
                let j = self.job_mut(job)?;
                if j.status.is_terminal() {
                    return Err(RegistryError::CommitRejected(format!(
                        "job {} is {} and cannot be reset",
                        job, j.status
                    )));
                }
                j.status = JobStatus::Pending;
                j.assigned_worker = None;
                j.log_tail = None;
                j.started_at = None;
                j.in_queue = true;
            }
            Mutation::MarkCancelled { job, at } => {
                let j = self.job_mut(job)?;
                j.status = JobStatus::Cancelled;
                j.assigned_worker = None;
                j.in_queue = false;
                j.finished_at = Some(at);
            }
            Mutation::Evict { job } => {
                let j = self.job_mut(job)?;
                j.in_queue = false;
                j.assigned_worker = None;
            }
            Mutation::IncrementJobFailure { job } => {
                self.job_mut(job)?.failure_count += 1;
            }
            Mutation::ResetJobFailure { job } => {
                self.job_mut(job)?.failure_count = 0;
            }
        }
        Ok(())
    }

    /// Check the isolation invariant for the given workers.
    fn check_isolation(&self, workers: &BTreeSet<String>) -> Result<(), RegistryError> {
        for name in workers {
            let Some(worker) = self.workers.get(name) else {
                continue;
            };
            let active: Vec<Uuid> = self
                .jobs
                .values()
                .filter(|j| j.status.is_active() && j.assigned_worker.as_deref() == Some(name))
                .map(|j| j.id)
                .collect();
            if active.len() > 1 {
                return Err(RegistryError::InvariantViolation(format!(
                    "worker {} would hold {} jobs",
                    name,
                    active.len()
                )));
            }
            if !active.is_empty() && worker.clean_status != CleanStatus::Dirty {
                return Err(RegistryError::InvariantViolation(format!(
                    "worker {} would hold job {} while {}",
                    name, active[0], worker.clean_status
                )));
            }
        }
        Ok(())
    }
}

fn touched_workers(state: &RegistryState, changes: &ChangeSet) -> BTreeSet<String> {
    let mut touched = BTreeSet::new();
    for mutation in changes.mutations() {
        match mutation {
            Mutation::SetHealthy { worker, .. }
            | Mutation::SetCleanStatus { worker, .. }
            | Mutation::IncrementWorkerFailure { worker }
            | Mutation::ResetWorkerFailure { worker }
            | Mutation::SetVersion { worker, .. }
            | Mutation::MarkBuilding { worker, .. } => {
                touched.insert(worker.clone());
            }
            Mutation::MarkStarted { job, .. }
            | Mutation::RecordProgress { job, .. }
            | Mutation::RecordArtifacts { job, .. }
            | Mutation::MarkTerminal { job, .. }
            | Mutation::ResetJob { job }
            | Mutation::MarkCancelled { job, .. }
            | Mutation::Evict { job }
            | Mutation::IncrementJobFailure { job }
            | Mutation::ResetJobFailure { job } => {
                if let Some(worker) = state.jobs.get(job).and_then(|j| j.assigned_worker.clone()) {
                    touched.insert(worker);
                }
            }
        }
    }
    touched
}

/// In-process registry with all-or-nothing batch commits.
///
/// Commits are applied to a copy of the state and swapped in only when every
/// mutation succeeds and the isolation invariant holds for every worker the
/// batch touched.
#[derive(Debug)]
pub struct MemoryRegistry {
    state: RwLock<RegistryState>,
    max_jobs: usize,
    failing_commits: AtomicUsize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_jobs,
            failing_commits: AtomicUsize::new(0),
        }
    }

    /// Register a worker administratively. Replaces any worker of the same name.
    pub fn insert_worker(&self, worker: WorkerVitals) -> Result<(), RegistryError> {
        let mut state = self.state.write().map_err(|_| RegistryError::Poisoned)?;
        tracing::info!(worker = %worker.name, url = %worker.url, "Worker registered");
        state.workers.insert(worker.name.clone(), worker);
        Ok(())
    }

    /// Submit a job. Fails when the queue is at capacity.
    pub fn insert_job(&self, job: JobSnapshot) -> Result<(), RegistryError> {
        let mut state = self.state.write().map_err(|_| RegistryError::Poisoned)?;
        if state.jobs.len() >= self.max_jobs && !state.jobs.contains_key(&job.id) {
            return Err(RegistryError::CommitRejected(format!(
                "job queue at capacity ({})",
                self.max_jobs
            )));
        }
        tracing::debug!(job_id = %job.id, status = %job.status, "Job submitted");
        state.jobs.insert(job.id, job);
        Ok(())
    }

    /// External cancellation request: an active job moves to CANCELLING, a
    /// pending one is cancelled outright.
    pub fn request_cancel(&self, id: Uuid) -> Result<JobStatus, RegistryError> {
        let mut state = self.state.write().map_err(|_| RegistryError::Poisoned)?;
        let job = state.job_mut(id)?;
        match job.status {
            JobStatus::Building => job.status = JobStatus::Cancelling,
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.in_queue = false;
            }
            _ => {}
        }
        Ok(job.status)
    }

    /// Administratively re-enable a failed worker.
    pub fn reenable_worker(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().map_err(|_| RegistryError::Poisoned)?;
        let worker = state.worker_mut(name)?;
        worker.healthy = true;
        worker.failure_note = None;
        worker.failure_count = 0;
        Ok(())
    }

    /// Make the next `n` commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn all_jobs(&self) -> Result<Vec<JobSnapshot>, RegistryError> {
        let state = self.state.read().map_err(|_| RegistryError::Poisoned)?;
        let mut jobs: Vec<JobSnapshot> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        Ok(jobs)
    }

    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read(path)?;
        let fleet: FleetFile = serde_json::from_slice(&raw)?;
        let registry = Self::new();
        {
            let mut state = registry.state.write().map_err(|_| RegistryError::Poisoned)?;
            for worker in fleet.workers {
                state.workers.insert(worker.name.clone(), worker);
            }
            for job in fleet.jobs {
                state.jobs.insert(job.id, job);
            }
        }
        Ok(registry)
    }

    /// Write the registry to `path`, replacing it atomically.
    pub fn persist(&self, path: &Path) -> Result<(), RegistryError> {
        let fleet = {
            let state = self.state.read().map_err(|_| RegistryError::Poisoned)?;
            let mut jobs: Vec<JobSnapshot> = state.jobs.values().cloned().collect();
            jobs.sort_by_key(|j| j.submitted_at);
            FleetFile {
                workers: state.workers.values().cloned().collect(),
                jobs,
            }
        };
        let encoded = serde_json::to_vec_pretty(&fleet)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl WorkerRegistry for MemoryRegistry {
    fn list_all(&self) -> Result<Vec<WorkerVitals>, RegistryError> {
        let state = self.state.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(state
            .workers
            .keys()
            .filter_map(|name| state.vitals(name))
            .collect())
    }

    fn get_vitals(&self, name: &str) -> Result<WorkerVitals, RegistryError> {
        let state = self.state.read().map_err(|_| RegistryError::Poisoned)?;
        state
            .vitals(name)
            .ok_or_else(|| RegistryError::WorkerNotFound(name.to_string()))
    }
}

impl JobRegistry for MemoryRegistry {
    fn get_job(&self, id: Uuid) -> Result<JobSnapshot, RegistryError> {
        let state = self.state.read().map_err(|_| RegistryError::Poisoned)?;
        state.jobs.get(&id).cloned().ok_or(RegistryError::JobNotFound(id))
    }

    fn job_by_cookie(&self, cookie: &str) -> Result<Option<JobSnapshot>, RegistryError> {
        let state = self.state.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(state.jobs.values().find(|j| j.cookie == cookie).cloned())
    }

    fn pending_jobs_for(
        &self,
        capabilities: &WorkerCapabilities,
    ) -> Result<Vec<JobSnapshot>, RegistryError> {
        let state = self.state.read().map_err(|_| RegistryError::Poisoned)?;
        let mut jobs: Vec<JobSnapshot> = state
            .jobs
            .values()
            .filter(|j| j.is_dispatchable() && capabilities.satisfies(&j.requirements))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.submitted_at.cmp(&b.submitted_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }
}

impl Registry for MemoryRegistry {
    fn commit(&self, changes: ChangeSet) -> Result<(), RegistryError> {
        if changes.is_empty() {
            return Ok(());
        }
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RegistryError::CommitRejected("injected commit failure".into()));
        }

        let mut state = self.state.write().map_err(|_| RegistryError::Poisoned)?;
        let touched = touched_workers(&state, &changes);
        let mut next = state.clone();
        for mutation in changes.into_mutations() {
            next.apply(mutation)?;
        }
        next.check_isolation(&touched)?;
        *state = next;
        Ok(())
    }
}
