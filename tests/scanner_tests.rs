//! Worker scanner behaviour driven one scan at a time against an in-memory
//! registry, a scripted worker and a manual clock.


use std::sync::Arc;
use std::time::Duration;

use buildfarm::registry::{
    ChangeSet, CleanStatus, JobRegistry, JobRequirements, JobSnapshot, JobStatus, MemoryRegistry,
    Registry, WorkerRegistry,
};
use buildfarm::scheduler::{Action, JobDisposition, ScannerState};
use buildfarm::worker::{BuildOutcome, WorkerState, WorkerStatusReport, BUILD_LOG};
use test_harness::{busy_fixture, job, scan_fixture, scripted_scanner, worker, ScriptedRegistry};

fn idle_fixture(name: &str) -> Arc<MemoryRegistry> {
    let registry = Arc::new(MemoryRegistry::new());
    registry.insert_worker(worker(name)).unwrap();
    registry
}

#[tokio::test]
async fn test_dispatches_pending_job_to_clean_worker() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::BusyBuilding);
    assert!(report.error.is_none());

    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Building);
    assert_eq!(stored.assigned_worker.as_deref(), Some("bob"));
    assert!(stored.started_at.is_some());

    let vitals = f.registry.get_vitals("bob").unwrap();
    assert_eq!(vitals.clean_status, CleanStatus::Dirty);
    assert_eq!(vitals.current_job, Some(job.id));
    assert_eq!(vitals.version.as_deref(), Some("1.0"));

    let builds = f.worker.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].cookie, job.cookie);
    assert_eq!(builds[0].files.get("foo.dsc").map(String::as_str), Some("sha1:abc"));
}

#[tokio::test]
async fn test_dispatch_picks_highest_score_first() {
    let registry = idle_fixture("bob");
    let low = job().with_score(10);
    let high = job().with_score(500);
    registry.insert_job(low.clone()).unwrap();
    registry.insert_job(high.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    f.scanner.scan().await;

    assert_eq!(f.registry.get_job(high.id).unwrap().status, JobStatus::Building);
    assert_eq!(f.registry.get_job(low.id).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_scan_while_building_records_progress() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    f.scanner.scan().await;
    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::BusyBuilding);
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Building);
    assert_eq!(stored.log_tail.as_deref(), Some("compiling"));
    // Still exactly one build request
    assert_eq!(f.worker.builds().len(), 1);
}

#[tokio::test]
async fn test_collects_successful_build_and_cleans_worker() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    f.scanner.scan().await;
    f.worker.set_report(
        WorkerStatusReport::waiting(job.cookie.clone(), BuildOutcome::Ok)
            .with_file("foo_1.0_amd64.deb", "sha1:deb"),
    );
    f.worker.add_file("sha1:deb", b"!<arch>");

    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::IdleCleaning);

    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert!(stored.assigned_worker.is_none());
    assert!(!stored.in_queue);
    assert!(stored.finished_at.is_some());
    assert_eq!(stored.artifacts, vec!["foo_1.0_amd64.deb".to_string()]);
    assert_eq!(stored.log_tail.as_deref(), Some("build log\nall done\n"));
    assert_eq!(f.worker.fetches(), vec!["sha1:deb".to_string(), BUILD_LOG.to_string()]);

    let vitals = f.registry.get_vitals("bob").unwrap();
    assert!(vitals.current_job.is_none());
    assert_eq!(vitals.clean_status, CleanStatus::Dirty);

    // Next scan cleans the worker
    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::IdleClean);
    assert_eq!(
        f.registry.get_vitals("bob").unwrap().clean_status,
        CleanStatus::Clean
    );
}

#[tokio::test]
async fn test_collects_package_failure() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker
        .set_report(WorkerStatusReport::waiting(job.cookie.clone(), BuildOutcome::PackageFail));

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::IdleCleaning);
    assert!(report.applied.is_none());
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.failure_note.as_deref(), Some("package build failed"));
    assert_eq!(stored.failure_count, 0);
    assert!(stored.log_tail.is_some());
}

#[tokio::test]
async fn test_collects_dependency_wait() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    let mut report = WorkerStatusReport::waiting(job.cookie.clone(), BuildOutcome::DepFail);
    report.dependencies = Some("libfoo-dev (>= 2.0)".into());
    f.worker.set_report(report);

    f.scanner.scan().await;

    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::DependencyWait);
    assert_eq!(stored.dependencies.as_deref(), Some("libfoo-dev (>= 2.0)"));
}

#[tokio::test]
async fn test_given_back_build_is_requeued() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker
        .set_report(WorkerStatusReport::waiting(job.cookie.clone(), BuildOutcome::GivenBack));

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::IdleCleaning);
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.in_queue);
    assert!(stored.assigned_worker.is_none());
    assert_eq!(
        f.registry.get_vitals("bob").unwrap().clean_status,
        CleanStatus::Dirty
    );
}

#[tokio::test]
async fn test_builder_failure_is_judged_and_retried() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker
        .set_report(WorkerStatusReport::waiting(job.cookie.clone(), BuildOutcome::BuilderFail));

    // Equal counts below the reset threshold: retry in place
    for expected in 1..=2 {
        let report = f.scanner.scan().await;
        let applied = report.applied.expect("builder failure should be judged");
        assert_eq!(applied.job, JobDisposition::Untouched);
        let stored = f.registry.get_job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Building);
        assert_eq!(stored.failure_count, expected);
    }

    let report = f.scanner.scan().await;
    assert_eq!(report.applied.unwrap().job, JobDisposition::Reset);
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(f.registry.get_vitals("bob").unwrap().failure_count, 3);
}

#[tokio::test]
async fn test_unexpected_abort_is_judged() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    let mut report = WorkerStatusReport::waiting(job.cookie.clone(), BuildOutcome::Aborted);
    report.state = WorkerState::Aborted;
    f.worker.set_report(report);

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::Failed);
    assert!(report.error.unwrap().contains("not being cancelled"));
    assert!(report.applied.is_some());
}

#[tokio::test]
async fn test_job_lost_on_cookie_mismatch() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker
        .set_report(WorkerStatusReport::building("someone-elses-cookie"));

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::Lost);
    assert!(report.applied.is_none());
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.failure_count, 0);
    assert_eq!(f.registry.get_vitals("bob").unwrap().failure_count, 0);
}

#[tokio::test]
async fn test_job_lost_when_worker_forgot_it() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");

    // Worker restarted and reports idle
    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::Lost);
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.assigned_worker.is_none());
}

#[tokio::test]
async fn test_cancelling_job_lost_is_cancelled() {
    let (registry, job) = busy_fixture("bob");
    registry.request_cancel(job.id).unwrap();
    let mut f = scan_fixture(registry, "bob");

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::Lost);
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_disabled_busy_worker_loses_job() {
    let (registry, job) = busy_fixture("bob");
    let mut disabled = worker("bob").with_clean_status(CleanStatus::Dirty);
    disabled.healthy = false;
    registry.insert_worker(disabled).unwrap();
    let mut f = scan_fixture(registry, "bob");

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::Lost);
    assert_eq!(f.worker.status_calls(), 0);
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_disabled_idle_worker_is_skipped() {
    let registry = Arc::new(MemoryRegistry::new());
    let mut disabled = worker("bob");
    disabled.healthy = false;
    registry.insert_worker(disabled).unwrap();
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::Failed);
    assert!(report.applied.is_none());
    assert_eq!(f.worker.status_calls(), 0);
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_manual_worker_is_not_dispatched() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.insert_worker(worker("bob").with_manual(true)).unwrap();
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::IdleClean);
    assert_eq!(f.worker.status_calls(), 1);
    assert!(f.worker.builds().is_empty());
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_incompatible_job_is_not_dispatched() {
    let registry = idle_fixture("bob");
    let job = job().with_requirements(JobRequirements {
        processor: Some("riscv64".into()),
        ..Default::default()
    });
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::IdleClean);
    assert!(f.worker.builds().is_empty());
}

#[tokio::test]
async fn test_rejected_dispatch_requeues_without_blame() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_reject_builds(true);

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::IdleCleaning);
    assert!(report.error.unwrap().contains("cannot build"));
    assert!(report.applied.is_none());

    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.failure_count, 0);
    assert!(stored.started_at.is_none());

    let vitals = f.registry.get_vitals("bob").unwrap();
    assert_eq!(vitals.failure_count, 0);
    assert_eq!(vitals.clean_status, CleanStatus::Dirty);
    assert!(vitals.current_job.is_none());
}

#[tokio::test]
async fn test_unreachable_during_dispatch_resets_job() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_start_unreachable(true);

    let report = f.scanner.scan().await;

    // Dispatch failures may not be retried in place
    let applied = report.applied.expect("dispatch failure should be judged");
    assert_eq!(applied.verdict.worker, Action::None);
    assert_eq!(applied.job, JobDisposition::Reset);

    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.failure_count, 1);
    let vitals = f.registry.get_vitals("bob").unwrap();
    assert_eq!(vitals.failure_count, 1);
    assert_eq!(vitals.clean_status, CleanStatus::Dirty);
}

#[tokio::test]
async fn test_repeated_unreachable_resets_job_then_fails_worker() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_unreachable(true);

    // Both sides fail together: retry twice, then give the job back
    for _ in 0..2 {
        let report = f.scanner.scan().await;
        let applied = report.applied.unwrap();
        assert_eq!(applied.verdict.worker, Action::None);
        assert_eq!(applied.verdict.job, Action::None);
    }
    let report = f.scanner.scan().await;
    assert_eq!(report.applied.unwrap().job, JobDisposition::Reset);

    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.assigned_worker.is_none());
    assert_eq!(stored.failure_count, 3);

    // Now idle: the worker alone keeps failing
    let report = f.scanner.scan().await;
    assert_eq!(report.applied.unwrap().worker, Action::Reset);
    assert!(f.registry.get_vitals("bob").unwrap().healthy);

    let report = f.scanner.scan().await;
    assert_eq!(report.applied.unwrap().worker, Action::Fail);
    let vitals = f.registry.get_vitals("bob").unwrap();
    assert!(!vitals.healthy);
    assert_eq!(vitals.failure_count, 5);
    assert!(vitals.failure_note.unwrap().contains("unreachable"));

    // The job is available to another worker
    f.registry.insert_worker(worker("alice")).unwrap();
    let candidates = f
        .registry
        .pending_jobs_for(&f.registry.get_vitals("alice").unwrap().capabilities())
        .unwrap();
    assert_eq!(candidates.first().map(|j| j.id), Some(job.id));
}

#[tokio::test]
async fn test_idle_worker_unreachable_is_reset_until_threshold() {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .insert_worker(worker("bob").with_clean_status(CleanStatus::Dirty))
        .unwrap();
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_unreachable(true);

    for _ in 0..4 {
        let report = f.scanner.scan().await;
        assert_eq!(report.applied.unwrap().worker, Action::Reset);
    }
    let report = f.scanner.scan().await;
    assert_eq!(report.applied.unwrap().worker, Action::Fail);
    assert!(!f.registry.get_vitals("bob").unwrap().healthy);

    // Disabled workers are no longer contacted
    let calls = f.worker.clean_calls();
    f.scanner.scan().await;
    assert_eq!(f.worker.clean_calls(), calls);
}

#[tokio::test]
async fn test_successful_contact_resets_failure_counts() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_report(WorkerStatusReport::building(job.cookie.clone()));
    f.worker.set_unreachable(true);

    f.scanner.scan().await;
    assert_eq!(f.registry.get_vitals("bob").unwrap().failure_count, 1);
    assert_eq!(f.registry.get_job(job.id).unwrap().failure_count, 1);

    f.worker.set_unreachable(false);
    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::BusyBuilding);
    assert_eq!(f.registry.get_vitals("bob").unwrap().failure_count, 0);
    assert_eq!(f.registry.get_job(job.id).unwrap().failure_count, 0);
}

#[tokio::test]
async fn test_clean_worker_reporting_unknown_build_is_failed() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_report(WorkerStatusReport::building("stray-cookie"));

    let report = f.scanner.scan().await;

    let applied = report.applied.expect("isolation violation should be judged");
    assert_eq!(applied.verdict.worker, Action::Fail);
    assert_eq!(applied.verdict.job, Action::Fail);
    assert!(!f.registry.get_vitals("bob").unwrap().healthy);
    // No job carries that cookie
    assert_eq!(applied.job, JobDisposition::Untouched);
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Pending);
    assert!(f.worker.builds().is_empty());
}

#[tokio::test]
async fn test_clean_worker_reporting_a_queued_job_fails_it() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_report(WorkerStatusReport::building(job.cookie.clone()));

    let report = f.scanner.scan().await;

    assert!(!report.commit_failed);
    let applied = report.applied.expect("isolation violation should be judged");
    assert_eq!(applied.worker, Action::Fail);
    assert_eq!(applied.job, JobDisposition::Failed);
    assert!(!f.registry.get_vitals("bob").unwrap().healthy);
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(!stored.in_queue);
    // Not handed to any other worker
    let caps = worker("alice").capabilities();
    assert!(f.registry.pending_jobs_for(&caps).unwrap().is_empty());
    assert!(f.worker.builds().is_empty());
}

#[tokio::test]
async fn test_job_on_clean_worker_fails_both() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.insert_worker(worker("bob")).unwrap();
    let mut job = job();
    job.status = JobStatus::Building;
    job.assigned_worker = Some("bob".into());
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");

    let report = f.scanner.scan().await;

    let applied = report.applied.unwrap();
    assert_eq!(applied.worker, Action::Fail);
    assert_eq!(applied.job, JobDisposition::Failed);
    assert_eq!(f.worker.status_calls(), 0);

    let vitals = f.registry.get_vitals("bob").unwrap();
    assert!(!vitals.healthy);
    assert!(vitals.current_job.is_none());
    // The job was blamed, so the worker's count restarts
    assert_eq!(vitals.failure_count, 0);
    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.failure_note.unwrap().contains("isolation"));
}

#[tokio::test]
async fn test_cancellation_confirmed_by_worker() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_report(WorkerStatusReport::building(job.cookie.clone()));
    f.registry.request_cancel(job.id).unwrap();

    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::BusyCancelling);
    assert_eq!(f.worker.abort_calls(), 1);

    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::IdleCleaning);
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(f.worker.abort_calls(), 1);
}

#[tokio::test]
async fn test_cancellation_timeout_marks_job_cancelled() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_report(WorkerStatusReport::building(job.cookie.clone()));
    f.worker.set_honour_abort(false);
    f.registry.request_cancel(job.id).unwrap();

    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::BusyCancelling);

    // Abort is sent once, then we wait for the deadline
    f.clock.advance(Duration::from_secs(179));
    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::BusyCancelling);
    assert_eq!(f.worker.abort_calls(), 1);

    f.clock.advance(Duration::from_secs(1));
    let report = f.scanner.scan().await;
    assert!(report.error.unwrap().contains("did not abort"));
    let applied = report.applied.unwrap();
    assert_eq!(applied.job, JobDisposition::Cancelled);
    assert_eq!(applied.verdict.worker, Action::None);

    let stored = f.registry.get_job(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.finished_at.is_some());
    assert!(f.registry.get_vitals("bob").unwrap().current_job.is_none());
}

#[tokio::test]
async fn test_failure_while_cancelling_cancels_job() {
    let (registry, job) = busy_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.registry.request_cancel(job.id).unwrap();
    f.worker.set_unreachable(true);

    let report = f.scanner.scan().await;

    assert_eq!(report.applied.unwrap().job, JobDisposition::Cancelled);
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_commit_failure_leaves_registry_untouched() {
    let registry = idle_fixture("bob");
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");
    f.registry.fail_next_commits(1);

    let report = f.scanner.scan().await;

    assert!(report.commit_failed);
    assert!(report.applied.is_none());
    assert!(f.worker.builds().is_empty());
    let vitals = f.registry.get_vitals("bob").unwrap();
    assert_eq!(vitals.failure_count, 0);
    assert!(vitals.version.is_none());
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Pending);

    // The next scan goes through normally
    let report = f.scanner.scan().await;
    assert!(!report.commit_failed);
    assert_eq!(report.state, ScannerState::BusyBuilding);
}

#[tokio::test]
async fn test_rejected_assignment_discards_contact_changes() {
    let inner = Arc::new(MemoryRegistry::new());
    let mut vitals = worker("bob");
    vitals.failure_count = 2;
    inner.insert_worker(vitals).unwrap();
    let job = job();
    inner.insert_job(job.clone()).unwrap();
    let registry = Arc::new(ScriptedRegistry::new(inner.clone()));
    registry.reject_assignments(true);
    let (worker, mut scanner) = scripted_scanner(registry.clone(), "bob");
    worker.set_report(WorkerStatusReport::idle().with_version("9.9"));

    let report = scanner.scan().await;

    assert!(report.commit_failed);
    assert!(report.applied.is_none());
    assert!(worker.builds().is_empty());
    let vitals = inner.get_vitals("bob").unwrap();
    assert_eq!(vitals.failure_count, 2);
    assert!(vitals.version.is_none());
    assert_eq!(vitals.clean_status, CleanStatus::Clean);
    assert_eq!(inner.get_job(job.id).unwrap().status, JobStatus::Pending);

    // Contact and assignment land together once the registry accepts them
    registry.reject_assignments(false);
    let report = scanner.scan().await;
    assert_eq!(report.state, ScannerState::BusyBuilding);
    let vitals = inner.get_vitals("bob").unwrap();
    assert_eq!(vitals.failure_count, 0);
    assert_eq!(vitals.version.as_deref(), Some("9.9"));
    assert_eq!(vitals.current_job, Some(job.id));
}

/// Registry where `alice` already took the best job after `bob` listed the
/// queue.
fn raced_fixture() -> (Arc<MemoryRegistry>, Arc<ScriptedRegistry>, JobSnapshot, JobSnapshot) {
    let inner = Arc::new(MemoryRegistry::new());
    inner.insert_worker(worker("alice")).unwrap();
    inner.insert_worker(worker("bob")).unwrap();
    let best = job().with_score(9);
    let next = job().with_score(1);
    inner.insert_job(best.clone()).unwrap();
    inner.insert_job(next.clone()).unwrap();

    let registry = Arc::new(ScriptedRegistry::new(inner.clone()));
    let caps = worker("bob").capabilities();
    registry.freeze_candidates(inner.pending_jobs_for(&caps).unwrap());

    let mut changes = ChangeSet::new();
    changes
        .mark_building(best.id, "alice")
        .set_clean_status("alice", CleanStatus::Dirty);
    inner.commit(changes).unwrap();
    (inner, registry, best, next)
}

#[tokio::test]
async fn test_job_taken_by_another_worker_is_skipped() {
    let (inner, registry, best, next) = raced_fixture();
    let (worker, mut scanner) = scripted_scanner(registry, "bob");

    let report = scanner.scan().await;

    assert_eq!(report.state, ScannerState::BusyBuilding);
    assert!(!report.commit_failed);
    assert!(report.applied.is_none());
    assert_eq!(
        inner.get_job(best.id).unwrap().assigned_worker.as_deref(),
        Some("alice")
    );
    assert_eq!(
        inner.get_job(next.id).unwrap().assigned_worker.as_deref(),
        Some("bob")
    );
    let builds = worker.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].cookie, next.cookie);
}

#[tokio::test]
async fn test_losing_only_candidate_leaves_worker_idle() {
    let (inner, registry, best, _) = raced_fixture();
    registry.freeze_candidates(vec![best.clone()]);
    let (worker, mut scanner) = scripted_scanner(registry, "bob");

    let report = scanner.scan().await;

    assert_eq!(report.state, ScannerState::IdleClean);
    assert!(report.error.is_none());
    assert!(!report.commit_failed);
    assert!(report.applied.is_none());
    assert!(worker.builds().is_empty());
    let vitals = inner.get_vitals("bob").unwrap();
    assert!(vitals.healthy);
    assert_eq!(vitals.failure_count, 0);
    assert_eq!(vitals.version.as_deref(), Some("1.0"));
    assert_eq!(vitals.clean_status, CleanStatus::Clean);
}

#[tokio::test]
async fn test_cleaning_is_idempotent_until_done() {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .insert_worker(worker("bob").with_clean_status(CleanStatus::Dirty))
        .unwrap();
    let job = job();
    registry.insert_job(job.clone()).unwrap();
    let mut f = scan_fixture(registry, "bob");
    f.worker.set_clean_finishes(false);

    for _ in 0..3 {
        let report = f.scanner.scan().await;
        assert_eq!(report.state, ScannerState::IdleCleaning);
        assert_eq!(
            f.registry.get_vitals("bob").unwrap().clean_status,
            CleanStatus::Cleaning
        );
    }
    assert_eq!(f.worker.clean_calls(), 3);
    // Never dispatched while not clean
    assert!(f.worker.builds().is_empty());

    f.worker.set_clean_finishes(true);
    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::IdleClean);

    let report = f.scanner.scan().await;
    assert_eq!(report.state, ScannerState::BusyBuilding);
    assert_eq!(f.registry.get_job(job.id).unwrap().status, JobStatus::Building);
}

#[tokio::test]
async fn test_version_change_is_recorded() {
    let registry = idle_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    f.worker
        .set_report(WorkerStatusReport::idle().with_version("2.1"));

    f.scanner.scan().await;

    assert_eq!(
        f.registry.get_vitals("bob").unwrap().version.as_deref(),
        Some("2.1")
    );
}

#[tokio::test]
async fn test_scan_publishes_completion_time() {
    let registry = idle_fixture("bob");
    let mut f = scan_fixture(registry, "bob");
    let completions = f.scanner.subscribe_completions();
    assert!(completions.borrow().is_none());

    f.scanner.scan().await;

    assert!(completions.borrow().is_some());
    assert_eq!(f.scanner.state(), ScannerState::IdleClean);
}

#[tokio::test]
async fn test_missing_worker_is_reported_not_judged() {
    let registry = Arc::new(MemoryRegistry::new());
    let mut f = scan_fixture(registry, "ghost");

    let report = f.scanner.scan().await;

    assert_eq!(report.state, ScannerState::Failed);
    assert!(report.applied.is_none());
    assert!(report.error.unwrap().contains("ghost"));
}
