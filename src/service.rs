use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::ManagerConfig;
use crate::error::{BuildfarmError, Result};
use crate::registry::Registry;
use crate::scheduler::{FleetScanner, ScannerHandle, ScannerSummary};
use crate::worker::WorkerClientFactory;

/// What `stop` observed while draining the scanners.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Scanners that finished their in-flight scan and exited.
    pub stopped: Vec<ScannerSummary>,
    /// Scanners still running at the deadline; they were aborted.
    pub timed_out: Vec<String>,
}

/// Owns the fleet scanner and, through it, every worker scanner.
pub struct SchedulingService {
    token: CancellationToken,
    fleet: JoinHandle<Vec<ScannerHandle>>,
    config: ManagerConfig,
}

impl SchedulingService {
    /// Start the fleet scanner loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        registry: Arc<dyn Registry>,
        factory: Arc<dyn WorkerClientFactory>,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let token = CancellationToken::new();
        let fleet = FleetScanner::new(registry, factory, clock, config.clone(), token.clone());
        let fleet = tokio::spawn(fleet.run());
        tracing::info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "Scheduling service started"
        );
        Ok(Self {
            token,
            fleet,
            config,
        })
    }

    /// A token that is cancelled when the service begins stopping.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop discovery and every scanner, waiting up to the configured
    /// shutdown timeout for in-flight scans to finish.
    ///
    /// # Errors
    ///
    /// Returns [`BuildfarmError::RegistryCommitFailure`] when any scanner's
    /// final scan could not commit its changes. Timeouts are reported in the
    /// returned [`ShutdownReport`] instead.
    pub async fn stop(self) -> Result<ShutdownReport> {
        tracing::info!("Stopping scheduling service");
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        let mut report = ShutdownReport::default();
        let mut fleet = self.fleet;
        let handles = match tokio::time::timeout_at(deadline, &mut fleet).await {
            Ok(Ok(handles)) => handles,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Fleet scanner task failed");
                Vec::new()
            }
            Err(_) => {
                tracing::error!("Fleet scanner did not stop before the shutdown deadline");
                fleet.abort();
                Vec::new()
            }
        };

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle.task).await {
                Ok(Ok(summary)) => report.stopped.push(summary),
                Ok(Err(e)) => {
                    tracing::error!(worker = %handle.worker, error = %e, "Scanner task failed");
                }
                Err(_) => {
                    tracing::warn!(worker = %handle.worker, "Scanner still running at shutdown deadline; aborting");
                    handle.task.abort();
                    report.timed_out.push(handle.worker);
                }
            }
        }

        let commit_failures: Vec<String> = report
            .stopped
            .iter()
            .filter(|s| s.last_commit_failed)
            .map(|s| s.worker.clone())
            .collect();
        if !commit_failures.is_empty() {
            return Err(BuildfarmError::RegistryCommitFailure(commit_failures));
        }

        tracing::info!(
            stopped = report.stopped.len(),
            timed_out = report.timed_out.len(),
            "Scheduling service stopped"
        );
        Ok(report)
    }
}
