use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::{elapsed_since, Clock};
use crate::config::ManagerConfig;
use crate::error::RegistryError;
use crate::registry::Registry;
use crate::scheduler::scanner::{ScannerSummary, WorkerScanner};
use crate::worker::WorkerClientFactory;

/// A running worker scanner.
#[derive(Debug)]
pub struct ScannerHandle {
    pub worker: String,
    pub started_at: DateTime<Utc>,
    pub completed: watch::Receiver<Option<DateTime<Utc>>>,
    pub task: JoinHandle<ScannerSummary>,
}

impl ScannerHandle {
    pub fn last_scan_completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed.borrow()
    }

    /// Last scan completion, or the start time before the first scan ends.
    pub fn last_progress_at(&self) -> DateTime<Utc> {
        self.last_scan_completed_at().unwrap_or(self.started_at)
    }
}

/// Discovers workers and keeps exactly one scanner running per worker name.
///
/// Discovery is additive: scanners for workers that disappear from the
/// registry are left running.
pub struct FleetScanner {
    registry: Arc<dyn Registry>,
    factory: Arc<dyn WorkerClientFactory>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    scanners: BTreeMap<String, ScannerHandle>,
    /// Parent of every scanner's token.
    token: CancellationToken,
}

impl FleetScanner {
    pub fn new(
        registry: Arc<dyn Registry>,
        factory: Arc<dyn WorkerClientFactory>,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            factory,
            clock,
            config,
            scanners: BTreeMap::new(),
            token,
        }
    }

    pub fn scanner_names(&self) -> Vec<String> {
        self.scanners.keys().cloned().collect()
    }

    pub fn scanner(&self, worker: &str) -> Option<&ScannerHandle> {
        self.scanners.get(worker)
    }

    /// One discovery cycle: start scanners for workers that have none.
    ///
    /// Returns the names of the workers whose scanners were started. Must be
    /// called from within a tokio runtime.
    pub fn discover(&mut self) -> Result<Vec<String>, RegistryError> {
        let workers = self.registry.list_all()?;
        let mut started = Vec::new();

        for vitals in workers {
            if self.scanners.contains_key(&vitals.name) {
                continue;
            }
            let client = match self.factory.client_for(&vitals) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(worker = %vitals.name, error = %e, "Cannot create worker client; will retry");
                    continue;
                }
            };
            let scanner = WorkerScanner::new(
                vitals.name.clone(),
                self.registry.clone(),
                client,
                self.clock.clone(),
                &self.config,
            );
            let completed = scanner.subscribe_completions();
            let task = tokio::spawn(scanner.run(self.token.child_token()));
            tracing::info!(worker = %vitals.name, url = %vitals.url, "Started scanner");
            self.scanners.insert(
                vitals.name.clone(),
                ScannerHandle {
                    worker: vitals.name.clone(),
                    started_at: self.clock.now(),
                    completed,
                    task,
                },
            );
            started.push(vitals.name);
        }

        Ok(started)
    }

    /// Names of scanners with no scan completed within the staleness
    /// horizon, counting from their start until the first scan ends.
    pub fn stale_scanners(&self) -> Vec<String> {
        let now = self.clock.now();
        let horizon = self.config.stale_after();
        self.scanners
            .values()
            .filter(|h| elapsed_since(h.last_progress_at(), now) > horizon)
            .map(|h| h.worker.clone())
            .collect()
    }

    /// Run discovery on the fleet interval until the token is cancelled, then
    /// hand back every scanner so the caller can wait for them.
    pub async fn run(mut self) -> Vec<ScannerHandle> {
        let mut interval = tokio::time::interval(self.config.fleet_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_ms = self.config.fleet_interval.as_millis() as u64,
            "Fleet scanner started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {
                    match self.discover() {
                        Ok(started) if !started.is_empty() => {
                            tracing::info!(count = started.len(), "Discovered new workers");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Worker discovery failed; retrying next cycle"),
                    }
                    for worker in self.stale_scanners() {
                        tracing::warn!(worker = %worker, "Scanner has not completed a scan recently");
                    }
                }
            }
        }

        tracing::info!(scanners = self.scanners.len(), "Fleet scanner stopped");
        self.scanners.into_values().collect()
    }
}
