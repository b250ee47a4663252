use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use buildfarm::clock::SystemClock;
use buildfarm::config::{FleetFileConfig, ManagerConfig};
use buildfarm::registry::{MemoryRegistry, WorkerRegistry};
use buildfarm::service::SchedulingService;
use buildfarm::shutdown::install_shutdown_handler;
use buildfarm::worker::HttpClientFactory;

#[derive(Parser, Debug)]
#[command(name = "buildfarm")]
#[command(version)]
#[command(about = "Dispatches build jobs to a fleet of build workers")]
struct Args {
    /// Fleet file (JSON) holding the workers and the job queue
    #[arg(long)]
    fleet: PathBuf,

    /// Seconds between scans of each worker
    #[arg(long, default_value = "15")]
    poll_interval_secs: u64,

    /// Seconds between worker discovery cycles
    #[arg(long, default_value = "15")]
    fleet_interval_secs: u64,

    /// Seconds a worker gets to honour an abort request
    #[arg(long, default_value = "180")]
    cancel_deadline_secs: u64,

    /// Network timeout for worker RPCs, in seconds
    #[arg(long, default_value = "30")]
    rpc_timeout_secs: u64,

    /// Seconds to wait for in-flight scans at shutdown
    #[arg(long, default_value = "60")]
    shutdown_timeout_secs: u64,

    /// Do not write the registry back to the fleet file on shutdown
    #[arg(long)]
    no_persist: bool,
}

impl Args {
    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_fleet_interval(Duration::from_secs(self.fleet_interval_secs))
            .with_cancel_deadline(Duration::from_secs(self.cancel_deadline_secs))
            .with_rpc_timeout(Duration::from_secs(self.rpc_timeout_secs))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
    }

    fn fleet_file(&self) -> FleetFileConfig {
        FleetFileConfig {
            path: self.fleet.clone(),
            persist_on_shutdown: !self.no_persist,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.manager_config();
    let fleet_file = args.fleet_file();

    let registry = Arc::new(MemoryRegistry::load(&fleet_file.path)?);
    tracing::info!(
        path = %fleet_file.path.display(),
        workers = registry.list_all()?.len(),
        "Loaded fleet"
    );

    let factory = Arc::new(HttpClientFactory::new(config.rpc_timeout));
    let shutdown = install_shutdown_handler()?;
    let service = SchedulingService::start(
        registry.clone(),
        factory,
        Arc::new(SystemClock),
        config,
    )?;

    shutdown.cancelled().await;
    let result = service.stop().await;

    if fleet_file.persist_on_shutdown {
        registry.persist(&fleet_file.path)?;
        tracing::info!(path = %fleet_file.path.display(), "Fleet persisted");
    }

    let report = result?;
    if !report.timed_out.is_empty() {
        tracing::warn!(scanners = ?report.timed_out, "Some scanners were aborted at shutdown");
    }
    Ok(())
}
