use anyhow::Context;
use clap::{Parser, Subcommand};
use jobwire_core::{config::DEFAULT_LOG_FILTER, JobStoreBackend, JobwireConfig};
use jobwire_scheduler::{store::open_store, RunOutcome, Scheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod tasks;

#[derive(Parser)]
#[command(name = "jobwire", version, about = "Persistent cron and interval job scheduler")]
struct Cli {
    /// Config file (default ~/.jobwire/jobwire.toml)
    #[arg(long, global = true, env = "JOBWIRE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap the configured jobs and run until Ctrl-C (default)
    Run,
    /// Print stored jobs as JSON
    Jobs,
    /// Print run history as JSON
    Runs {
        /// Only runs of this job
        #[arg(long)]
        job: Option<String>,
        /// Only failed and timed-out runs
        #[arg(long)]
        failed: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // explicit --config > JOBWIRE_CONFIG > ~/.jobwire/jobwire.toml
    let loaded = JobwireConfig::load(cli.config.as_deref());
    let filter = loaded
        .as_ref()
        .map(|c| c.logging.filter.clone())
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
    let config = loaded.map_err(|e| anyhow::anyhow!("[{}] loading configuration: {e}", e.code()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Jobs => print_jobs(&config),
        Command::Runs { job, failed, limit } => print_runs(&config, job.as_deref(), failed, limit),
    }
}

async fn run(config: JobwireConfig) -> anyhow::Result<()> {
    let scheduler = Scheduler::bootstrap(&config.scheduler, tasks::builtin_registry())
        .await
        .context("bootstrapping scheduler")?;
    if !scheduler.is_running() {
        scheduler.start()?;
    }
    info!(jobs = scheduler.list_jobs()?.len(), "jobwire running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if !scheduler.stop().await? {
        warn!(
            grace_secs = config.scheduler.shutdown_grace_secs,
            "runs still in flight when the grace period ended"
        );
    }
    Ok(())
}

fn print_jobs(config: &JobwireConfig) -> anyhow::Result<()> {
    warn_if_volatile(config);
    let store = open_store(&config.scheduler.jobstore, config.scheduler.run_history_limit)?;
    println!("{}", serde_json::to_string_pretty(&store.list()?)?);
    Ok(())
}

fn print_runs(config: &JobwireConfig, job: Option<&str>, failed: bool, limit: usize) -> anyhow::Result<()> {
    warn_if_volatile(config);
    let store = open_store(&config.scheduler.jobstore, config.scheduler.run_history_limit)?;
    let runs = match job {
        Some(id) => {
            let mut runs = store.runs(id, limit)?;
            if failed {
                runs.retain(|r| r.outcome != RunOutcome::Success);
            }
            runs
        }
        None if failed => store.failed_runs(limit)?,
        None => anyhow::bail!("pass --job ID or --failed"),
    };
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

fn warn_if_volatile(config: &JobwireConfig) {
    if config.scheduler.jobstore.backend == JobStoreBackend::Memory {
        warn!("memory job store configured; nothing persists between processes");
    }
}
