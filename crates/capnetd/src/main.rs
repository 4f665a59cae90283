//! capnetd - capnet simulation daemon
//!
//! Runs a broker, its providers and its requesters in one process and prints
//! a summary once every requester has finished.

use std::path::{Path, PathBuf};

use capnetd::{Simulation, SimulationConfig};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "capnetd=info,capnet_agent=info,capnet_market=info";

#[derive(Parser)]
#[command(name = "capnetd")]
#[command(about = "capnet capacity broker simulation")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, env = "CAPNET_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per event
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run {
        /// Path to config file
        #[arg(short, long, env = "CAPNET_CONFIG", default_value = "capnet.json")]
        config: PathBuf,

        /// Stop after this many seconds (overrides the config file)
        #[arg(long)]
        time_limit: Option<u64>,

        /// Print the final report as JSON
        #[arg(long)]
        json_report: bool,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "capnet.json")]
        output: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run {
            config,
            time_limit,
            json_report,
        } => {
            run_simulation(config, time_limit, json_report).await?;
        }

        Commands::InitConfig { output } => {
            init_config(&output)?;
        }
    }

    Ok(())
}

async fn run_simulation(
    config_path: PathBuf,
    time_limit: Option<u64>,
    json_report: bool,
) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting capnetd");

    let mut config = SimulationConfig::load(&config_path)?;
    if time_limit.is_some() {
        config.time_limit_secs = time_limit;
    }
    info!(
        broker = %config.broker.id,
        providers = config.providers.len(),
        requesters = config.requesters.len(),
        "loaded config"
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, shutting down");
            ctrl_c.cancel();
        }
    });

    let report = Simulation::new(config).run(shutdown).await?;

    if json_report {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "cfps: {}  confirmed: {}  rejected: {}  expired: {}  completed: {}",
        report.cfps, report.confirmed, report.rejected, report.expired, report.completed
    );
    for r in &report.requesters {
        println!(
            "  {:<16} completed {:>3}  lost {:>3}  requests {:>3}  {}",
            r.id,
            r.completed,
            r.lost,
            r.requests_sent,
            if r.finished { "finished" } else { "unfinished" }
        );
    }
    for p in &report.providers {
        println!(
            "  {:<16} jobs done {:>3}  queued {:>3}  {}",
            p.id, p.jobs_done, p.queued, p.phase
        );
    }

    if !report.all_finished() {
        anyhow::bail!("not every requester finished its jobs");
    }
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let config = SimulationConfig::sample();
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Run the simulation with:");
    println!("  capnetd run --config {}", output.display());

    Ok(())
}
