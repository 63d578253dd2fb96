//! `frh_daq` command-line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use frh_daq::analysis::{AnalysisReport, RcTransientAnalyzer};
use frh_daq::channel::discover_resources;
use frh_daq::config::{FrhConfig, DEFAULT_CONFIG_PATH};
use frh_daq::experiment::{ConsoleOperator, Orchestrator, RunResult, VisaConnector};
use frh_daq::instrument::DcRange;
use frh_daq::logging;
use frh_daq::sim::SimulatedBench;
use frh_daq::storage::{read_batch, TextFileStore};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "frh_daq", version, about = "FRH RC-transient bench acquisition")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the interactive measurement
    Run {
        /// Use the in-process simulated bench instead of VISA instruments
        #[arg(long)]
        simulate: bool,
    },
    /// List VISA resources
    Discover,
    /// Re-analyze saved batches
    Analyze {
        /// Generator-phase batch file
        #[arg(long)]
        generator: PathBuf,
        /// Capacitor-phase batch file
        #[arg(long)]
        capacitor: PathBuf,
        /// Nominal capacitance (F)
        #[arg(long)]
        capacitance: f64,
        /// Series resistance (ohm)
        #[arg(long)]
        resistance: f64,
        /// Sample spacing (s)
        #[arg(long)]
        spacing: f64,
        /// DC range the capacitor batch was taken on (V)
        #[arg(long, default_value_t = 10.0)]
        range: f64,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FrhConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init_from_config(&config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Command, config: FrhConfig) -> Result<()> {
    match command {
        Command::Run { simulate } => run(config, simulate).await,
        Command::Discover => {
            let resources = discover_resources().await?;
            if resources.is_empty() {
                println!("No VISA resources found");
            }
            for resource in resources {
                println!("{}", resource);
            }
            Ok(())
        }
        Command::Analyze {
            generator,
            capacitor,
            capacitance,
            resistance,
            spacing,
            range,
        } => {
            let analyzer = RcTransientAnalyzer::with_range(DcRange::try_from(range)?);
            let generator = read_batch(&generator)
                .await
                .with_context(|| format!("Failed to read {}", generator.display()))?;
            let capacitor = read_batch(&capacitor)
                .await
                .with_context(|| format!("Failed to read {}", capacitor.display()))?;
            let report = AnalysisReport::compute(
                &analyzer,
                &generator,
                &capacitor,
                capacitance,
                resistance,
                spacing,
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: FrhConfig, simulate: bool) -> Result<()> {
    let store = TextFileStore::from_config(&config.storage);
    let mut orchestrator = if simulate {
        info!("Using the simulated bench");
        Orchestrator::new(config, SimulatedBench::new(), store)
    } else {
        let connector = VisaConnector::from_config(&config);
        Orchestrator::new(config, connector, store)
    };

    let mut operator = ConsoleOperator::stdio();
    orchestrator.run(&mut operator).await?;

    for (i, result) in orchestrator.results().iter().enumerate() {
        match result {
            RunResult::Analyzed(report) => info!(
                "Run {}: C = {:.6e} F ± {:.3e} F",
                i + 1,
                report.capacitance_f,
                report.uncertainty_f
            ),
            RunResult::Aborted { state, reason } => {
                info!("Run {}: aborted in {}: {}", i + 1, state, reason)
            }
        }
    }
    Ok(())
}
