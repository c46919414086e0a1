/*!
 * Meridian CLI - Command Line Interface
 */

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use meridian::{
    config::{LogLevel, MeridianConfig},
    error::{FlowError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
    stage::StageRegistry,
    supervisor::Supervisor,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "meridian")]
#[command(version, about = "Message-driven data distribution pipeline", long_about = None)]
struct Cli {
    /// Log level (overrides the configuration file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured flow until interrupted
    Run {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Validate a configuration and every stage's options without running
    Check {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// List built-in stages and their entry points
    Stages,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<FlowError>()
                .map(FlowError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let registry = StageRegistry::with_builtin();

    match cli.command {
        Commands::Stages => {
            print_stages(&registry);
            Ok(())
        }
        Commands::Check { ref config } => {
            let config = load_config(config, &cli)?;
            check(&config, &registry)
        }
        Commands::Run { ref config } => {
            let config = load_config(config, &cli)?;
            if let Err(e) = logging::init_logging(&config) {
                eprintln!("Warning: Failed to initialize logging: {}", e);
            }
            let runtime = tokio::runtime::Runtime::new().context("starting the async runtime")?;
            runtime.block_on(run_flows(config, registry))
        }
    }
}

fn load_config(path: &Path, cli: &Cli) -> anyhow::Result<MeridianConfig> {
    let mut config = MeridianConfig::from_file(path)?;
    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    config.verbose |= cli.verbose;
    Ok(config)
}

fn print_stages(registry: &StageRegistry) {
    for descriptor in registry.list() {
        println!("{:<16} {}", descriptor.name, descriptor.summary);
        println!("{:<16} entry points: {}", "", descriptor.entry_points);
        for spec in descriptor.schema.specs() {
            let default = spec
                .default
                .as_ref()
                .map(|d| format!(" (default {})", d))
                .unwrap_or_else(|| if spec.required { " (required)".to_string() } else { String::new() });
            println!("{:<16}   {} <{}>{}: {}", "", spec.name, spec.kind, default, spec.help);
        }
    }
}

/// Resolve every stage of every flow the way `run` would
fn check(config: &MeridianConfig, registry: &StageRegistry) -> anyhow::Result<()> {
    for flow in &config.flows {
        registry
            .load_chain(&flow.stages, &flow.defaults, &flow.settings)
            .with_context(|| format!("flow '{}'", flow.name))?;
        println!("flow '{}': {} stage(s) ok", flow.name, flow.stages.len());
    }
    if config.flows.is_empty() {
        println!("no flows configured");
    }
    Ok(())
}

async fn run_flows(config: MeridianConfig, registry: StageRegistry) -> anyhow::Result<()> {
    let supervisor = Supervisor::from_config(&config, &registry).await?;
    if supervisor.is_empty() {
        warn!("no flows configured");
        return Ok(());
    }

    let stop = supervisor.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping flows");
                stop.stop();
            }
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    let finished = supervisor.run().await?;
    for (flow, stats) in finished {
        stats.log(&flow, "final");
    }
    Ok(())
}
