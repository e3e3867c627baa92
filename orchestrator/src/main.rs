mod config;
mod telemetry;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError};
use payout::ledger::LedgerError;
use payout::types::IssueKey;
use payout::PayoutServiceError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "orchestrator", version, about = "Bounty payout orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "orchestrator.yaml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the payout API and retry pending cancellations in the background
    Run(ConfigArgs),
    /// List payouts whose cancellation permanently failed
    Failed(ConfigArgs),
    /// Show a payout record with its attempt history
    History {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        repository: String,
        #[arg(long)]
        issue_number: u64,
    },
}

impl CliCommand {
    fn config_path(&self) -> &Path {
        match self {
            CliCommand::Run(args) | CliCommand::Failed(args) => &args.config,
            CliCommand::History { config, .. } => &config.config,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Service(#[from] PayoutServiceError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("could not encode output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("no payout record for {0}")]
    NotFound(IssueKey),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(cli.command.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.command.config_path().display());
            return ExitCode::FAILURE;
        }
    };

    let _sentry = telemetry::init_sentry(&config.common.logging);
    telemetry::init_tracing(&config.common.logging);
    if let Some(metrics) = &config.common.metrics
        && let Err(e) = telemetry::init_metrics(metrics)
    {
        tracing::error!(error = %e, "metrics disabled");
    }

    match execute(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: CliCommand, config: Config) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        CliCommand::Run(_) => runtime.block_on(payout::run(config.payout))?,
        CliCommand::Failed(_) => {
            let reporting = payout::open_reporting(&config.payout)?;
            let failed = runtime.block_on(reporting.failed_payouts())?;
            println!("{}", serde_json::to_string_pretty(&failed)?);
        }
        CliCommand::History {
            repository,
            issue_number,
            ..
        } => {
            let key = IssueKey::new(&repository, issue_number);
            let reporting = payout::open_reporting(&config.payout)?;
            let history = runtime
                .block_on(reporting.history(&key))?
                .ok_or(CliError::NotFound(key))?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
    }

    Ok(())
}
