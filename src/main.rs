mod classifier;
mod cli;
mod config;
mod error;
mod exclusions;
mod orchestrator;
mod probe;
mod progress;
mod runner;
mod sampler;
mod skip;
mod state_machine;
mod ui;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{BackupArgs, Cli, Command, RestoreArgs};
use config::WardenConfig;
use error::ImagingError;
use exclusions::ExclusionList;
use orchestrator::{BackupOrchestrator, RestoreOrchestrator, current_system_drive};
use runner::TokioLauncher;
use skip::FsPlaceholderProbe;
use state_machine::{ApplyParams, CaptureParams, ImagingJob, JobReport};
use ui::Console;

const EXIT_FAILURE: u8 = 1;
const EXIT_PRECONDITION: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<ImagingError>() {
                Some(ImagingError::Precondition(_)) => ExitCode::from(EXIT_PRECONDITION),
                _ => ExitCode::from(EXIT_FAILURE),
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "imagewarden=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = WardenConfig::load(cli.config.as_deref())?;
    if let Some(max_attempts) = cli.max_attempts {
        config.retry.max_attempts = max_attempts;
    }

    let console = Arc::new(if cli.json {
        Console::silent()
    } else {
        Console::stderr()
    });

    let report = match cli.command {
        Command::Backup(args) => backup(args, config, Arc::clone(&console)).await?,
        Command::Restore(args) => restore(args, config, Arc::clone(&console)).await?,
        Command::Exclusions { exclusions } => {
            let mut extra = config.extra_exclusions.clone();
            extra.extend(exclusions);
            print!("{}", ExclusionList::build(&extra).render());
            return Ok(ExitCode::SUCCESS);
        }
    };

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{json}");
    } else {
        console.summary(&report);
    }

    Ok(if report.result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURE)
    })
}

async fn backup(args: BackupArgs, config: WardenConfig, console: Arc<Console>) -> Result<JobReport> {
    let job = ImagingJob::capture(CaptureParams {
        source: args.source,
        destination: args.dest,
        name: args.name,
        description: args.description,
        exclusions: args.exclusions,
        compression: args.compress.map(Into::into).unwrap_or(config.compression),
        threads: config.effective_threads(args.threads),
        tolerate_errors: args.tolerate_errors,
    });
    tracing::info!(job = %job.id, "backup requested");

    let orchestrator = BackupOrchestrator::new(TokioLauncher, FsPlaceholderProbe, config, console);
    Ok(orchestrator.run(&job, !args.skip_dirty_check).await?)
}

async fn restore(args: RestoreArgs, config: WardenConfig, console: Arc<Console>) -> Result<JobReport> {
    let job = ImagingJob::apply(ApplyParams {
        image: args.image,
        index: args.index.unwrap_or(config.image_index),
        target: args.target,
        firmware: args.firmware.map(Into::into).unwrap_or(config.firmware),
    });
    tracing::info!(job = %job.id, "restore requested");

    let orchestrator = RestoreOrchestrator::new(TokioLauncher, config, console, current_system_drive());
    Ok(orchestrator.run(&job).await?)
}
