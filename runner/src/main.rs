use batchflow::{
    computation::{ClusterComputation, ProgramStage, Stage},
    config::PipelineConfig,
    database::SharedConnection,
    pipeline::run_computations,
    scheduler::{JobSequence, SchedulerClient},
};
use clap::Parser;
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Run a pipeline of cluster stages and collect their results in SQLite
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// pipeline configuration (YAML)
    config: PathBuf,

    /// print the commands every stage would submit without submitting them
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match PipelineConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(error = %error, path = ?cli.config, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if config.preflight_checks() {
        error!("Found errors in the config, aborting");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        return dry_run(&config);
    }

    // one sequence for the whole run, job names never repeat
    let sequence = Arc::new(JobSequence::new());
    let mut stages = config
        .stages
        .iter()
        .map(|stage| {
            Stage::cluster(
                ProgramStage::load(stage),
                SchedulerClient::load(&config.scheduler, sequence.clone()),
            )
        })
        .collect::<Vec<_>>();

    match run_computations(&mut stages, config.database.clone()) {
        Ok(report) => {
            info!(
                stages = report.stages.len(),
                records = report.records(),
                "Pipeline finished"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = %error, "Pipeline failed");
            ExitCode::FAILURE
        }
    }
}

fn dry_run(config: &PipelineConfig) -> ExitCode {
    let session = match SharedConnection::load(&config.database) {
        Ok(session) => session,
        Err(error) => {
            error!(error = %error, "Failed to open the result store");
            return ExitCode::FAILURE;
        }
    };

    for stage in &config.stages {
        let mut program = ProgramStage::load(stage);

        match program.make_cmd_list(&session) {
            Ok((_, commands)) => {
                println!("# {} ({} commands)", stage.name, commands.len());
                commands.iter().for_each(|command| println!("{command}"));
            }
            Err(error) => {
                error!(error = %error, stage = %stage.name, "Failed to create commands");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
