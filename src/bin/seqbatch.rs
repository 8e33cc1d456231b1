use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use seqbatch_sync::app::App;
use seqbatch_sync::config::ConfigLoader;
use seqbatch_sync::domain::{DownloadMode, LabCode};
use seqbatch_sync::error::SyncError;
use seqbatch_sync::output::{JsonOutput, LogProgress};
use seqbatch_sync::transfer;

#[derive(Parser)]
#[command(name = "seqbatch")]
#[command(about = "Pull lab sequencing submissions from a transfer server into validated local batches")]
#[command(version, author)]
struct Cli {
    /// Configuration file (defaults to ./seqbatch.json, then the user config dir)
    #[arg(long)]
    config: Option<String>,

    /// Overrides the configured download mode
    #[arg(long, value_enum)]
    mode: Option<DownloadMode>,

    /// Only process this lab; may be repeated
    #[arg(long = "lab", value_name = "LAB")]
    labs: Vec<String>,

    /// Overrides the configured local output directory
    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingConfig
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::InvalidConfig(_)
        | SyncError::InvalidLabCode(_) => 2,
        SyncError::Connection(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.download_mode = mode;
    }
    if let Some(output) = cli.output {
        config.output_dir = output;
    }
    if !cli.labs.is_empty() {
        config.target_labs = cli
            .labs
            .iter()
            .map(|lab| lab.parse::<LabCode>())
            .collect::<Result<_, _>>()?;
    }

    tracing::info!(
        mode = %config.download_mode,
        output = %config.output_dir,
        "starting run"
    );
    let client = transfer::connect(&config.remote);
    let mut app = App::new(config, client);
    let summary = app.run(&LogProgress)?;
    JsonOutput::print_summary(&summary).into_diagnostic()?;
    Ok(())
}
