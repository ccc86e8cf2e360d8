use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use focos_enricher::config::{ConfigLoader, RunSettings};
use focos_enricher::error::FocosError;
use focos_enricher::export::GdalExportWriter;
use focos_enricher::layers::GdalLayerLoader;
use focos_enricher::output::{JsonOutput, OutputMode, StderrProgress, print_summary};
use focos_enricher::pipeline::{Pipeline, ProgressSink};
use focos_enricher::remote::DriveHttpClient;

#[derive(Parser)]
#[command(name = "focos-enrich")]
#[command(about = "Enrich wildfire hotspot observations with spatial reference layers")]
#[command(version, author)]
struct Cli {
    /// Credential descriptor (defaults to ./credentials.json when present)
    #[arg(long)]
    credentials: Option<String>,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(focos) = report.downcast_ref::<FocosError>() {
            return ExitCode::from(map_exit_code(focos));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &FocosError) -> u8 {
    match error {
        FocosError::MissingCredentials
        | FocosError::ConfigRead(_)
        | FocosError::ConfigParse(_) => 2,
        err if err.is_fatal_precondition() => 2,
        err if err.is_remote() => 3,
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
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let credentials = ConfigLoader::resolve(cli.credentials.as_deref())?;
    let client = DriveHttpClient::new(&credentials)?;
    let pipeline = Pipeline::new(
        client,
        GdalLayerLoader,
        GdalExportWriter,
        RunSettings::default(),
    );

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &StderrProgress,
    };
    let report = pipeline.run(sink)?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Human => print_summary(&report),
    }
    Ok(())
}
