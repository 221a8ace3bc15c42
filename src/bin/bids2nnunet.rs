use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use bids_nnunet::app::{Converter, validate_sources};
use bids_nnunet::config::{ConfigLoader, ConfigOverrides, resolve_sources};
use bids_nnunet::error::ConvertError;
use bids_nnunet::fetch::{FetchOptions, GitFetcher, fetch_all};
use bids_nnunet::layout::OutputLayout;
use bids_nnunet::output::{JsonOutput, TextOutput};
use bids_nnunet::provenance::GitProvenance;
use bids_nnunet::split::OverrideTable;
use bids_nnunet::store;

#[derive(Parser)]
#[command(name = "bids2nnunet")]
#[command(about = "Convert multi-site BIDS MRI datasets into the nnU-Net v2 multi-channel layout")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build the nnU-Net raw dataset from one or more BIDS sources")]
    Convert(ConvertArgs),
    #[command(about = "Clone configured source datasets and pin their revisions")]
    Fetch(FetchArgs),
}

#[derive(Args)]
struct ConvertArgs {
    /// BIDS dataset roots, each containing derivatives/labels.
    #[arg(long, num_args = 1..)]
    path_data: Vec<String>,

    /// Directory that receives Dataset<NNN>_<name>Seed<seed>.
    #[arg(long)]
    path_out: Option<String>,

    #[arg(short = 'n', long)]
    dataset_name: Option<String>,

    #[arg(short = 'd', long)]
    dataset_number: Option<u32>,

    #[arg(long)]
    seed: Option<u64>,

    /// Train and test ratios, summing to 1.
    #[arg(long, num_args = 2, value_names = ["TRAIN", "TEST"])]
    split: Option<Vec<f64>>,

    #[arg(long)]
    orientation: Option<String>,

    /// Binarization threshold for both masks.
    #[arg(long)]
    threshold: Option<f32>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    out: String,

    #[arg(long)]
    config: Option<String>,

    /// Only clone and check out; skip `git annex get`.
    #[arg(long)]
    no_download: bool,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ConvertError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ConvertError) -> u8 {
    match error.kind() {
        "configuration" | "invalid_source_path" => 2,
        "external_tool" => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Convert(args) => run_convert(args),
        Commands::Fetch(args) => run_fetch(args),
    }
}

fn run_convert(args: ConvertArgs) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        path_data: args.path_data,
        path_out: args.path_out,
        dataset_name: args.dataset_name,
        dataset_number: args.dataset_number,
        seed: args.seed,
        split: args.split,
        orientation: args.orientation,
        threshold: args.threshold,
    };
    let config = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    validate_sources(&config)?;

    let layout = OutputLayout::new(
        &config.path_out,
        config.dataset_number,
        &config.dataset_name,
        config.seed,
    );
    store::ensure_dir(layout.root())?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(layout.log_path())
        .into_diagnostic()?;
    init_tracing(Some(log_file));

    let converter = Converter::new(GitProvenance::new());
    let result = converter.convert(&config)?;
    if args.json {
        JsonOutput::print_convert(&result).into_diagnostic()?;
    } else {
        TextOutput::print_convert(&result);
    }
    Ok(())
}

fn run_fetch(args: FetchArgs) -> miette::Result<()> {
    init_tracing(None);

    let config = ConfigLoader::load(args.config.as_deref())?;
    if config.sources.is_empty() {
        return Err(ConvertError::MissingConfig.into());
    }
    let sources = resolve_sources(config.sources, &mut OverrideTable::new())?;
    let options = FetchOptions {
        no_download: args.no_download,
    };
    let report = fetch_all(&GitFetcher::new(), &sources, Path::new(&args.out), options)?;
    if args.json {
        JsonOutput::print_fetch(&report).into_diagnostic()?;
    } else {
        TextOutput::print_fetch(&report);
    }
    Ok(())
}

/// Logs to stderr and, when given, appends plain-text records to `log_file`.
fn init_tracing(log_file: Option<File>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let file_layer = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
