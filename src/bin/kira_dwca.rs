use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_dwca_harvester::archive::ArchiveAssembler;
use kira_dwca_harvester::config::{ConfigLoader, ResolvedConfig};
use kira_dwca_harvester::domain::{LogicalField, Term};
use kira_dwca_harvester::error::HarvestError;
use kira_dwca_harvester::output::{JsonOutput, TextOutput};
use kira_dwca_harvester::pipeline::Pipeline;
use kira_dwca_harvester::portal::PortalHttpClient;
use kira_dwca_harvester::projector::Projector;
use kira_dwca_harvester::reader::{
    DEFAULT_DELIMITER, DelimitedReader, Layout, MergedRecords, ReaderOptions,
};
use kira_dwca_harvester::runner::Runner;
use kira_dwca_harvester::staging::{SqliteStagingStore, StagingStore};
use kira_dwca_harvester::taxonomy::{NoTaxonomy, TaxonomyLookup, TaxonomyTable};
use kira_dwca_harvester::workdir::WorkDir;

#[derive(Parser)]
#[command(name = "kira-dwca")]
#[command(about = "Harvest ENA sequence metadata into Darwin Core Archives")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable reports.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one harvest cycle over the configured tasks")]
    Run(RunArgs),
    #[command(about = "Build an archive from existing raw files, without staging")]
    Archive(ArchiveArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    /// Run only this task; its dependencies are assumed complete.
    #[arg(long)]
    task: Option<String>,
}

#[derive(Args)]
struct ArchiveArgs {
    /// Raw delimited files, merged in the given order.
    #[arg(long = "input", required = true)]
    inputs: Vec<Utf8PathBuf>,

    #[arg(long)]
    output: Utf8PathBuf,

    #[arg(long)]
    metadata: Option<Utf8PathBuf>,

    /// Comma-separated term order; defaults to every term.
    #[arg(long, value_delimiter = ',')]
    terms: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_DELIMITER)]
    delimiter: char,

    #[arg(long)]
    taxonomy: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::TaskFailed { source, .. } => map_exit_code(source),
        HarvestError::PortalHttp(_) | HarvestError::PortalStatus { .. } => 3,
        error if error.is_configuration() => 2,
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
    match cli.command {
        Commands::Run(args) => run_harvest(args, cli.json),
        Commands::Archive(args) => run_archive(args, cli.json),
    }
}

fn run_harvest(args: RunArgs, json: bool) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let tasks = match &args.task {
        Some(name) => vec![
            resolved
                .task(name)
                .cloned()
                .ok_or_else(|| HarvestError::Config(format!("no task named {name}")))?,
        ],
        None => resolved.tasks.clone(),
    };

    let pipeline = build_pipeline(&resolved)?;
    let summary = Runner::new(pipeline, resolved.workers).run(&tasks)?;

    if json {
        JsonOutput::print_run(&summary).into_diagnostic()?;
    } else {
        TextOutput::print_run(&summary).into_diagnostic()?;
    }

    match summary.failures.into_iter().next() {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn build_pipeline(resolved: &ResolvedConfig) -> Result<Pipeline, HarvestError> {
    resolved.workdir.ensure_root()?;
    let store: Arc<dyn StagingStore> = match &resolved.database {
        Some(path) => Arc::new(SqliteStagingStore::open(path.clone())?),
        None => Arc::new(SqliteStagingStore::in_memory()?),
    };
    let taxonomy = load_taxonomy(resolved.taxonomy_file.as_ref())?;
    let portal = Arc::new(PortalHttpClient::new()?);
    Ok(Pipeline::new(
        resolved.workdir.clone(),
        portal,
        store,
        taxonomy,
    ))
}

fn load_taxonomy(path: Option<&Utf8PathBuf>) -> Result<Arc<dyn TaxonomyLookup>, HarvestError> {
    match path {
        Some(path) => Ok(Arc::new(TaxonomyTable::load(path.as_std_path())?)),
        None => Ok(Arc::new(NoTaxonomy)),
    }
}

fn run_archive(args: ArchiveArgs, json: bool) -> miette::Result<()> {
    let terms = if args.terms.is_empty() {
        Term::ALL.to_vec()
    } else {
        args.terms
            .iter()
            .map(|term| term.parse::<Term>())
            .collect::<Result<Vec<_>, HarvestError>>()?
    };

    let scratch_root = args
        .output
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .map(|parent| parent.to_path_buf())
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    let assembler = ArchiveAssembler::new(WorkDir::new(scratch_root));

    let options = ReaderOptions {
        delimiter: args.delimiter,
        layout: Layout::discovered(&[LogicalField::Accession]),
        omit: Vec::new(),
    };
    let readers = args
        .inputs
        .iter()
        .map(|input| DelimitedReader::new(input.as_std_path(), options.clone()))
        .collect();
    let taxonomy = load_taxonomy(args.taxonomy.as_ref())?;
    let projector = Projector::new(taxonomy.as_ref());
    let metadata = args
        .metadata
        .unwrap_or_else(|| Utf8PathBuf::from("eml.xml"));

    let mut merged = MergedRecords::new(readers);
    let mut projection = projector.project(&mut merged);
    let report = assembler.assemble(
        &args.output,
        &mut projection,
        &terms,
        metadata.as_std_path(),
    )?;
    let stats = projection.stats();

    if json {
        let value = serde_json::json!({
            "archive": report,
            "projection": stats,
            "read": merged.stats(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).into_diagnostic()?
        );
    } else {
        println!(
            "{} record(s) -> {} ({} skipped)",
            report.records_written, report.path, stats.lines_skipped
        );
    }
    Ok(())
}
