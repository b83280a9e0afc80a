use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pwc_graph::config;
use pwc_graph::confirm::confirm_full_drop;
use pwc_graph::diff::{self, DiffOptions, DiffScope};
use pwc_graph::environments::{ConnectionSettings, Environments, Overrides, EXAMPLE_ENVIRONMENTS};
use pwc_graph::error::SyncError;
use pwc_graph::inspect;
use pwc_graph::store::{GraphStore, MemoryStore, Neo4jStore};
use pwc_graph::sync::{IngestOptions, IngestReport, Limits, SourceFiles, SyncEngine};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "pwc-graph")]
#[command(about = "Load Papers with Code dumps into Neo4j and compare graph instances")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load dump files into a graph store
    Ingest(IngestArgs),
    /// Compare two graph stores
    Diff(DiffArgs),
    /// Show layout and fields of the dump files in a directory
    Inspect(InspectArgs),
    /// List and validate named connection environments
    Envs(EnvsArgs),
}

#[derive(Args)]
struct ConnectionArgs {
    /// Named environment from the environments file
    #[arg(long)]
    env: Option<String>,

    /// Bolt URI, overrides the environment
    #[arg(long)]
    uri: Option<String>,

    /// User name, overrides the environment
    #[arg(long)]
    user: Option<String>,

    /// Password, overrides the environment
    #[arg(long, env = "NEO4J_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl ConnectionArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            uri: self.uri.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Args)]
struct IngestArgs {
    /// Directory holding the dump files (defaults to the newest ./pwc-* directory)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,

    /// Environments file
    #[arg(long, default_value = config::DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Maximum papers to load (0 = no limit)
    #[arg(long, default_value_t = 0)]
    papers: u64,

    /// Maximum repositories to load (0 = no limit)
    #[arg(long, default_value_t = 0)]
    repositories: u64,

    /// Maximum datasets to load (0 = no limit)
    #[arg(long, default_value_t = 0)]
    datasets: u64,

    /// Maximum evaluation tasks to load (0 = no limit)
    #[arg(long, default_value_t = 0)]
    tasks: u64,

    /// Skip the code links file entirely
    #[arg(long)]
    no_repositories: bool,

    /// Rows per write batch
    #[arg(long, default_value_t = config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Concurrent writers per entity kind
    #[arg(long, default_value_t = config::DEFAULT_WORKERS)]
    workers: usize,

    /// Load into an in-memory store instead of Neo4j
    #[arg(long)]
    dry_run: bool,

    /// Delete this pipeline's data (only) before loading
    #[arg(long, conflicts_with = "drop_all")]
    clear: bool,

    /// Delete EVERYTHING in the target store before loading (asks for confirmation)
    #[arg(long)]
    drop_all: bool,
}

#[derive(Args)]
struct DiffArgs {
    /// Environment to compare from
    #[arg(long)]
    source_env: Option<String>,

    /// Source Bolt URI, overrides the environment
    #[arg(long)]
    source_uri: Option<String>,

    #[arg(long)]
    source_user: Option<String>,

    #[arg(long)]
    source_password: Option<String>,

    /// Environment to compare against
    #[arg(long)]
    target_env: Option<String>,

    /// Target Bolt URI, overrides the environment
    #[arg(long)]
    target_uri: Option<String>,

    #[arg(long)]
    target_user: Option<String>,

    #[arg(long)]
    target_password: Option<String>,

    /// Environments file
    #[arg(long, default_value = config::DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Which labels and relationship types to compare
    #[arg(long, value_enum, default_value_t = DiffScope::ManagedOnly)]
    scope: DiffScope,

    /// Nodes sampled per label on each side (0 = counts only)
    #[arg(long, default_value_t = config::DEFAULT_SAMPLE_SIZE)]
    sample_size: usize,

    /// Write the full report as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct InspectArgs {
    /// Directory holding the dump files
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Records to read from the head of each file
    #[arg(long, default_value_t = config::DEFAULT_SAMPLE_SIZE)]
    sample: usize,

    /// Print the first record of each file
    #[arg(long)]
    show_records: bool,
}

#[derive(Args)]
struct EnvsArgs {
    /// Environments file
    #[arg(long, default_value = config::DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Write an example environments file if none exists
    #[arg(long)]
    init: bool,
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .thread_name("pwc-graph-worker")
        .enable_io()
        .enable_time()
        .build()?)
}

/// Newest `pwc-*` directory under the working directory.
fn default_data_dir() -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(".")
        .context("Failed to read working directory")?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("pwc-"))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    candidates.sort();
    match candidates.pop() {
        Some(dir) => {
            info!(dir = %dir.display(), "Using most recent data directory");
            Ok(dir)
        }
        None => bail!("no data directory given and no ./pwc-* directory found"),
    }
}

fn resolve_settings(
    env_file: &Path,
    name: Option<&str>,
    overrides: &Overrides,
) -> Result<ConnectionSettings> {
    let envs = Environments::load_optional(env_file)?;
    let settings = envs.resolve(name, overrides)?;
    for warning in settings.warnings(name.unwrap_or("default")) {
        warn!("{warning}");
    }
    Ok(settings)
}

async fn connect(settings: &ConnectionSettings) -> Result<Arc<dyn GraphStore>> {
    let store = Neo4jStore::connect(settings)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.uri))?;
    Ok(Arc::new(store))
}

fn run_ingest(args: IngestArgs) -> Result<ExitCode> {
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let files = SourceFiles::discover(&data_dir);
    if files.is_empty() {
        bail!("no dump files found in {}", data_dir.display());
    }

    let settings = resolve_settings(
        &args.env_file,
        args.connection.env.as_deref(),
        &args.connection.overrides(),
    )?;
    let options = IngestOptions {
        limits: Limits {
            papers: args.papers,
            repositories: args.repositories,
            datasets: args.datasets,
            tasks: args.tasks,
        },
        include_repositories: !args.no_repositories,
        batch_size: args.batch_size,
        workers: args.workers,
        show_progress: true,
        ..IngestOptions::default()
    };

    let rt = runtime()?;
    rt.block_on(async {
        let store: Arc<dyn GraphStore> = if args.dry_run {
            info!("Dry run, loading into memory");
            Arc::new(MemoryStore::new("dry-run"))
        } else {
            connect(&settings).await?
        };
        let engine = SyncEngine::new(store);

        if args.drop_all {
            let target = engine.store().describe();
            let confirmation =
                confirm_full_drop(&target, &mut io::stdin().lock(), &mut io::stderr())?;
            engine.drop_all(confirmation).await?;
            println!("Dropped all data in {target}");
        } else if args.clear {
            let report = engine.clear_managed().await?;
            println!();
            println!("=== Cleared ===");
            for (name, count) in report.relationships.iter().chain(&report.nodes) {
                println!("{name:<20} {count:>12}");
            }
            println!("Indexes dropped:     {}", report.indexes.len());
        }

        let report = engine.ingest(&files, &options).await?;
        print_ingest_summary(&report);
        anyhow::Ok(if report.summary.total_failed() > 0 {
            ExitCode::from(config::EXIT_FAILURE)
        } else {
            ExitCode::SUCCESS
        })
    })
}

fn print_ingest_summary(report: &IngestReport) {
    println!();
    println!("=== Summary ===");
    println!("Total time:          {:.2}s", report.elapsed.as_secs_f64());
    println!();
    println!(
        "{:<14} {:>10} {:>10} {:>10} {:>10} {:>12}",
        "Source", "read", "malformed", "rejected", "duplicate", "over limit"
    );
    for (kind, s) in &report.summary.sources {
        if s.read == 0 {
            continue;
        }
        println!(
            "{:<14} {:>10} {:>10} {:>10} {:>10} {:>12}",
            kind.name(),
            s.read,
            s.malformed,
            s.rejected,
            s.duplicates,
            s.beyond_limit
        );
    }
    println!();
    println!(
        "{:<16} {:>10} {:>10} {:>10} {:>10} {:>12}",
        "Target", "written", "unmatched", "failed", "retries", "now in store"
    );
    for (name, w) in &report.summary.targets {
        let total = report
            .counts_after
            .iter()
            .find(|(n, _)| *n == name.as_str())
            .map_or(0, |(_, c)| *c);
        println!(
            "{:<16} {:>10} {:>10} {:>10} {:>10} {:>12}",
            name, w.written, w.unmatched, w.failed, w.retried, total
        );
    }
    if !report.summary.failures.is_empty() {
        println!();
        println!("Failed rows (first {}):", report.summary.failures.len());
        for failure in &report.summary.failures {
            println!("  {failure}");
        }
    }
}

fn run_diff(args: DiffArgs) -> Result<ExitCode> {
    let source = resolve_settings(
        &args.env_file,
        args.source_env.as_deref(),
        &Overrides {
            uri: args.source_uri,
            user: args.source_user,
            password: args.source_password,
        },
    )?;
    let target = resolve_settings(
        &args.env_file,
        args.target_env.as_deref(),
        &Overrides {
            uri: args.target_uri,
            user: args.target_user,
            password: args.target_password,
        },
    )?;
    if source.uri == target.uri && source.user == target.user {
        warn!(uri = %source.uri, "Source and target are the same instance");
    }
    let options = DiffOptions {
        scope: args.scope,
        sample_size: args.sample_size,
    };

    let rt = runtime()?;
    let report = rt.block_on(async {
        let source = connect(&source).await?;
        let target = connect(&target).await?;
        anyhow::Ok(diff::compare(&*source, &*target, &options).await)
    })?;

    print!("{}", report.render());
    if let Some(path) = &args.output {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    Ok(if report.identical {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(config::EXIT_DIFFERENT)
    })
}

fn run_inspect(args: InspectArgs) -> Result<ExitCode> {
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    println!("Data directory: {}", data_dir.display());
    for report in inspect::inspect_dir(&data_dir, args.sample) {
        println!();
        let Some(path) = &report.path else {
            println!("{:<12} missing", report.kind.name());
            continue;
        };
        println!("{:<12} {}", report.kind.name(), path.display());
        if let Some(e) = &report.error {
            println!("  error:       {e}");
            continue;
        }
        if let (Some(layout), Some(compression)) = (report.layout, report.compression) {
            println!("  layout:      {layout:?} ({compression:?})");
        }
        println!(
            "  sampled:     {} ({} malformed, {} loadable)",
            report.sampled, report.malformed, report.accepted
        );
        let fields: Vec<&str> = report.fields.iter().map(String::as_str).collect();
        println!("  fields:      {}", fields.join(", "));
        if args.show_records {
            if let Some(record) = &report.first_record {
                println!("  first record:");
                println!("{}", serde_json::to_string_pretty(record)?);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_envs(args: EnvsArgs) -> Result<ExitCode> {
    if args.init {
        if args.env_file.exists() {
            bail!("{} already exists", args.env_file.display());
        }
        fs::write(&args.env_file, EXAMPLE_ENVIRONMENTS)
            .with_context(|| format!("Failed to write {}", args.env_file.display()))?;
        println!("Wrote example environments to {}", args.env_file.display());
        return Ok(ExitCode::SUCCESS);
    }

    let envs = Environments::load(&args.env_file)?;
    if envs.is_empty() {
        println!("No environments defined in {}", args.env_file.display());
        return Ok(ExitCode::SUCCESS);
    }
    for (name, settings) in envs.iter() {
        let description = settings.description.as_deref().unwrap_or("");
        println!("{name:<16} {:<32} {description}", settings.uri);
    }
    let warnings = envs.warnings();
    println!();
    if warnings.is_empty() {
        println!("All environments valid");
    }
    for w in &warnings {
        println!("warning: {w}");
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let result = match cli.command {
        Commands::Ingest(args) => run_ingest(args),
        Commands::Diff(args) => run_diff(args),
        Commands::Inspect(args) => run_inspect(args),
        Commands::Envs(args) => run_envs(args),
    };

    match result {
        Ok(code) => {
            info!("Completed");
            code
        }
        Err(e) => {
            if e
                .downcast_ref::<SyncError>()
                .is_some_and(SyncError::is_cancellation)
            {
                eprintln!("\nCancelled, nothing was deleted.");
            } else {
                error!("Error: {:#}", e);
                eprintln!("Error: {:#}", e);
            }
            ExitCode::from(config::EXIT_FAILURE)
        }
    }
}
