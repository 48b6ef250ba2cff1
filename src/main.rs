use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use codecensus::aggregate::AggregateTable;
use codecensus::aggregate::export::write_csv;
use codecensus::config::RunConfig;
use codecensus::loader::{CorpusFormat, ShardSpec};
use codecensus::parser::Language;
use codecensus::pipeline::{Orchestrator, RunReport};
use codecensus::store::{CheckpointStore, ResumeFrom, SqliteStore};

#[derive(Parser)]
#[command(name = "codecensus")]
#[command(about = "Corpus-scale code usage statistics with resumable checkpoints")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a corpus and aggregate its facts
    Scan(ScanArgs),

    /// Write the aggregate table of a checkpoint as CSV
    Export {
        #[arg(long, default_value = "./census.db")]
        db: PathBuf,

        /// Checkpoint id or "latest"
        #[arg(long, default_value = "latest")]
        checkpoint: String,

        /// Output file (stdout when omitted)
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// Merge the latest aggregates of several shard databases into one CSV
    Merge {
        #[arg(required = true)]
        dbs: Vec<PathBuf>,

        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// List the checkpoints of a database
    Checkpoints {
        #[arg(long, default_value = "./census.db")]
        db: PathBuf,
    },
}

#[derive(clap::Args)]
struct ScanArgs {
    /// JSON configuration file; flags below override its values
    #[arg(long, short, default_value = "census.json")]
    config: PathBuf,

    /// Corpus location (directory, manifest file or dump)
    #[arg(long)]
    corpus: Option<PathBuf>,

    #[arg(long)]
    format: Option<CorpusFormat>,

    #[arg(long)]
    language: Option<Language>,

    #[arg(long)]
    parallelism: Option<usize>,

    /// Per-unit timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Checkpoint database
    #[arg(long)]
    db: Option<PathBuf>,

    /// Resume from a checkpoint id or "latest"
    #[arg(long)]
    resume: Option<String>,

    #[arg(long)]
    retry_failed: bool,

    #[arg(long)]
    max_units: Option<u64>,

    /// Process one shard of the corpus, as "index/count"
    #[arg(long, value_parser = parse_shard)]
    shard: Option<ShardSpec>,

    /// Write the report, including failed units, as JSON
    #[arg(long)]
    failures: Option<PathBuf>,

    #[arg(long)]
    no_progress: bool,
}

fn parse_shard(s: &str) -> Result<ShardSpec, String> {
    let (index, count) = s
        .split_once('/')
        .ok_or_else(|| format!("expected index/count, got {s}"))?;
    let index = index.trim().parse().map_err(|e| format!("bad shard index: {e}"))?;
    let count = count.trim().parse().map_err(|e| format!("bad shard count: {e}"))?;
    Ok(ShardSpec { index, count })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scan(args) => scan(args).await,
        Commands::Export { db, checkpoint, out } => export(&db, &checkpoint, out.as_deref()),
        Commands::Merge { dbs, out } => merge(&dbs, out.as_deref()),
        Commands::Checkpoints { db } => list_checkpoints(&db),
    }
}

fn apply_overrides(config: &mut RunConfig, args: &ScanArgs) {
    if let Some(corpus) = &args.corpus {
        config.corpus.location = corpus.clone();
    }
    if let Some(format) = args.format {
        config.corpus.format = format;
    }
    if args.language.is_some() {
        config.language = args.language;
    }
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism;
    }
    if let Some(timeout) = args.timeout {
        config.unit_timeout_secs = timeout;
    }
    if let Some(db) = &args.db {
        config.checkpoint.path = db.clone();
    }
    if args.resume.is_some() {
        config.resume = args.resume.clone();
    }
    if args.retry_failed {
        config.retry_failed = true;
    }
    if args.max_units.is_some() {
        config.max_units = args.max_units;
    }
    if args.shard.is_some() {
        config.shard = args.shard;
    }
}

async fn scan(args: ScanArgs) -> Result<()> {
    let mut config = RunConfig::load(&args.config)?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let loader = config.open_loader()?;
    let store = config.open_store()?;
    info!(
        "Scanning {} ({}) with {} workers",
        loader.corpus_id(),
        config.checkpoint.path.display(),
        config.parallelism
    );

    let mut orchestrator = Orchestrator::new(
        loader,
        config.parser(),
        config.extractor()?,
        Box::new(store),
        config.run_options()?,
    );
    if !args.no_progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {pos} units [{elapsed_precise}] {per_sec}")
                .context("invalid progress template")?,
        );
        bar.enable_steady_tick(Duration::from_millis(200));
        orchestrator = orchestrator.with_progress(bar);
    }

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight units and checkpointing");
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await?;
    println!("{report}");
    if let Some(path) = &args.failures {
        write_report(&report, path)?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}

fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    let json = serde_json::json!({
        "report": report,
        "failed_units": report.failed_units(),
    });
    let data = serde_json::to_string_pretty(&json).context("failed to serialize report")?;
    std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}

fn open_existing(db: &Path) -> Result<SqliteStore> {
    anyhow::ensure!(db.exists(), "checkpoint database not found: {}", db.display());
    SqliteStore::open(db).with_context(|| format!("cannot open {}", db.display()))
}

fn write_table(table: &AggregateTable, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            write_csv(table, file)?;
            info!("Wrote {} rows to {}", table.len(), path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            write_csv(table, &mut lock)?;
            lock.flush()?;
        }
    }
    Ok(())
}

fn export(db: &Path, checkpoint: &str, out: Option<&Path>) -> Result<()> {
    let store = open_existing(db)?;
    let from: ResumeFrom = checkpoint.parse().map_err(anyhow::Error::msg)?;
    let token = store
        .resolve(from)?
        .with_context(|| format!("no checkpoints in {}", db.display()))?;
    let snapshot = store.load(token)?;
    write_table(&snapshot.table, out)
}

fn merge(dbs: &[PathBuf], out: Option<&Path>) -> Result<()> {
    let mut merged = AggregateTable::new();
    for db in dbs {
        let table = open_existing(db)?.latest_aggregates()?;
        info!("{}: {} entries", db.display(), table.len());
        merged.merge(&table);
    }
    write_table(&merged, out)
}

fn list_checkpoints(db: &Path) -> Result<()> {
    let store = open_existing(db)?;
    for info in store.list()? {
        println!(
            "{}\t{}\t{}\tcursor={}\tunits={}",
            info.token,
            info.created_at.to_rfc3339(),
            info.corpus_id,
            info.cursor,
            info.units
        );
    }
    Ok(())
}
