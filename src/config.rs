/// Configuration for a census run.
///
/// Loaded from a JSON file; every field has a default so a partial (or
/// missing) file still yields a usable configuration. CLI flags are applied
/// on top by the binary.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::extractor::{DetectorRegistry, ExtractOptions, FactExtractor};
use crate::loader::{self, CorpusFormat, ShardSpec, SourceLoader};
use crate::parser::{Language, ParseOptions, ParserAdapter};
use crate::pipeline::RunOptions;
use crate::store::{ResumeFrom, SqliteStore};

// ── Default value functions ──────────────────────────────────────────

fn default_location() -> PathBuf {
    PathBuf::from(".")
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn default_unit_timeout_secs() -> u64 {
    30
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./census.db")
}

fn default_every_units() -> u64 {
    500
}

fn default_every_secs() -> u64 {
    60
}

fn default_retain() -> usize {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_aggregate_shards() -> usize {
    64
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub corpus: CorpusConfig,

    /// Restrict the run to one language; otherwise detected per unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,

    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Checkpoint id, or `"latest"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,

    #[serde(default)]
    pub retry_failed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_units: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSpec>,

    #[serde(default)]
    pub parse: ParseOptions,

    #[serde(default)]
    pub extract: ExtractOptions,

    #[serde(default = "default_aggregate_shards")]
    pub aggregate_shards: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CorpusConfig {
    #[serde(default = "default_location")]
    pub location: PathBuf,

    #[serde(default)]
    pub format: CorpusFormat,

    /// Glob patterns, directory corpora only.
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// Settled units between checkpoints; 0 disables.
    #[serde(default = "default_every_units")]
    pub every_units: u64,

    /// Seconds between checkpoints; 0 disables.
    #[serde(default = "default_every_secs")]
    pub every_secs: u64,

    /// Snapshots kept in the database; 0 keeps all.
    #[serde(default = "default_retain")]
    pub retain: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            corpus: CorpusConfig::default(),
            language: None,
            parallelism: default_parallelism(),
            unit_timeout_secs: default_unit_timeout_secs(),
            checkpoint: CheckpointConfig::default(),
            resume: None,
            retry_failed: false,
            max_units: None,
            shard: None,
            parse: ParseOptions::default(),
            extract: ExtractOptions::default(),
            aggregate_shards: default_aggregate_shards(),
        }
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            location: default_location(),
            format: CorpusFormat::default(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            every_units: default_every_units(),
            every_secs: default_every_secs(),
            retain: default_retain(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl RunConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults. A file that is not valid JSON is
    /// reported and replaced by the defaults as well.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;

        let cfg: RunConfig = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {}: {e}", path.display());
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.parallelism > 0, "parallelism must be positive");
        anyhow::ensure!(self.unit_timeout_secs > 0, "unit_timeout_secs must be positive");
        anyhow::ensure!(self.aggregate_shards > 0, "aggregate_shards must be positive");
        anyhow::ensure!(self.parse.max_depth > 0, "parse.max_depth must be positive");
        anyhow::ensure!(
            self.extract.max_facts_per_unit > 0,
            "extract.max_facts_per_unit must be positive"
        );
        if let Some(shard) = self.shard {
            anyhow::ensure!(shard.count > 0, "shard.count must be positive");
            anyhow::ensure!(
                shard.index < shard.count,
                "shard.index must be below shard.count"
            );
        }
        if let Some(resume) = &self.resume {
            resume.parse::<ResumeFrom>().map_err(anyhow::Error::msg)?;
        }
        if let Some(names) = &self.extract.detectors {
            DetectorRegistry::builtin()?.select(names)?;
        }
        Ok(())
    }

    pub fn resume_from(&self) -> Result<Option<ResumeFrom>> {
        self.resume
            .as_deref()
            .map(|s| s.parse::<ResumeFrom>().map_err(anyhow::Error::msg))
            .transpose()
    }

    pub fn run_options(&self) -> Result<RunOptions> {
        Ok(RunOptions {
            parallelism: self.parallelism,
            unit_timeout: Duration::from_secs(self.unit_timeout_secs),
            checkpoint_every_units: self.checkpoint.every_units,
            checkpoint_every: (self.checkpoint.every_secs > 0)
                .then(|| Duration::from_secs(self.checkpoint.every_secs)),
            max_retries: self.checkpoint.max_retries,
            retry_backoff: Duration::from_millis(self.checkpoint.backoff_ms),
            resume: self.resume_from()?,
            retry_failed: self.retry_failed,
            max_units: self.max_units,
            aggregate_shards: self.aggregate_shards,
        })
    }

    pub fn open_loader(&self) -> Result<Arc<dyn SourceLoader>> {
        loader::open_loader(
            &self.corpus.location,
            self.corpus.format,
            self.language,
            &self.corpus.include,
            &self.corpus.exclude,
            self.shard,
        )
        .with_context(|| format!("cannot open corpus {}", self.corpus.location.display()))
    }

    pub fn parser(&self) -> ParserAdapter {
        ParserAdapter::new(self.parse.clone())
    }

    pub fn extractor(&self) -> Result<FactExtractor> {
        Ok(FactExtractor::new(
            self.extract.clone(),
            DetectorRegistry::builtin()?,
        )?)
    }

    pub fn open_store(&self) -> Result<SqliteStore> {
        let store = SqliteStore::open(&self.checkpoint.path).with_context(|| {
            format!(
                "cannot open checkpoint database {}",
                self.checkpoint.path.display()
            )
        })?;
        Ok(store.with_retain(self.checkpoint.retain))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
