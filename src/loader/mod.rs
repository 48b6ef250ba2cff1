//! Source loaders: enumerate corpus units and fetch their bytes.
//!
//! A loader produces a deterministic sequence of [`UnitDescriptor`]s that can
//! be restarted from any [`Cursor`]. Descriptors are cheap (no content is read
//! while enumerating, except for formats that embed content inline); bytes
//! are fetched per unit by [`SourceLoader::load`], on a worker thread.
pub mod directory;
pub mod dump;
pub mod manifest;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

use crate::parser::Language;

pub use directory::DirectoryLoader;
pub use dump::DumpLoader;
pub use manifest::ManifestLoader;

/// A unit's content could not be retrieved.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadError {
    #[error("cannot read {location}: {message}")]
    Io { location: String, message: String },

    #[error("fetch failed for {location}: {message}")]
    Fetch { location: String, message: String },

    #[error("malformed corpus entry at {location}: {message}")]
    Malformed { location: String, message: String },
}

impl LoadError {
    pub(crate) fn io(location: impl fmt::Display, err: std::io::Error) -> Self {
        LoadError::Io {
            location: location.to_string(),
            message: err.to_string(),
        }
    }
}

/// A position in a loader's enumeration; the offset of the next unit to visit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Cursor(pub u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a unit's bytes live.
#[derive(Debug, Clone)]
pub enum Location {
    File(PathBuf),
    Url(String),
    /// Content already held in memory (embedded in the corpus container).
    Inline(Arc<[u8]>),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::File(p) => write!(f, "{}", p.display()),
            Location::Url(u) => f.write_str(u),
            Location::Inline(bytes) => write!(f, "<inline {} bytes>", bytes.len()),
        }
    }
}

/// Provenance of one enumerated unit, before its content is loaded.
#[derive(Debug, Clone)]
pub struct UnitDescriptor {
    pub offset: u64,
    pub repository: String,
    pub path: String,
    pub revision: String,
    pub language: Language,
    /// Known up front when the corpus records it (git blob ids, manifests).
    pub content_hash: Option<String>,
    pub location: Location,
}

impl UnitDescriptor {
    pub fn unit_id(&self) -> String {
        unit_id(&self.repository, &self.path, &self.revision)
    }
}

pub fn unit_id(repository: &str, path: &str, revision: &str) -> String {
    format!("{repository}:{path}@{revision}")
}

/// A unit that failed during enumeration. It still occupies its offset.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub offset: u64,
    pub unit_id: String,
    pub error: LoadError,
}

/// One file under analysis, with the content-derived attributes filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub corpus_id: String,
    pub repository: String,
    pub path: String,
    pub revision: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub language: Language,
    pub offset: u64,
}

impl SourceUnit {
    pub fn new(corpus_id: &str, descriptor: &UnitDescriptor, content: &[u8]) -> Self {
        Self {
            corpus_id: corpus_id.to_string(),
            repository: descriptor.repository.clone(),
            path: descriptor.path.clone(),
            revision: descriptor.revision.clone(),
            content_hash: descriptor
                .content_hash
                .clone()
                .unwrap_or_else(|| content_hash(content)),
            byte_size: content.len() as u64,
            language: descriptor.language,
            offset: descriptor.offset,
        }
    }

    pub fn id(&self) -> String {
        unit_id(&self.repository, &self.path, &self.revision)
    }
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub type UnitStream<'a> = Box<dyn Iterator<Item = Result<UnitDescriptor, LoadFailure>> + Send + 'a>;

/// Enumerates a corpus and retrieves unit content.
///
/// Implementations must be `Send + Sync`: enumeration runs on the
/// orchestrator while `load` runs concurrently on worker threads.
pub trait SourceLoader: Send + Sync {
    /// Stable identifier of the corpus snapshot, recorded in checkpoints.
    fn corpus_id(&self) -> &str;

    /// Units with `offset >= from`, in enumeration order.
    fn units(&self, from: Cursor) -> Result<UnitStream<'_>, LoadError>;

    /// Fetch the bytes of one unit.
    fn load(&self, unit: &UnitDescriptor) -> Result<Vec<u8>, LoadError> {
        read_location(&unit.location)
    }
}

// ── Shared retrieval ─────────────────────────────────────────────────

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP: OnceLock<Result<reqwest::blocking::Client, String>> = OnceLock::new();

/// Read bytes from any [`Location`]. Blocking; call from a worker thread.
pub fn read_location(location: &Location) -> Result<Vec<u8>, LoadError> {
    match location {
        Location::File(path) => std::fs::read(path).map_err(|e| LoadError::io(path.display(), e)),
        Location::Inline(bytes) => Ok(bytes.to_vec()),
        Location::Url(url) => fetch(url),
    }
}

fn fetch(url: &str) -> Result<Vec<u8>, LoadError> {
    let fetch_err = |message: String| LoadError::Fetch {
        location: url.to_string(),
        message,
    };

    let client = HTTP
        .get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .user_agent(concat!("codecensus/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| fetch_err(e.clone()))?;

    let response = client
        .get(url)
        .send()
        .map_err(|e| fetch_err(e.to_string()))?;
    if !response.status().is_success() {
        return Err(fetch_err(format!("http status {}", response.status())));
    }
    response
        .bytes()
        .map(|b| b.to_vec())
        .map_err(|e| fetch_err(e.to_string()))
}

// ── Sharding ─────────────────────────────────────────────────────────

/// Selects a disjoint slice of a corpus by a stable hash of the unit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub index: u32,
    pub count: u32,
}

impl ShardSpec {
    pub fn contains(&self, unit_id: &str) -> bool {
        self.count <= 1 || xxh64(unit_id.as_bytes(), 0) % u64::from(self.count) == u64::from(self.index)
    }
}

/// Restricts another loader to one shard. Offsets keep their original
/// values, so cursors stay valid across the filter.
pub struct ShardedLoader {
    inner: Arc<dyn SourceLoader>,
    shard: ShardSpec,
    corpus_id: String,
}

impl ShardedLoader {
    pub fn new(inner: Arc<dyn SourceLoader>, shard: ShardSpec) -> Self {
        let corpus_id = format!(
            "{}#shard{}of{}",
            inner.corpus_id(),
            shard.index,
            shard.count
        );
        Self {
            inner,
            shard,
            corpus_id,
        }
    }
}

impl SourceLoader for ShardedLoader {
    fn corpus_id(&self) -> &str {
        &self.corpus_id
    }

    fn units(&self, from: Cursor) -> Result<UnitStream<'_>, LoadError> {
        let shard = self.shard;
        let stream = self.inner.units(from)?;
        Ok(Box::new(stream.filter(move |item| match item {
            Ok(unit) => shard.contains(&unit.unit_id()),
            Err(failure) => shard.contains(&failure.unit_id),
        })))
    }

    fn load(&self, unit: &UnitDescriptor) -> Result<Vec<u8>, LoadError> {
        self.inner.load(unit)
    }
}

// ── Construction from configuration ──────────────────────────────────

/// Container formats a corpus location can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusFormat {
    #[default]
    Directory,
    Manifest,
    Dump,
}

impl std::str::FromStr for CorpusFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directory" | "dir" => Ok(CorpusFormat::Directory),
            "manifest" => Ok(CorpusFormat::Manifest),
            "dump" => Ok(CorpusFormat::Dump),
            other => Err(format!("unknown corpus format: {other}")),
        }
    }
}

/// Build the loader for a corpus location.
pub fn open_loader(
    location: &Path,
    format: CorpusFormat,
    language: Option<Language>,
    include: &[String],
    exclude: &[String],
    shard: Option<ShardSpec>,
) -> Result<Arc<dyn SourceLoader>, LoadError> {
    let loader: Arc<dyn SourceLoader> = match format {
        CorpusFormat::Directory => Arc::new(
            DirectoryLoader::new(location)
                .with_language(language)
                .with_patterns(include, exclude)?,
        ),
        CorpusFormat::Manifest => Arc::new(ManifestLoader::new(location).with_language(language)),
        CorpusFormat::Dump => Arc::new(DumpLoader::new(location).with_language(language)),
    };

    Ok(match shard {
        Some(spec) if spec.count > 1 => Arc::new(ShardedLoader::new(loader, spec)),
        _ => loader,
    })
}
