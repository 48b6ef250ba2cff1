/// JSON-lines corpus manifest loader.
///
/// One entry per line:
///
/// ```json
/// {"repository": "psf/requests", "path": "src/api.py", "revision": "a1b2c3",
///  "location": "https://raw.example.org/psf/requests/a1b2c3/src/api.py",
///  "content_hash": "…"}
/// ```
///
/// `location` may be an `http(s)://` URL, an absolute path, or a path relative
/// to the manifest file; it defaults to `<repository>/<path>` next to the
/// manifest. Blank lines are ignored but keep their offset.
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::{Cursor, LoadError, LoadFailure, Location, SourceLoader, UnitDescriptor, UnitStream};
use crate::parser::Language;

fn default_revision() -> String {
    "HEAD".to_string()
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    repository: String,
    path: String,
    #[serde(default = "default_revision")]
    revision: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    language: Option<Language>,
}

pub struct ManifestLoader {
    manifest: PathBuf,
    base_dir: PathBuf,
    corpus_id: String,
    language: Option<Language>,
}

impl ManifestLoader {
    pub fn new<P: AsRef<Path>>(manifest: P) -> Self {
        let manifest = manifest.as_ref().to_path_buf();
        let base_dir = manifest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let corpus_id = format!("manifest:{}", manifest.to_string_lossy().replace('\\', "/"));
        Self {
            manifest,
            base_dir,
            corpus_id,
            language: None,
        }
    }

    pub fn with_language(mut self, language: Option<Language>) -> Self {
        self.language = language;
        self
    }

    fn resolve_location(&self, entry: &ManifestEntry) -> Location {
        match entry.location.as_deref() {
            Some(loc) if loc.starts_with("http://") || loc.starts_with("https://") => {
                Location::Url(loc.to_string())
            }
            Some(loc) => {
                let path = Path::new(loc);
                if path.is_absolute() {
                    Location::File(path.to_path_buf())
                } else {
                    Location::File(self.base_dir.join(path))
                }
            }
            None => Location::File(self.base_dir.join(&entry.repository).join(&entry.path)),
        }
    }

    /// Turn one manifest line into a descriptor. `Ok(None)` means the line is
    /// blank or its language is filtered out.
    fn parse_line(&self, offset: u64, line: &str) -> Result<Option<UnitDescriptor>, LoadFailure> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let entry: ManifestEntry =
            serde_json::from_str(trimmed).map_err(|e| self.malformed(offset, e.to_string()))?;

        let language = match entry
            .language
            .or_else(|| Language::from_path(Path::new(&entry.path)))
            .or(self.language)
        {
            Some(l) => l,
            None => return Ok(None),
        };
        if self.language.is_some_and(|l| l != language) {
            return Ok(None);
        }

        Ok(Some(UnitDescriptor {
            offset,
            location: self.resolve_location(&entry),
            repository: entry.repository,
            path: entry.path,
            revision: entry.revision,
            language,
            content_hash: entry.content_hash,
        }))
    }

    fn malformed(&self, offset: u64, message: String) -> LoadFailure {
        let location = format!("{}#{}", self.manifest.display(), offset + 1);
        LoadFailure {
            offset,
            unit_id: location.clone(),
            error: LoadError::Malformed { location, message },
        }
    }
}

impl SourceLoader for ManifestLoader {
    fn corpus_id(&self) -> &str {
        &self.corpus_id
    }

    fn units(&self, from: Cursor) -> Result<UnitStream<'_>, LoadError> {
        let file = File::open(&self.manifest).map_err(|e| LoadError::io(self.manifest.display(), e))?;
        let lines = BufReader::new(file).lines();

        Ok(Box::new(
            lines
                .enumerate()
                .skip(from.0 as usize)
                .filter_map(move |(i, line)| {
                    let offset = i as u64;
                    match line {
                        Ok(line) => self.parse_line(offset, &line).transpose(),
                        Err(e) => Some(Err(self.malformed(offset, e.to_string()))),
                    }
                }),
        ))
    }
}
