use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{Cursor, LoadError, Location, SourceLoader, UnitDescriptor, UnitStream};
use crate::parser::Language;

const WORKING_TREE: &str = "working-tree";

/// Corpus laid out on disk as `<root>/<repository>/<path...>`.
///
/// Files directly under the root belong to a repository named after the
/// root directory itself. Walking respects `.gitignore` files.
pub struct DirectoryLoader {
    root: PathBuf,
    corpus_id: String,
    language: Option<Language>,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl DirectoryLoader {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let corpus_id = format!("dir:{}", normalize(&root));
        Self {
            root,
            corpus_id,
            language: None,
            include: None,
            exclude: None,
        }
    }

    /// Only enumerate files of `language` (all supported languages if `None`).
    pub fn with_language(mut self, language: Option<Language>) -> Self {
        self.language = language;
        self
    }

    /// Glob filters over root-relative paths. An empty include list keeps all.
    pub fn with_patterns(mut self, include: &[String], exclude: &[String]) -> Result<Self, LoadError> {
        self.include = build_globset(include)?;
        self.exclude = build_globset(exclude)?;
        Ok(self)
    }

    fn root_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string())
    }

    /// Candidate files, root-relative, walked lazily in path order.
    /// Entries of each directory are visited sorted by name, which orders
    /// the whole walk the same way sorting the relative paths would.
    fn candidate_files(&self) -> impl Iterator<Item = (PathBuf, Language)> + Send + '_ {
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        walker.filter_map(move |entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("skipping unreadable entry under {}: {e}", self.root.display());
                    return None;
                }
            };
            if entry.file_type().is_some_and(|t| t.is_dir()) {
                return None;
            }
            let path = entry.path();
            let language = Language::from_path(path)?;
            if self.language.is_some_and(|l| l != language) {
                return None;
            }
            let relative = path.strip_prefix(&self.root).ok()?;
            if let Some(include) = &self.include {
                if !include.is_match(relative) {
                    return None;
                }
            }
            if let Some(exclude) = &self.exclude {
                if exclude.is_match(relative) {
                    return None;
                }
            }
            Some((relative.to_path_buf(), language))
        })
    }

    fn describe(&self, offset: u64, relative: &Path, language: Language) -> UnitDescriptor {
        let rel = normalize(relative);
        let (repository, path) = match rel.split_once('/') {
            Some((repo, rest)) => (repo.to_string(), rest.to_string()),
            None => (self.root_name(), rel.clone()),
        };
        UnitDescriptor {
            offset,
            repository,
            path,
            revision: WORKING_TREE.to_string(),
            language,
            content_hash: None,
            location: Location::File(self.root.join(relative)),
        }
    }
}

impl SourceLoader for DirectoryLoader {
    fn corpus_id(&self) -> &str {
        &self.corpus_id
    }

    fn units(&self, from: Cursor) -> Result<UnitStream<'_>, LoadError> {
        if !self.root.is_dir() {
            return Err(LoadError::Io {
                location: self.root.display().to_string(),
                message: "corpus directory does not exist".to_string(),
            });
        }
        debug!("walking {} from offset {from}", self.root.display());
        Ok(Box::new(
            self.candidate_files()
                .enumerate()
                .skip(from.0 as usize)
                .map(move |(i, (relative, language))| Ok(self.describe(i as u64, &relative, language))),
        ))
    }
}

/// Forward slashes regardless of platform, so ids are portable.
fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, LoadError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| LoadError::Malformed {
            location: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map(Some).map_err(|e| LoadError::Malformed {
        location: patterns.join(","),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn corpus() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("repo_a/pkg")).unwrap();
        fs::create_dir_all(root.join("repo_b")).unwrap();
        fs::write(root.join("repo_a/pkg/mod.py"), "import os\n").unwrap();
        fs::write(root.join("repo_a/setup.py"), "x = 1\n").unwrap();
        fs::write(root.join("repo_b/app.js"), "require('fs');\n").unwrap();
        fs::write(root.join("repo_b/notes.md"), "# notes\n").unwrap();
        fs::write(root.join("loose.py"), "pass\n").unwrap();
        dir
    }

    #[test]
    fn test_enumerates_sorted_supported_files() {
        let dir = corpus();
        let loader = DirectoryLoader::new(dir.path());
        let ids: Vec<String> = loader
            .units(Cursor::START)
            .unwrap()
            .map(|u| u.unwrap().unit_id())
            .collect();

        let root_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(
            ids,
            vec![
                format!("{root_name}:loose.py@working-tree"),
                "repo_a:pkg/mod.py@working-tree".to_string(),
                "repo_a:setup.py@working-tree".to_string(),
                "repo_b:app.js@working-tree".to_string(),
            ]
        );
    }

    #[test]
    fn test_language_and_glob_filters() {
        let dir = corpus();
        let loader = DirectoryLoader::new(dir.path())
            .with_language(Some(Language::Python))
            .with_patterns(&["repo_a/**".to_string()], &["**/setup.py".to_string()])
            .unwrap();
        let paths: Vec<String> = loader
            .units(Cursor::START)
            .unwrap()
            .map(|u| u.unwrap().path)
            .collect();
        assert_eq!(paths, vec!["pkg/mod.py"]);
    }

    #[test]
    fn test_resume_and_load() {
        let dir = corpus();
        let loader = DirectoryLoader::new(dir.path());
        let units: Vec<UnitDescriptor> = loader
            .units(Cursor(1))
            .unwrap()
            .map(|u| u.unwrap())
            .collect();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].offset, 1);
        assert_eq!(loader.load(&units[0]).unwrap(), b"import os\n");
    }

    #[test]
    fn test_walk_order_matches_sorted_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/z")).unwrap();
        for file in ["a.py", "a-b.py", "a/z/y.py", "a/b.py", "B.py", "a/c.js"] {
            fs::write(root.join(file), "x = 1\n").unwrap();
        }

        let walked: Vec<PathBuf> = DirectoryLoader::new(root)
            .units(Cursor::START)
            .unwrap()
            .map(|u| match u.unwrap().location {
                Location::File(path) => path.strip_prefix(root).unwrap().to_path_buf(),
                other => panic!("unexpected location {other}"),
            })
            .collect();
        let mut sorted = walked.clone();
        sorted.sort();
        assert_eq!(walked, sorted);
        assert_eq!(walked.len(), 6);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let loader = DirectoryLoader::new("/definitely/not/here");
        assert!(loader.units(Cursor::START).is_err());
    }
}
