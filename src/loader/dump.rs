use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, OnceLock};
use tracing::{debug, warn};

use super::{Cursor, LoadError, LoadFailure, Location, SourceLoader, UnitDescriptor, UnitStream};
use crate::parser::Language;

/// Characters of preamble before the first record of a dump file.
const PREAMBLE_CHARS: usize = 30;
const DUMP_REVISION: &str = "dump";

static RECORD_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"",false,\d+"#).expect("valid separator regex"));
static RECORD_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([a-z0-9]{40}),\d+,""#).expect("valid header regex"));

/// Loader for raw repository text dumps.
///
/// A dump is a single text file (or a directory of `*.txt` files) holding
/// many source blobs back to back:
///
/// ```text
/// <30 chars preamble><blob id>,<size>,"<content with "" for ">",false,<n>...
/// ```
///
/// Every blob becomes one unit whose path and content hash are the blob id,
/// 40 lowercase ASCII letters or digits; the repository is the dump file
/// stem. Offsets run across all dump files in sorted order. Records without
/// a recognizable header still consume an offset so that cursors stay
/// stable.
///
/// The dump is split on the first enumeration and the records are kept, so
/// later enumerations (a resume in the same process) do not read it again.
pub struct DumpLoader {
    location: PathBuf,
    corpus_id: String,
    language: Option<Language>,
    records: OnceLock<Vec<Result<UnitDescriptor, LoadFailure>>>,
}

impl DumpLoader {
    pub fn new<P: AsRef<Path>>(location: P) -> Self {
        let location = location.as_ref().to_path_buf();
        let corpus_id = format!("dump:{}", location.to_string_lossy().replace('\\', "/"));
        Self {
            location,
            corpus_id,
            language: None,
            records: OnceLock::new(),
        }
    }

    /// Language to tag blobs with. Dumps carry no file names, so this
    /// defaults to Python.
    pub fn with_language(mut self, language: Option<Language>) -> Self {
        self.language = language;
        self
    }

    fn dump_files(&self) -> Result<Vec<PathBuf>, LoadError> {
        if self.location.is_file() {
            return Ok(vec![self.location.clone()]);
        }
        let entries = std::fs::read_dir(&self.location).map_err(|e| LoadError::io(self.location.display(), e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Split one dump file into units, advancing `next_offset` once per record.
    fn read_dump(&self, path: &Path, next_offset: &mut u64) -> Vec<Result<UnitDescriptor, LoadFailure>> {
        let repository = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "dump".to_string());

        let raw = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot read dump {}: {e}", path.display());
                let offset = *next_offset;
                *next_offset += 1;
                return vec![Err(LoadFailure {
                    offset,
                    unit_id: format!("{repository}:*@{DUMP_REVISION}"),
                    error: LoadError::io(path.display(), e),
                })];
            }
        };
        let content = String::from_utf8_lossy(&raw).replace('\0', "");
        let body = content
            .char_indices()
            .nth(PREAMBLE_CHARS)
            .map(|(i, _)| &content[i..])
            .unwrap_or("");

        let language = self.language.unwrap_or(Language::Python);
        let mut units = Vec::new();
        for record in RECORD_SEPARATOR.split(body) {
            let offset = *next_offset;
            *next_offset += 1;
            let Some((blob_id, code)) = split_record(record) else {
                continue;
            };
            units.push(Ok(UnitDescriptor {
                offset,
                repository: repository.clone(),
                path: blob_id.to_string(),
                revision: DUMP_REVISION.to_string(),
                language,
                content_hash: Some(blob_id.to_string()),
                location: Location::Inline(Arc::from(code.into_bytes())),
            }));
        }
        debug!("{}: {} records", path.display(), units.len());
        units
    }
}

/// Blob id and unescaped content of one record, if it has a header.
/// Anything before the header (record-separator residue) is dropped.
fn split_record(record: &str) -> Option<(&str, String)> {
    let header = RECORD_HEADER.captures(record)?;
    let whole = header.get(0)?;
    let blob_id = header.get(1)?.as_str();
    Some((blob_id, record[whole.end()..].replace("\"\"", "\"")))
}

impl SourceLoader for DumpLoader {
    fn corpus_id(&self) -> &str {
        &self.corpus_id
    }

    fn units(&self, from: Cursor) -> Result<UnitStream<'_>, LoadError> {
        let records = match self.records.get() {
            Some(records) => records,
            None => {
                let mut next_offset = 0u64;
                let mut split = Vec::new();
                for path in self.dump_files()? {
                    split.extend(self.read_dump(&path, &mut next_offset));
                }
                self.records.get_or_init(|| split)
            }
        };
        Ok(Box::new(
            records
                .iter()
                .filter(move |item| {
                    let offset = match item {
                        Ok(unit) => unit.offset,
                        Err(failure) => failure.offset,
                    };
                    offset >= from.0
                })
                .cloned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const ID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const ID_B: &str = "0123456789abcdef0123456789abcdef01234567";

    fn dump_text() -> String {
        format!(
            "{}{ID_A},17,\"print(\"\"hi\"\")\n\",false,1\n{ID_B},5,\"x = 1\",false,2",
            "p".repeat(PREAMBLE_CHARS)
        )
    }

    #[test]
    fn test_split_dump_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("github.txt");
        fs::write(&path, dump_text()).unwrap();

        let loader = DumpLoader::new(&path);
        let units: Vec<UnitDescriptor> = loader
            .units(Cursor::START)
            .unwrap()
            .map(|u| u.unwrap())
            .collect();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].repository, "github");
        assert_eq!(units[0].path, ID_A);
        assert_eq!(units[0].content_hash.as_deref(), Some(ID_A));
        assert_eq!(units[0].language, Language::Python);
        assert_eq!(loader.load(&units[0]).unwrap(), b"print(\"hi\")\n");
        assert_eq!(units[1].path, ID_B);
        assert_eq!(loader.load(&units[1]).unwrap(), b"x = 1");
    }

    #[test]
    fn test_offsets_span_files_and_resume() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), dump_text()).unwrap();
        fs::write(dir.path().join("b.txt"), dump_text()).unwrap();
        fs::write(dir.path().join("ignored.csv"), "nope").unwrap();

        let loader = DumpLoader::new(dir.path());
        let all: Vec<(String, u64)> = loader
            .units(Cursor::START)
            .unwrap()
            .map(|u| u.unwrap())
            .map(|u| (u.repository, u.offset))
            .collect();
        // each file has two records plus the empty tail after the last separator
        assert_eq!(
            all,
            vec![
                ("a".to_string(), 0),
                ("a".to_string(), 1),
                ("b".to_string(), 3),
                ("b".to_string(), 4),
            ]
        );

        let resumed: Vec<u64> = loader
            .units(Cursor(2))
            .unwrap()
            .map(|u| u.unwrap().offset)
            .collect();
        assert_eq!(resumed, vec![3, 4]);
    }

    #[test]
    fn test_false_inside_content_does_not_split() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("many.txt");
        let ids = [ID_A, ID_B, "ffffffffffffffffffffffffffffffffffffffff"];
        let bodies = [
            "flags = [1,false,2]\n",
            "print(\"\",false,\"\")\n",
            "x = {\"\"on\"\": false, \"\"n\"\": 3}\n",
        ];
        let mut text = "p".repeat(PREAMBLE_CHARS);
        for (i, (id, body)) in ids.iter().zip(bodies).enumerate() {
            text.push_str(&format!("{id},{},\"{body}\",false,{i}\n", body.len()));
        }
        fs::write(&path, text).unwrap();

        let loader = DumpLoader::new(&path);
        let units: Vec<UnitDescriptor> = loader
            .units(Cursor::START)
            .unwrap()
            .map(|u| u.unwrap())
            .collect();
        let paths: Vec<&str> = units.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, ids);
        assert_eq!(loader.load(&units[0]).unwrap(), b"flags = [1,false,2]\n");
        assert_eq!(loader.load(&units[1]).unwrap(), b"print(\",false,\")\n");
        assert_eq!(loader.load(&units[2]).unwrap(), b"x = {\"on\": false, \"n\": 3}\n");
    }

    #[test]
    fn test_records_are_split_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("once.txt");
        fs::write(&path, dump_text()).unwrap();
        let loader = DumpLoader::new(&path);
        assert_eq!(loader.units(Cursor::START).unwrap().count(), 2);

        fs::remove_file(&path).unwrap();
        let resumed: Vec<u64> = loader
            .units(Cursor(1))
            .unwrap()
            .map(|u| u.unwrap().offset)
            .collect();
        assert_eq!(resumed, vec![1]);
    }

    #[test]
    fn test_nul_bytes_are_stripped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.txt");
        fs::write(&path, dump_text().replace("x = 1", "x\0 = 1")).unwrap();
        let loader = DumpLoader::new(&path);
        let last = loader.units(Cursor::START).unwrap().last().unwrap().unwrap();
        assert_eq!(loader.load(&last).unwrap(), b"x = 1");
    }
}
