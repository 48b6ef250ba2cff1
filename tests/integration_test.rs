/// End-to-end tests for a census run.
///
/// Covers the complete flow:
///   Corpus on disk → Loader → Parser → Extractor → Aggregation → Checkpoint → Export
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use codecensus::aggregate::AggregateTable;
use codecensus::aggregate::export::{read_csv, write_csv};
use codecensus::config::RunConfig;
use codecensus::extractor::{DetectorRegistry, ExtractOptions, FactExtractor, FactKind};
use codecensus::loader::{DirectoryLoader, ShardSpec, ShardedLoader, SourceLoader};
use codecensus::parser::{ParseFailure, ParseOptions, ParserAdapter};
use codecensus::pipeline::{Orchestrator, PipelineError, RunOptions, RunPhase};
use codecensus::status::{FailureKind, UnitState};
use codecensus::store::{
    CheckpointError, CheckpointInfo, CheckpointStore, CheckpointToken, ResumeFrom, Snapshot, SqliteStore,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn orchestrator(
    loader: Arc<dyn SourceLoader>,
    store: Box<dyn CheckpointStore>,
    options: RunOptions,
) -> Orchestrator {
    Orchestrator::new(
        loader,
        ParserAdapter::new(ParseOptions::default()),
        FactExtractor::new(ExtractOptions::default(), DetectorRegistry::builtin().unwrap()).unwrap(),
        store,
        options,
    )
}

fn memory_store() -> Box<dyn CheckpointStore> {
    Box::new(SqliteStore::open_in_memory().unwrap())
}

/// A store whose disk is gone: every save fails.
struct Unwritable;

impl CheckpointStore for Unwritable {
    fn save(&mut self, _snapshot: &Snapshot) -> Result<CheckpointToken, CheckpointError> {
        Err(CheckpointError::Io(std::io::Error::other("disk full")))
    }

    fn load(&self, token: CheckpointToken) -> Result<Snapshot, CheckpointError> {
        Err(CheckpointError::UnknownToken(token))
    }

    fn latest(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        Ok(None)
    }

    fn list(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        Ok(Vec::new())
    }
}

fn options(parallelism: usize) -> RunOptions {
    RunOptions {
        parallelism,
        unit_timeout: Duration::from_secs(30),
        retry_backoff: Duration::from_millis(1),
        ..RunOptions::default()
    }
}

/// Writes `count` small Python files spread over a few repositories.
fn write_corpus(root: &Path, count: usize) {
    for i in 0..count {
        let repo = root.join(format!("repo{}", i % 7));
        fs::create_dir_all(&repo).unwrap();
        let body = match i % 4 {
            0 => format!("import os\n\ndef f{i}(p):\n    if p:\n        return os.path.join(p, '{i}')\n    return None\n"),
            1 => format!("from collections import OrderedDict\n\nclass C{i}:\n    def m(self):\n        return OrderedDict()\n"),
            2 => format!("import json as j\n\nfor k in range({i}):\n    j.dumps([k for k in range(3)])\n"),
            _ => format!("try:\n    x = {i}\nexcept:\n    pass\nprint(len([x]))\n"),
        };
        fs::write(repo.join(format!("mod_{i:04}.py")), body).unwrap();
    }
}

/// Three files: empty, valid, and one with a syntax error.
#[tokio::test]
async fn test_three_file_corpus() {
    let temp_dir = tempdir().unwrap();
    let repo = temp_dir.path().join("demo");
    fs::create_dir_all(&repo).unwrap();
    fs::write(repo.join("a_empty.py"), "").unwrap();
    fs::write(repo.join("b_paths.py"), "import os\nos.path.join(\"a\", \"b\")\n").unwrap();
    fs::write(repo.join("c_broken.py"), "s = \"unterminated\n").unwrap();

    let loader: Arc<dyn SourceLoader> = Arc::new(DirectoryLoader::new(temp_dir.path()));
    let report = orchestrator(loader.clone(), memory_store(), options(2))
        .run()
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Completed);
    assert_eq!(report.succeeded, 2, "empty and valid files succeed");
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures_by_kind.get(&FailureKind::Parse), Some(&1));

    let failed = report.failed_units();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].unit_id, "demo:c_broken.py@working-tree");

    assert_eq!(report.table.count(&FactKind::Import, "os"), 1);
    assert_eq!(report.table.count(&FactKind::Call, "os.path.join"), 1);

    // the empty file contributes nothing and the valid one exactly its facts
    let parser = ParserAdapter::new(ParseOptions::default());
    let extractor = FactExtractor::new(ExtractOptions::default(), DetectorRegistry::builtin().unwrap()).unwrap();
    let units: Vec<_> = loader
        .units(codecensus::loader::Cursor::START)
        .unwrap()
        .map(|u| u.unwrap())
        .collect();

    let empty = loader.load(&units[0]).unwrap();
    let unit = codecensus::loader::SourceUnit::new(loader.corpus_id(), &units[0], &empty);
    let tree = parser.parse(&empty, unit.language).unwrap();
    assert_eq!(extractor.extract(&tree, &unit).count(), 0);

    let content = loader.load(&units[1]).unwrap();
    let unit = codecensus::loader::SourceUnit::new(loader.corpus_id(), &units[1], &content);
    let tree = parser.parse(&content, unit.language).unwrap();
    let kinds: Vec<(FactKind, String)> = extractor
        .extract(&tree, &unit)
        .map(|f| f.unwrap())
        .filter(|f| matches!(f.kind, FactKind::Import | FactKind::Call))
        .map(|f| (f.kind, f.identifier))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (FactKind::Import, "os".to_string()),
            (FactKind::Call, "os.path.join".to_string()),
        ]
    );

    let broken = loader.load(&units[2]).unwrap();
    assert!(matches!(
        parser.parse(&broken, units[2].language),
        Err(ParseFailure::Syntax { .. })
    ));
}

/// Two disjoint shards merged equal one run over the whole corpus.
#[tokio::test]
async fn test_sharded_runs_merge_to_full_run() {
    let temp_dir = tempdir().unwrap();
    write_corpus(temp_dir.path(), 1000);
    let full_loader: Arc<dyn SourceLoader> = Arc::new(DirectoryLoader::new(temp_dir.path()));

    let full = orchestrator(full_loader.clone(), memory_store(), options(8))
        .run()
        .await
        .unwrap();
    assert_eq!(full.succeeded, 1000);

    let mut merged = AggregateTable::new();
    let mut units = 0;
    for index in 0..2 {
        let shard = Arc::new(ShardedLoader::new(
            full_loader.clone(),
            ShardSpec { index, count: 2 },
        ));
        let report = orchestrator(shard, memory_store(), options(4))
            .run()
            .await
            .unwrap();
        assert!(report.succeeded > 0);
        units += report.succeeded;
        merged.merge(&report.table);
    }

    assert_eq!(units, 1000);
    assert_eq!(merged, full.table);
}

/// A run stopped after 100 units resumes from its SQLite checkpoint and
/// processes only the remaining 900.
#[tokio::test]
async fn test_resume_after_100_units() {
    let temp_dir = tempdir().unwrap();
    let corpus = temp_dir.path().join("corpus");
    write_corpus(&corpus, 1000);
    let db = temp_dir.path().join("census.db");
    let loader: Arc<dyn SourceLoader> = Arc::new(DirectoryLoader::new(&corpus));

    let uninterrupted = orchestrator(loader.clone(), memory_store(), options(4))
        .run()
        .await
        .unwrap();

    let first = orchestrator(
        loader.clone(),
        Box::new(SqliteStore::open(&db).unwrap()),
        RunOptions {
            max_units: Some(100),
            ..options(1)
        },
    )
    .run()
    .await
    .unwrap();
    assert_eq!(first.processed(), 100);

    // a fresh process: reopen the database from disk
    let store = SqliteStore::open(&db).unwrap();
    let latest = store.latest().unwrap().unwrap();
    assert_eq!(store.load(latest).unwrap().cursor.0, 100);

    let second = orchestrator(
        loader,
        Box::new(store),
        RunOptions {
            resume: Some(ResumeFrom::Latest),
            ..options(4)
        },
    )
    .run()
    .await
    .unwrap();

    assert_eq!(second.resumed_from, Some(latest));
    assert_eq!(second.processed(), 900);
    assert_eq!(second.table, uninterrupted.table);
    assert_eq!(
        SqliteStore::open(&db).unwrap().latest_aggregates().unwrap(),
        uninterrupted.table
    );
}

/// Cancelling before the run starts still leaves a valid checkpoint.
#[tokio::test]
async fn test_cancelled_run_is_aborted_with_checkpoint() {
    let temp_dir = tempdir().unwrap();
    write_corpus(temp_dir.path(), 20);
    let loader: Arc<dyn SourceLoader> = Arc::new(DirectoryLoader::new(temp_dir.path()));

    let token = CancellationToken::new();
    token.cancel();
    let orch = orchestrator(loader, memory_store(), options(2)).with_cancellation(token);
    let report = orch.run().await.unwrap();

    assert_eq!(report.phase, RunPhase::Aborted);
    assert_eq!(report.processed(), 0);
    assert!(report.checkpoint.is_some());
    assert_eq!(orch.store().lock().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_checkpoint_store_failure_aborts() {
    let temp_dir = tempdir().unwrap();
    write_corpus(temp_dir.path(), 5);
    let loader: Arc<dyn SourceLoader> = Arc::new(DirectoryLoader::new(temp_dir.path()));

    let result = orchestrator(
        loader,
        Box::new(Unwritable),
        RunOptions {
            max_retries: 1,
            ..options(2)
        },
    )
    .run()
    .await;

    assert!(matches!(
        result,
        Err(PipelineError::Checkpoint { attempts: 2, .. })
    ));
}

/// Config file → run → CSV export → read back.
#[tokio::test]
async fn test_config_driven_run_and_export() {
    let temp_dir = tempdir().unwrap();
    let corpus = temp_dir.path().join("corpus");
    write_corpus(&corpus, 12);

    let config_path = temp_dir.path().join("census.json");
    let json = serde_json::json!({
        "corpus": {"location": corpus, "exclude": ["repo0/**"]},
        "language": "python",
        "parallelism": 2,
        "checkpoint": {"path": temp_dir.path().join("census.db"), "retain": 1},
        "extract": {"metrics": ["size"], "detectors": ["bare-except"]}
    });
    fs::write(&config_path, json.to_string()).unwrap();

    let config = RunConfig::load(&config_path).unwrap();
    config.validate().unwrap();
    let report = Orchestrator::new(
        config.open_loader().unwrap(),
        config.parser(),
        config.extractor().unwrap(),
        Box::new(config.open_store().unwrap()),
        config.run_options().unwrap(),
    )
    .run()
    .await
    .unwrap();

    // repo0 holds files 0 and 7
    assert_eq!(report.succeeded, 10);
    assert!(report.outcomes.iter().all(|s| s.state == UnitState::Succeeded));
    assert_eq!(report.table.count(&FactKind::Metric, "size"), 10);
    assert_eq!(report.table.count(&FactKind::Metric, "cyclomatic"), 0);
    // files 3 and 11 have a bare except
    assert_eq!(report.table.count(&FactKind::Pattern("bare-except".into()), "except"), 2);

    let mut csv = Vec::new();
    write_csv(&report.table, &mut csv).unwrap();
    assert_eq!(read_csv(csv.as_slice()).unwrap(), report.table);
}
