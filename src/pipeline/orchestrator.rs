use indicatif::ProgressBar;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ledger::StatusLedger;
use super::report::RunReport;
use super::worker::{self, UnitResult};
use super::{PhaseTracker, PipelineError, RunOptions, RunPhase, UnitFailure};
use crate::aggregate::ShardedAggregator;
use crate::extractor::{ExtractionError, FactExtractor};
use crate::loader::{Cursor, LoadError, LoadFailure, SourceLoader, UnitDescriptor};
use crate::parser::ParserAdapter;
use crate::status::{FailureKind, UnitState, UnitStatus};
use crate::store::{CheckpointError, CheckpointStore, CheckpointToken, Snapshot};

pub type SharedStore = Arc<Mutex<Box<dyn CheckpointStore>>>;

/// Drives a run over one corpus.
pub struct Orchestrator {
    loader: Arc<dyn SourceLoader>,
    parser: Arc<ParserAdapter>,
    extractor: Arc<FactExtractor>,
    store: SharedStore,
    options: RunOptions,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
}

/// State shared between the dispatch loop and unit tasks.
struct RunState {
    corpus_id: String,
    aggregator: ShardedAggregator,
    ledger: Mutex<StatusLedger>,
    /// Workers commit under the read side; checkpoints snapshot under the
    /// write side, so a unit's facts and its status are captured together.
    gate: RwLock<()>,
    /// Latest checkpoint saved or resumed from; the next one extends it.
    base: Mutex<Option<CheckpointToken>>,
    tally: Mutex<Tally>,
    settled: AtomicU64,
    progress: Option<ProgressBar>,
}

#[derive(Default)]
struct Tally {
    succeeded: u64,
    failed: u64,
    skipped: u64,
    facts: u64,
    failures_by_kind: BTreeMap<FailureKind, u64>,
    outcomes: Vec<UnitStatus>,
}

impl RunState {
    /// Record a unit's outcome: facts and status go in together.
    fn commit(&self, unit_id: String, offset: u64, result: UnitResult) {
        let _gate = self.gate.read();
        let (state, facts) = match result.outcome {
            Ok(folded) => {
                self.aggregator.merge_table(folded.table);
                (UnitState::Succeeded, folded.facts)
            }
            Err(failure) => {
                warn!("{unit_id}: {failure}");
                (UnitState::failed(failure.kind(), &failure), 0)
            }
        };
        let status = UnitStatus {
            unit_id,
            offset,
            content_hash: result.content_hash,
            state,
        };
        self.tally.lock().record(&status, facts);
        self.ledger.lock().finish(status);
        self.settled.fetch_add(1, Ordering::Relaxed);
        if let Some(progress) = &self.progress {
            progress.inc(1);
        }
    }

    fn commit_load_failure(&self, failure: LoadFailure) {
        self.commit(
            failure.unit_id,
            failure.offset,
            UnitResult {
                content_hash: None,
                outcome: Err(UnitFailure::Load(failure.error)),
            },
        );
    }

    /// Consistent view of the run for a checkpoint, carrying the statuses
    /// settled since the previous one. Blocks commits while it is taken.
    fn snapshot(&self) -> Snapshot {
        let _gate = self.gate.write();
        let mut ledger = self.ledger.lock();
        Snapshot {
            corpus_id: self.corpus_id.clone(),
            cursor: ledger.cursor(),
            table: self.aggregator.snapshot(),
            base: *self.base.lock(),
            statuses: ledger.take_changes(),
            units: ledger.settled_count() as u64,
        }
    }
}

impl Tally {
    fn record(&mut self, status: &UnitStatus, facts: u64) {
        match &status.state {
            UnitState::Succeeded => self.succeeded += 1,
            UnitState::Failed { kind, .. } => {
                self.failed += 1;
                *self.failures_by_kind.entry(*kind).or_default() += 1;
            }
            _ => {}
        }
        self.facts += facts;
        self.outcomes.push(status.clone());
    }
}

/// Why the dispatch loop stopped.
enum Stop {
    Exhausted,
    Budget,
    Cancelled,
    CheckpointFailed(PipelineError),
}

impl Orchestrator {
    pub fn new(
        loader: Arc<dyn SourceLoader>,
        parser: ParserAdapter,
        extractor: FactExtractor,
        store: Box<dyn CheckpointStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            loader,
            parser: Arc::new(parser),
            extractor: Arc::new(extractor),
            store: Arc::new(Mutex::new(store)),
            options,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Share a store handle, e.g. with an earlier run over the same corpus.
    #[must_use]
    pub fn with_shared_store(mut self, store: SharedStore) -> Self {
        self.store = store;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run to completion, cancellation, or a persistent checkpoint failure.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let mut phases = PhaseTracker::new();
        let corpus_id = self.loader.corpus_id().to_string();

        let resumed = match self.resume_snapshot(&corpus_id).await {
            Ok(resumed) => resumed,
            Err(e) => {
                phases.transition(RunPhase::Aborted)?;
                return Err(e);
            }
        };
        let resumed_from = resumed.as_ref().map(|(token, _)| *token);
        let (ledger, aggregator, start) = match resumed {
            Some((token, snapshot)) => {
                let (ledger, start) =
                    StatusLedger::resume(snapshot.statuses, snapshot.cursor, self.options.retry_failed);
                info!(
                    "resuming from checkpoint {token} at offset {start} ({} entries)",
                    snapshot.table.len()
                );
                let aggregator = ShardedAggregator::from_table(self.options.aggregate_shards, snapshot.table);
                (ledger, aggregator, start)
            }
            None => (
                StatusLedger::default(),
                ShardedAggregator::new(self.options.aggregate_shards),
                Cursor::START,
            ),
        };

        let state = Arc::new(RunState {
            corpus_id,
            aggregator,
            ledger: Mutex::new(ledger),
            gate: RwLock::new(()),
            base: Mutex::new(resumed_from),
            tally: Mutex::new(Tally::default()),
            settled: AtomicU64::new(0),
            progress: self.progress.clone(),
        });

        phases.transition(RunPhase::Scanning)?;
        let (stop, mut tasks, enumerator) = self.dispatch(&state, &mut phases, start).await?;

        phases.transition(RunPhase::Draining)?;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("unit task failed: {e}");
            }
        }
        let enumeration = enumerator.await;

        let stop = match stop {
            Stop::CheckpointFailed(e) => {
                phases.transition(RunPhase::Aborted)?;
                return Err(e);
            }
            other => other,
        };
        match enumeration {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                phases.transition(RunPhase::Aborted)?;
                return Err(PipelineError::Load(e));
            }
            Err(e) => {
                phases.transition(RunPhase::Aborted)?;
                return Err(PipelineError::Task(e.to_string()));
            }
        }

        phases.transition(RunPhase::Checkpointing)?;
        let token = match self.checkpoint(&state).await {
            Ok(token) => token,
            Err(e) => {
                phases.transition(RunPhase::Draining)?;
                phases.transition(RunPhase::Aborted)?;
                return Err(e);
            }
        };
        phases.transition(RunPhase::Draining)?;

        let final_phase = match stop {
            Stop::Cancelled => RunPhase::Aborted,
            _ => RunPhase::Completed,
        };
        phases.transition(final_phase)?;
        if let Some(progress) = &self.progress {
            progress.finish_and_clear();
        }

        let table = state.aggregator.snapshot();
        let tally = std::mem::take(&mut *state.tally.lock());
        let mut outcomes = tally.outcomes;
        outcomes.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.unit_id.cmp(&b.unit_id)));

        Ok(RunReport {
            phase: final_phase,
            phases: phases.history().to_vec(),
            succeeded: tally.succeeded,
            failed: tally.failed,
            skipped: tally.skipped,
            failures_by_kind: tally.failures_by_kind,
            facts: tally.facts,
            resumed_from,
            checkpoint: Some(token),
            elapsed_ms: started.elapsed().as_millis() as u64,
            outcomes,
            table,
        })
    }

    /// The dispatch loop: pull descriptors, skip settled units, spawn work,
    /// take periodic checkpoints.
    #[allow(clippy::type_complexity)]
    async fn dispatch(
        &self,
        state: &Arc<RunState>,
        phases: &mut PhaseTracker,
        start: Cursor,
    ) -> Result<
        (
            Stop,
            JoinSet<()>,
            tokio::task::JoinHandle<Result<(), LoadError>>,
        ),
        PipelineError,
    > {
        let parallelism = self.options.parallelism.max(1);
        let (tx, mut rx) = mpsc::channel(parallelism * 4);
        let enumerator = {
            let loader = self.loader.clone();
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || -> Result<(), LoadError> {
                for item in loader.units(start)? {
                    if cancel.is_cancelled() || tx.blocking_send(item).is_err() {
                        break;
                    }
                }
                Ok(())
            })
        };

        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut tasks = JoinSet::new();
        let mut dispatched = 0u64;
        let mut settled_at_checkpoint = 0u64;
        let mut checkpoint_clock = Instant::now();

        let stop = loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("unit task failed: {e}");
                }
            }

            let settled = state.settled.load(Ordering::Relaxed);
            if self.checkpoint_due(settled - settled_at_checkpoint, checkpoint_clock.elapsed()) {
                phases.transition(RunPhase::Checkpointing)?;
                let saved = self.checkpoint(state).await;
                phases.transition(RunPhase::Scanning)?;
                if let Err(e) = saved {
                    break Stop::CheckpointFailed(e);
                }
                settled_at_checkpoint = settled;
                checkpoint_clock = Instant::now();
            }

            if self.cancel.is_cancelled() {
                break Stop::Cancelled;
            }
            if self.options.max_units.is_some_and(|max| dispatched >= max) {
                info!("unit budget of {dispatched} reached");
                break Stop::Budget;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Stop::Cancelled,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Stop::Exhausted,
                },
            };
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Stop::Cancelled,
                item = rx.recv() => item,
            };

            match item {
                None => break Stop::Exhausted,
                Some(Err(failure)) => {
                    if state.ledger.lock().settled(&failure.unit_id).is_some() {
                        state.ledger.lock().skip(failure.offset);
                        state.tally.lock().skipped += 1;
                        continue;
                    }
                    state.commit_load_failure(failure);
                }
                Some(Ok(descriptor)) => {
                    if self.already_settled(state, &descriptor) {
                        continue;
                    }
                    state.ledger.lock().begin(descriptor.offset, &descriptor.unit_id());
                    dispatched += 1;
                    tasks.spawn(self.unit_task(state.clone(), descriptor, permit));
                }
            }
        };
        drop(rx);
        Ok((stop, tasks, enumerator))
    }

    /// Skip a unit the resumed checkpoint already settled. The recorded
    /// contribution is kept even if the corpus now reports different content.
    fn already_settled(&self, state: &RunState, descriptor: &UnitDescriptor) -> bool {
        let unit_id = descriptor.unit_id();
        let mut ledger = state.ledger.lock();
        match ledger.state_of(&unit_id) {
            UnitState::Pending => return false,
            UnitState::InProgress => debug!("{unit_id}: duplicate of a running unit"),
            _ => {
                if let Some(recorded) = ledger.settled(&unit_id) {
                    if let (Some(now), Some(then)) = (&descriptor.content_hash, &recorded.content_hash) {
                        if now != then {
                            warn!("{unit_id}: content changed since checkpoint ({then} -> {now}); keeping recorded result");
                        }
                    }
                }
                debug!("{unit_id}: already settled");
            }
        }
        ledger.skip(descriptor.offset);
        drop(ledger);
        state.tally.lock().skipped += 1;
        true
    }

    fn unit_task(
        &self,
        state: Arc<RunState>,
        descriptor: UnitDescriptor,
        permit: OwnedSemaphorePermit,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let loader = self.loader.clone();
        let parser = self.parser.clone();
        let extractor = self.extractor.clone();
        let limit = self.options.unit_timeout;

        async move {
            let unit_id = descriptor.unit_id();
            let offset = descriptor.offset;
            let corpus_id = state.corpus_id.clone();
            // the worker enforces the time limit itself, so the task always
            // finishes and its permit is never released while work goes on
            let job = tokio::task::spawn_blocking(move || {
                worker::process_unit(&*loader, &parser, &extractor, &corpus_id, &descriptor, limit)
            });

            let result = match job.await {
                Ok(result) => result,
                Err(join) => UnitResult {
                    content_hash: None,
                    outcome: Err(UnitFailure::Extraction(ExtractionError::Panicked(panic_message(join)))),
                },
            };
            state.commit(unit_id, offset, result);
            drop(permit);
        }
    }

    fn checkpoint_due(&self, settled_since: u64, elapsed: Duration) -> bool {
        if settled_since == 0 {
            return false;
        }
        let by_count = self.options.checkpoint_every_units > 0
            && settled_since >= self.options.checkpoint_every_units;
        let by_time = self.options.checkpoint_every.is_some_and(|every| elapsed >= every);
        by_count || by_time
    }

    /// Snapshot and save, retrying with exponential backoff.
    async fn checkpoint(&self, state: &Arc<RunState>) -> Result<CheckpointToken, PipelineError> {
        let snapshot = {
            let state = state.clone();
            tokio::task::spawn_blocking(move || state.snapshot())
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))?
        };
        let snapshot = Arc::new(snapshot);
        let mut backoff = self.options.retry_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let store = self.store.clone();
            let pending = snapshot.clone();
            let saved = tokio::task::spawn_blocking(move || store.lock().save(&pending))
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))?;

            match saved {
                Ok(token) => {
                    info!(
                        "checkpoint {token}: cursor {}, {} units ({} new), {} entries",
                        snapshot.cursor,
                        snapshot.units,
                        snapshot.statuses.len(),
                        snapshot.table.len()
                    );
                    *state.base.lock() = Some(token);
                    return Ok(token);
                }
                Err(e) if attempts <= self.options.max_retries => {
                    warn!("checkpoint attempt {attempts} failed: {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(source) => {
                    error!("checkpoint failed after {attempts} attempts: {source}");
                    return Err(PipelineError::Checkpoint { attempts, source });
                }
            }
        }
    }

    async fn resume_snapshot(
        &self,
        corpus_id: &str,
    ) -> Result<Option<(CheckpointToken, Snapshot)>, PipelineError> {
        let Some(from) = self.options.resume else {
            return Ok(None);
        };
        let store = self.store.clone();
        let corpus_id = corpus_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<_, CheckpointError> {
            let store = store.lock();
            match store.resolve(from)? {
                Some(token) => Ok(Some((token, store.load_for(token, &corpus_id)?))),
                None => {
                    info!("no checkpoint to resume from; starting fresh");
                    Ok(None)
                }
            }
        })
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
        .map_err(PipelineError::Resume)
    }
}

fn panic_message(join: JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{DetectorRegistry, ExtractOptions, FactKind};
    use crate::loader::testing::VecLoader;
    use crate::loader::{Location, UnitStream};
    use crate::parser::ParseOptions;
    use crate::store::{MemoryStore, ResumeFrom};
    use pretty_assertions::assert_eq;

    fn orchestrator(loader: Arc<dyn SourceLoader>, store: Box<dyn CheckpointStore>, options: RunOptions) -> Orchestrator {
        Orchestrator::new(
            loader,
            ParserAdapter::new(ParseOptions::default()),
            FactExtractor::new(ExtractOptions::default(), DetectorRegistry::builtin().unwrap()).unwrap(),
            store,
            options,
        )
    }

    fn options() -> RunOptions {
        RunOptions {
            parallelism: 4,
            retry_backoff: Duration::from_millis(1),
            ..RunOptions::default()
        }
    }

    fn corpus(n: usize) -> Arc<VecLoader> {
        let files: Vec<(String, String)> = (0..n)
            .map(|i| (format!("f{i:04}.py"), format!("import m{}\nm{}.call(len([{i}]))\n", i % 5, i % 5)))
            .collect();
        Arc::new(VecLoader::python(
            files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect(),
        ))
    }

    #[tokio::test]
    async fn test_run_settles_every_unit() {
        let report = orchestrator(corpus(40), Box::new(MemoryStore::new()), options())
            .run()
            .await
            .unwrap();
        assert_eq!(report.phase, RunPhase::Completed);
        assert_eq!(report.succeeded, 40);
        assert_eq!(report.outcomes.len(), 40);
        assert_eq!(report.table.count(&FactKind::Call, "builtins.len"), 40);
        assert_eq!(report.table.count(&FactKind::Import, "m0"), 8);
    }

    #[tokio::test]
    async fn test_periodic_checkpoints_track_progress() {
        let opts = RunOptions {
            parallelism: 1,
            checkpoint_every_units: 10,
            ..options()
        };
        let orch = orchestrator(corpus(35), Box::new(MemoryStore::new()), opts);
        let report = orch.run().await.unwrap();

        let store = orch.store();
        let store = store.lock();
        let list = store.list().unwrap();
        // three periodic checkpoints plus the final one
        assert_eq!(list.len(), 4);
        assert_eq!(list.last().unwrap().cursor, Cursor(35));
        assert_eq!(Some(list.last().unwrap().token), report.checkpoint);
        let last = store.load(list[2].token).unwrap();
        assert_eq!(last.statuses.len() as u64, last.cursor.0);
    }

    /// Records the base and status count of every save.
    struct Recording {
        inner: MemoryStore,
        saves: Arc<Mutex<Vec<(Option<CheckpointToken>, usize)>>>,
    }

    impl CheckpointStore for Recording {
        fn save(&mut self, snapshot: &Snapshot) -> Result<CheckpointToken, CheckpointError> {
            self.saves.lock().push((snapshot.base, snapshot.statuses.len()));
            self.inner.save(snapshot)
        }

        fn load(&self, token: CheckpointToken) -> Result<Snapshot, CheckpointError> {
            self.inner.load(token)
        }

        fn latest(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
            self.inner.latest()
        }

        fn list(&self) -> Result<Vec<crate::store::CheckpointInfo>, CheckpointError> {
            self.inner.list()
        }
    }

    #[tokio::test]
    async fn test_checkpoints_carry_only_new_statuses() {
        let saves = Arc::new(Mutex::new(Vec::new()));
        let store = Recording {
            inner: MemoryStore::new(),
            saves: saves.clone(),
        };
        let opts = RunOptions {
            parallelism: 1,
            checkpoint_every_units: 10,
            ..options()
        };
        let orch = orchestrator(corpus(35), Box::new(store), opts);
        let report = orch.run().await.unwrap();

        let saves = saves.lock().clone();
        assert_eq!(saves.len(), 4);
        assert_eq!(saves[0].0, None);
        for (i, (base, _)) in saves.iter().enumerate().skip(1) {
            assert_eq!(*base, Some(CheckpointToken(i as i64)));
        }
        assert_eq!(saves.iter().map(|(_, n)| n).sum::<usize>(), 35);
        assert!(saves.iter().all(|(_, n)| *n <= 11));

        let full = orch.store().lock().load(report.checkpoint.unwrap()).unwrap();
        assert_eq!(full.statuses.len(), 35);
        assert_eq!(full.units, 35);
    }

    #[tokio::test]
    async fn test_checkpoint_retries_then_succeeds() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let opts = RunOptions {
            max_retries: 2,
            ..options()
        };
        let report = orchestrator(corpus(3), Box::new(store), opts).run().await.unwrap();
        assert_eq!(report.phase, RunPhase::Completed);
        assert!(report.checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_failure_aborts_run() {
        let store = MemoryStore::new();
        store.fail_next(usize::MAX);
        let opts = RunOptions {
            max_retries: 2,
            ..options()
        };
        let err = orchestrator(corpus(3), Box::new(store), opts).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint { attempts: 3, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_resume_against_other_corpus_is_refused() {
        let mut store = MemoryStore::new();
        store
            .save(&Snapshot {
                corpus_id: "something-else".into(),
                ..Snapshot::default()
            })
            .unwrap();
        let opts = RunOptions {
            resume: Some(ResumeFrom::Latest),
            ..options()
        };
        let err = orchestrator(corpus(3), Box::new(store), opts).run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Resume(crate::store::CheckpointError::CorpusMismatch { .. })
        ));
    }

    /// Loader whose `load` blocks longer than any sane unit timeout for
    /// one path, and panics for another.
    struct Hostile(VecLoader);

    impl SourceLoader for Hostile {
        fn corpus_id(&self) -> &str {
            self.0.corpus_id()
        }

        fn units(&self, from: Cursor) -> Result<UnitStream<'_>, LoadError> {
            self.0.units(from)
        }

        fn load(&self, unit: &UnitDescriptor) -> Result<Vec<u8>, LoadError> {
            match unit.path.as_str() {
                "slow.py" => std::thread::sleep(Duration::from_millis(1500)),
                "boom.py" => panic!("detector exploded"),
                _ => {}
            }
            match &unit.location {
                Location::Inline(bytes) => Ok(bytes.to_vec()),
                other => Err(LoadError::Io {
                    location: other.to_string(),
                    message: "unexpected".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_timeouts_and_panics_are_isolated() {
        let loader = Arc::new(Hostile(VecLoader::python(vec![
            ("ok.py", "x = 1\n"),
            ("slow.py", "y = 2\n"),
            ("boom.py", "z = 3\n"),
        ])));
        let opts = RunOptions {
            unit_timeout: Duration::from_millis(300),
            ..options()
        };
        let report = orchestrator(loader, Box::new(MemoryStore::new()), opts).run().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failures_by_kind.get(&FailureKind::Timeout), Some(&1));
        assert_eq!(report.failures_by_kind.get(&FailureKind::Extraction), Some(&1));
        match report.status_of("mem:boom.py@0") {
            Some(UnitState::Failed { reason, .. }) => assert!(reason.contains("detector exploded")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_failed_reprocesses_failures() {
        let loader: Arc<dyn SourceLoader> = Arc::new(VecLoader::python(vec![
            ("good.py", "a = 1\n"),
            ("bad.py", "b = \"abc\n"),
        ]));
        let first = orchestrator(loader.clone(), Box::new(MemoryStore::new()), options());
        let report = first.run().await.unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 1));

        let resume = RunOptions {
            resume: Some(ResumeFrom::Latest),
            ..options()
        };
        let plain = orchestrator(loader.clone(), Box::new(MemoryStore::new()), resume.clone())
            .with_shared_store(first.store());
        let report = plain.run().await.unwrap();
        assert_eq!((report.succeeded, report.failed), (0, 0));
        assert_eq!(report.resumed_from.map(|t| t.0), Some(1));

        let retry = RunOptions {
            retry_failed: true,
            ..resume
        };
        let report = orchestrator(loader, Box::new(MemoryStore::new()), retry)
            .with_shared_store(first.store())
            .run()
            .await
            .unwrap();
        assert_eq!((report.succeeded, report.failed), (0, 1));
        assert_eq!(report.outcomes[0].unit_id, "mem:bad.py@0");
        // the recovered table still holds good.py's contribution
        assert_eq!(report.table.count(&FactKind::Metric, "size"), 1);
    }

    #[tokio::test]
    async fn test_cancellation_then_resume_matches_full_run() {
        let files: Vec<(String, String)> = (0..30)
            .map(|i| (format!("c{i:02}.py"), format!("import os\nos.path.join('a', '{i}')\n")))
            .collect();
        let pairs = || files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect::<Vec<_>>();

        let full = orchestrator(Arc::new(VecLoader::python(pairs())), Box::new(MemoryStore::new()), options())
            .run()
            .await
            .unwrap();

        let token = CancellationToken::new();
        let loader: Arc<dyn SourceLoader> = Arc::new(CancelAt {
            inner: VecLoader::python(pairs()),
            at: "c05.py",
            token: token.clone(),
        });
        let opts = RunOptions {
            parallelism: 1,
            ..options()
        };
        let first = orchestrator(loader.clone(), Box::new(MemoryStore::new()), opts.clone())
            .with_cancellation(token);
        let partial = first.run().await.unwrap();
        assert_eq!(partial.phase, RunPhase::Aborted);
        assert_eq!(partial.succeeded, 6);

        let rest = orchestrator(
            Arc::new(VecLoader::python(pairs())),
            Box::new(MemoryStore::new()),
            RunOptions {
                resume: Some(ResumeFrom::Latest),
                ..opts
            },
        )
        .with_shared_store(first.store())
        .run()
        .await
        .unwrap();
        assert_eq!(rest.phase, RunPhase::Completed);
        assert_eq!(rest.succeeded, 24);
        assert_eq!(rest.table, full.table);
    }

    /// Cancels the run while loading one path.
    struct CancelAt {
        inner: VecLoader,
        at: &'static str,
        token: CancellationToken,
    }

    impl SourceLoader for CancelAt {
        fn corpus_id(&self) -> &str {
            self.inner.corpus_id()
        }

        fn units(&self, from: Cursor) -> Result<UnitStream<'_>, LoadError> {
            self.inner.units(from)
        }

        fn load(&self, unit: &UnitDescriptor) -> Result<Vec<u8>, LoadError> {
            if unit.path == self.at {
                self.token.cancel();
            }
            self.inner.load(unit)
        }
    }
}
