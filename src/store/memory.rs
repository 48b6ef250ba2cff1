use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CheckpointError, CheckpointInfo, CheckpointStore, CheckpointToken, Snapshot};

/// In-process checkpoint store with failure injection. Each checkpoint is
/// kept with its statuses already resolved against its base.
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: Vec<(CheckpointInfo, Snapshot)>,
    next_id: i64,
    retain: usize,
    /// Saves left to fail.
    failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Make the next `saves` saves fail.
    pub fn fail_next(&self, saves: usize) {
        self.failures.store(saves, Ordering::SeqCst);
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<CheckpointToken, CheckpointError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CheckpointError::Injected);
        }
        let mut statuses = BTreeMap::new();
        if let Some(base) = snapshot.base {
            for status in self.load(base)?.statuses {
                statuses.insert(status.unit_id.clone(), status);
            }
        }
        for status in &snapshot.statuses {
            statuses.insert(status.unit_id.clone(), status.clone());
        }
        let mut statuses: Vec<_> = statuses.into_values().collect();
        statuses.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.unit_id.cmp(&b.unit_id)));

        self.next_id += 1;
        let token = CheckpointToken(self.next_id);
        let info = CheckpointInfo {
            token,
            created_at: Utc::now(),
            corpus_id: snapshot.corpus_id.clone(),
            cursor: snapshot.cursor,
            units: snapshot.units,
        };
        let resolved = Snapshot {
            base: None,
            statuses,
            ..snapshot.clone()
        };
        self.checkpoints.push((info, resolved));
        if self.retain > 0 && self.checkpoints.len() > self.retain {
            let excess = self.checkpoints.len() - self.retain;
            self.checkpoints.drain(..excess);
        }
        Ok(token)
    }

    fn load(&self, token: CheckpointToken) -> Result<Snapshot, CheckpointError> {
        self.checkpoints
            .iter()
            .find(|(info, _)| info.token == token)
            .map(|(_, snapshot)| snapshot.clone())
            .ok_or(CheckpointError::UnknownToken(token))
    }

    fn latest(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        Ok(self.checkpoints.last().map(|(info, _)| info.token))
    }

    fn list(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        Ok(self.checkpoints.iter().map(|(info, _)| info.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{exercise_retention, exercise_store, snapshot};
    use super::*;

    #[test]
    fn test_memory_store_contract() {
        exercise_store(&mut MemoryStore::new());
    }

    #[test]
    fn test_injected_failures_are_counted() {
        let mut store = MemoryStore::new();
        store.fail_next(2);

        assert!(matches!(store.save(&snapshot("c", 1)), Err(CheckpointError::Injected)));
        assert!(matches!(store.save(&snapshot("c", 1)), Err(CheckpointError::Injected)));
        let token = store.save(&snapshot("c", 1)).unwrap();
        assert_eq!(store.latest().unwrap(), Some(token));
    }

    #[test]
    fn test_retain() {
        exercise_retention(&mut MemoryStore::new().with_retain(2));
    }
}
