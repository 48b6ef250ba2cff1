use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::loader::Cursor;
use crate::status::{UnitState, UnitStatus};

/// Terminal statuses plus the bookkeeping needed to compute a safe resume
/// cursor while units complete out of order.
///
/// Invariant: every offset below [`StatusLedger::cursor`] is settled, i.e. the
/// unit has a terminal status, was skipped as already settled, or was never
/// produced by the loader.
#[derive(Debug, Default)]
pub(crate) struct StatusLedger {
    settled: HashMap<String, UnitStatus>,
    /// Units settled since the last checkpoint.
    changed: BTreeSet<String>,
    /// Offset → unit id of dispatched units.
    in_flight: BTreeMap<u64, String>,
    /// One past the highest offset seen so far.
    high_water: u64,
}

impl StatusLedger {
    /// Ledger resumed from a checkpoint. With `retry_failed`, failed units are
    /// forgotten and the returned start cursor moves back to the first of them.
    pub fn resume(statuses: Vec<UnitStatus>, cursor: Cursor, retry_failed: bool) -> (Self, Cursor) {
        let mut start = cursor.0;
        let mut settled = HashMap::with_capacity(statuses.len());
        for status in statuses {
            if retry_failed && matches!(status.state, UnitState::Failed { .. }) {
                start = start.min(status.offset);
                continue;
            }
            settled.insert(status.unit_id.clone(), status);
        }
        let ledger = Self {
            settled,
            changed: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            high_water: start,
        };
        (ledger, Cursor(start))
    }

    pub fn settled(&self, unit_id: &str) -> Option<&UnitStatus> {
        self.settled.get(unit_id)
    }

    /// Where a unit stands in this run. Units not yet dispatched are pending.
    pub fn state_of(&self, unit_id: &str) -> UnitState {
        if let Some(status) = self.settled.get(unit_id) {
            return status.state.clone();
        }
        if self.in_flight.values().any(|id| id == unit_id) {
            UnitState::InProgress
        } else {
            UnitState::Pending
        }
    }

    fn see(&mut self, offset: u64) {
        self.high_water = self.high_water.max(offset + 1);
    }

    /// A unit was dispatched to a worker.
    pub fn begin(&mut self, offset: u64, unit_id: &str) {
        self.in_flight.insert(offset, unit_id.to_string());
        self.see(offset);
    }

    /// A unit was passed over without being processed.
    pub fn skip(&mut self, offset: u64) {
        self.see(offset);
    }

    /// A unit reached a terminal state.
    pub fn finish(&mut self, status: UnitStatus) {
        debug_assert!(status.state.is_terminal(), "{} finished as {}", status.unit_id, status.state.as_str());
        self.in_flight.remove(&status.offset);
        self.see(status.offset);
        self.changed.insert(status.unit_id.clone());
        self.settled.insert(status.unit_id.clone(), status);
    }

    /// Offset to restart enumeration from.
    pub fn cursor(&self) -> Cursor {
        Cursor(
            self.in_flight
                .first_key_value()
                .map_or(self.high_water, |(offset, _)| *offset),
        )
    }

    /// Units with a terminal status, including those carried over from a
    /// resumed checkpoint.
    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    /// Statuses settled since the previous call, ordered by offset.
    pub fn take_changes(&mut self) -> Vec<UnitStatus> {
        let mut statuses: Vec<UnitStatus> = std::mem::take(&mut self.changed)
            .into_iter()
            .filter_map(|id| self.settled.get(&id).cloned())
            .collect();
        statuses.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.unit_id.cmp(&b.unit_id)));
        statuses
    }
}
