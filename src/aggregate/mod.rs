//! Aggregate statistics keyed by fact identity.
//!
//! Combining two tables is element-wise (counts and sums add, min/max take
//! the extreme), so partial tables built by different workers can be merged
//! in any order and grouping. Counts, minima and maxima come out identical
//! whatever the order; floating-point sums may differ in the last bits, by
//! at most 1e-9 relative to the sum of absolute values.
pub mod export;
pub mod sharded;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::extractor::{FactKind, FactRecord};

pub use sharded::ShardedAggregator;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub kind: FactKind,
    pub identifier: String,
}

impl FactKey {
    pub fn new(kind: FactKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
        }
    }
}

/// Running accumulators over the values of valued facts (metrics).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl ValueStats {
    pub fn of(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.combine(&ValueStats::of(value));
    }

    pub fn combine(&mut self, other: &ValueStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateEntry {
    /// Occurrences of the fact.
    pub count: u64,
    pub values: Option<ValueStats>,
}

impl AggregateEntry {
    pub fn observe(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            match &mut self.values {
                Some(stats) => stats.observe(v),
                None => self.values = Some(ValueStats::of(v)),
            }
        }
    }

    pub fn combine(&mut self, other: &AggregateEntry) {
        self.count += other.count;
        match (&mut self.values, &other.values) {
            (Some(mine), Some(theirs)) => mine.combine(theirs),
            (None, Some(theirs)) => self.values = Some(*theirs),
            _ => {}
        }
    }
}

/// Flat form of one entry, as exported and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub kind: String,
    pub identifier: String,
    pub count: u64,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AggregateRow {
    pub fn new(key: &FactKey, entry: &AggregateEntry) -> Self {
        Self {
            kind: key.kind.to_string(),
            identifier: key.identifier.clone(),
            count: entry.count,
            sum: entry.values.map(|v| v.sum),
            min: entry.values.map(|v| v.min),
            max: entry.values.map(|v| v.max),
        }
    }

    /// Rebuild the key and entry. Value statistics are recorded for every
    /// occurrence of a valued fact, so their count is the entry count.
    pub fn into_entry(self) -> Result<(FactKey, AggregateEntry), String> {
        let kind: FactKind = self.kind.parse()?;
        let values = match (self.sum, self.min, self.max) {
            (Some(sum), Some(min), Some(max)) => Some(ValueStats {
                count: self.count,
                sum,
                min,
                max,
            }),
            (None, None, None) => None,
            _ => return Err(format!("partial value columns for {}", self.identifier)),
        };
        Ok((
            FactKey::new(kind, self.identifier),
            AggregateEntry {
                count: self.count,
                values,
            },
        ))
    }
}

/// Ordered table of aggregate entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregateTable {
    entries: BTreeMap<FactKey, AggregateEntry>,
}

impl AggregateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold facts in the order given.
    pub fn from_facts<'f>(facts: impl IntoIterator<Item = &'f FactRecord>) -> Self {
        let mut table = Self::new();
        for fact in facts {
            table.apply(fact);
        }
        table
    }

    pub fn apply(&mut self, fact: &FactRecord) {
        self.entries
            .entry(FactKey::new(fact.kind.clone(), fact.identifier.as_str()))
            .or_default()
            .observe(fact.value);
    }

    /// Combine one entry into the table.
    pub fn add_entry(&mut self, key: FactKey, entry: &AggregateEntry) {
        self.entries.entry(key).or_default().combine(entry);
    }

    /// Element-wise merge of `other` into `self`.
    pub fn merge(&mut self, other: &AggregateTable) {
        for (key, entry) in &other.entries {
            match self.entries.get_mut(key) {
                Some(existing) => existing.combine(entry),
                None => {
                    self.entries.insert(key.clone(), entry.clone());
                }
            }
        }
    }

    pub fn get(&self, kind: &FactKind, identifier: &str) -> Option<&AggregateEntry> {
        self.entries.get(&FactKey::new(kind.clone(), identifier))
    }

    pub fn count(&self, kind: &FactKind, identifier: &str) -> u64 {
        self.get(kind, identifier).map_or(0, |e| e.count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FactKey, &AggregateEntry)> {
        self.entries.iter()
    }

    /// Sum of occurrence counts over all entries.
    pub fn total_facts(&self) -> u64 {
        self.entries.values().map(|e| e.count).sum()
    }

    pub fn rows(&self) -> impl Iterator<Item = AggregateRow> + '_ {
        self.entries.iter().map(|(k, e)| AggregateRow::new(k, e))
    }

    pub fn from_rows(rows: impl IntoIterator<Item = AggregateRow>) -> Result<Self, String> {
        let mut table = Self::new();
        for row in rows {
            let (key, entry) = row.into_entry()?;
            table.add_entry(key, &entry);
        }
        Ok(table)
    }
}

impl IntoIterator for AggregateTable {
    type Item = (FactKey, AggregateEntry);
    type IntoIter = std::collections::btree_map::IntoIter<FactKey, AggregateEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn fact(kind: FactKind, identifier: &str, value: Option<f64>) -> FactRecord {
        FactRecord {
            kind,
            identifier: identifier.to_string(),
            unit: Arc::from("u"),
            value,
            scope: None,
            line: 1,
        }
    }

    #[test]
    fn test_apply_counts_and_stats() {
        let table = AggregateTable::from_facts(&[
            fact(FactKind::Call, "os.path.join", None),
            fact(FactKind::Call, "os.path.join", None),
            fact(FactKind::Metric, "cyclomatic", Some(3.0)),
            fact(FactKind::Metric, "cyclomatic", Some(1.0)),
            fact(FactKind::Metric, "cyclomatic", Some(8.0)),
        ]);
        assert_eq!(table.count(&FactKind::Call, "os.path.join"), 2);
        let stats = table.get(&FactKind::Metric, "cyclomatic").unwrap().values.unwrap();
        assert_eq!(stats, ValueStats { count: 3, sum: 12.0, min: 1.0, max: 8.0 });
        assert_eq!(table.total_facts(), 5);
    }

    #[test]
    fn test_rows_round_trip() {
        let table = AggregateTable::from_facts(&[
            fact(FactKind::Import, "os", None),
            fact(FactKind::Metric, "size", Some(10.0)),
        ]);
        let rebuilt = AggregateTable::from_rows(table.rows()).unwrap();
        assert_eq!(rebuilt, table);
    }

    #[test]
    fn test_partial_value_columns_rejected() {
        let row = AggregateRow {
            kind: "metric".into(),
            identifier: "size".into(),
            count: 1,
            sum: Some(1.0),
            min: None,
            max: None,
        };
        assert!(row.into_entry().is_err());
    }

    /// Relative error bound on metric sums merged in different orders.
    const SUM_TOLERANCE: f64 = 1e-9;

    fn arb_fact() -> impl Strategy<Value = FactRecord> {
        (0..3usize, 0..5u8, proptest::option::of(-50i32..50)).prop_map(|(k, id, value)| {
            let kind = [FactKind::Call, FactKind::Import, FactKind::Metric][k].clone();
            fact(kind, &format!("id{id}"), value.map(f64::from))
        })
    }

    proptest! {
        #[test]
        fn test_merge_is_order_and_grouping_independent(
            facts in proptest::collection::vec(arb_fact(), 0..60),
            cuts in proptest::collection::vec(0usize..60, 0..4),
        ) {
            let sequential = AggregateTable::from_facts(&facts);

            let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c.min(facts.len())).collect();
            bounds.push(0);
            bounds.push(facts.len());
            bounds.sort_unstable();
            let parts: Vec<AggregateTable> = bounds
                .windows(2)
                .map(|w| AggregateTable::from_facts(&facts[w[0]..w[1]]))
                .collect();

            let mut forward = AggregateTable::new();
            for part in &parts {
                forward.merge(part);
            }
            let mut backward = AggregateTable::new();
            for part in parts.iter().rev() {
                backward.merge(part);
            }
            // ((a ∪ b) ∪ c) against (a ∪ (b ∪ c))
            let mut nested = AggregateTable::new();
            if let Some((first, rest)) = parts.split_first() {
                let mut tail = AggregateTable::new();
                for part in rest {
                    tail.merge(part);
                }
                nested.merge(first);
                nested.merge(&tail);
            }

            prop_assert_eq!(&forward, &sequential);
            prop_assert_eq!(&backward, &sequential);
            prop_assert_eq!(&nested, &sequential);
        }

        #[test]
        fn test_fractional_sums_agree_within_tolerance(
            values in proptest::collection::vec(-1.0e6f64..1.0e6, 1..80),
            shuffle in proptest::collection::vec(any::<prop::sample::Index>(), 80),
        ) {
            let facts: Vec<FactRecord> = values
                .iter()
                .map(|v| fact(FactKind::Metric, "halstead", Some(*v)))
                .collect();
            let mut reordered = facts.clone();
            for (i, pick) in shuffle.iter().enumerate().take(reordered.len()) {
                let j = pick.index(reordered.len());
                reordered.swap(i, j);
            }

            let sequential = AggregateTable::from_facts(&facts);
            let mut merged = AggregateTable::new();
            for fact in reordered.iter().rev() {
                merged.merge(&AggregateTable::from_facts(std::slice::from_ref(fact)));
            }

            let a = sequential.get(&FactKind::Metric, "halstead").unwrap();
            let b = merged.get(&FactKind::Metric, "halstead").unwrap();
            let (sa, sb) = (a.values.unwrap(), b.values.unwrap());
            prop_assert_eq!(a.count, b.count);
            prop_assert_eq!(sa.min, sb.min);
            prop_assert_eq!(sa.max, sb.max);
            let magnitude: f64 = values.iter().map(|v| v.abs()).sum();
            prop_assert!((sa.sum - sb.sum).abs() <= SUM_TOLERANCE * magnitude.max(1.0));
        }
    }
}
