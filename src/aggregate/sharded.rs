use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

use super::{AggregateTable, FactKey};

/// Aggregate table split into independently locked shards.
///
/// A key always lands in the same shard (xxHash64 of kind and identifier),
/// so shards never overlap and a snapshot is simply their union.
pub struct ShardedAggregator {
    shards: Vec<Mutex<AggregateTable>>,
}

impl ShardedAggregator {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(AggregateTable::new()))
                .collect(),
        }
    }

    /// Start from an existing table (a resumed checkpoint).
    pub fn from_table(shards: usize, table: AggregateTable) -> Self {
        let aggregator = Self::new(shards);
        aggregator.merge_table(table);
        aggregator
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_of(&self, key: &FactKey) -> usize {
        let mut bytes = key.kind.to_string().into_bytes();
        bytes.push(0);
        bytes.extend_from_slice(key.identifier.as_bytes());
        (xxh64(&bytes, 0) % self.shards.len() as u64) as usize
    }

    /// Merge a partial table, taking each shard lock once.
    pub fn merge_table(&self, table: AggregateTable) {
        let mut buckets: Vec<Vec<_>> = (0..self.shards.len()).map(|_| Vec::new()).collect();
        for (key, entry) in table {
            let shard = self.shard_of(&key);
            buckets[shard].push((key, entry));
        }
        for (shard, bucket) in self.shards.iter().zip(buckets) {
            if bucket.is_empty() {
                continue;
            }
            let mut guard = shard.lock();
            for (key, entry) in bucket {
                guard.add_entry(key, &entry);
            }
        }
    }

    /// Union of all shards.
    pub fn snapshot(&self) -> AggregateTable {
        let mut table = AggregateTable::new();
        for shard in &self.shards {
            table.merge(&shard.lock());
        }
        table
    }
}
