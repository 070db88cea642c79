use crate::runtime::record_pool::RecordPool;
use crate::schemas::{OutpointKey, UtxoRecord};
use std::collections::HashMap;

/// Mempool UTXOs created by earlier cycles and still unspent.
///
/// Owned by the sync controller for the life of the process; a FULL resync clears it.
#[derive(Default)]
pub struct CarryoverMap {
    records: HashMap<OutpointKey, UtxoRecord>,
}

impl CarryoverMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &OutpointKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &OutpointKey) -> Option<&UtxoRecord> {
        self.records.get(key)
    }

    /// Evict and hand back ownership.
    pub fn take(&mut self, key: &OutpointKey) -> Option<UtxoRecord> {
        self.records.remove(key)
    }

    /// Absorb this cycle's surviving new records. Replaced duplicates go back to the pool.
    pub fn merge(&mut self, recs: impl IntoIterator<Item = (OutpointKey, UtxoRecord)>, pool: &RecordPool) {
        let replaced: Vec<UtxoRecord> =
            recs.into_iter().filter_map(|(k, r)| self.records.insert(k, r)).collect();
        if !replaced.is_empty() {
            pool.release_all(replaced);
        }
    }

    /// Drop everything, recycling the records.
    pub fn clear(&mut self, pool: &RecordPool) {
        pool.release_all(self.records.drain().map(|(_, r)| r));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutpointKey, &UtxoRecord)> {
        self.records.iter()
    }

    /// One line per entry, ordered by position: `position outpoint height satoshi`.
    pub fn dump_lines(&self, limit: usize) -> Vec<String> {
        let mut entries: Vec<_> = self.records.iter().collect();
        entries.sort_by_key(|(k, r)| (r.position, k.index()));
        entries
            .into_iter()
            .take(limit)
            .map(|(k, r)| format!("{} {} {} {}", r.position, k, r.height, r.satoshi))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(position: u64, satoshi: u64) -> UtxoRecord {
        UtxoRecord { position, satoshi, ..Default::default() }
    }

    #[test]
    fn merge_take_clear() {
        let pool = RecordPool::new(10);
        let mut map = CarryoverMap::new();
        let a = OutpointKey::new(&[1; 32], 0);
        let b = OutpointKey::new(&[2; 32], 1);
        map.merge(vec![(a, rec(0, 10)), (b, rec(1, 20))], &pool);
        assert_eq!(map.len(), 2);
        assert_eq!(map.take(&a).unwrap().satoshi, 10);
        assert!(!map.contains(&a));

        map.clear(&pool);
        assert!(map.is_empty());
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn dump_is_position_ordered() {
        let pool = RecordPool::new(10);
        let mut map = CarryoverMap::new();
        map.merge(
            vec![(OutpointKey::new(&[2; 32], 0), rec(5, 1)), (OutpointKey::new(&[1; 32], 0), rec(2, 1))],
            &pool,
        );
        let lines = map.dump_lines(10);
        assert!(lines[0].starts_with("2 "));
        assert!(lines[1].starts_with("5 "));
        assert_eq!(map.dump_lines(1).len(), 1);
    }
}
