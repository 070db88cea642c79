use rocksdb::{
    BlockBasedOptions, Cache, DB, Direction, Error as RocksError, IteratorMode, Options,
    ReadOptions, WriteBatch,
};
use std::{path::Path, sync::Arc};

/// ===== Cache / open-time tuning =====
/// LRU block cache (data + index/filter blocks).
pub const ROCKS_BLOCK_CACHE_BYTES: usize = 256 << 20; // 256 MiB

/// Bloom filter bits/key (helps point lookups).
pub const BLOOM_BITS_PER_KEY: f64 = 10.0;

/// A key namespace inside a shared RocksDB handle.
#[derive(Clone)]
pub struct Mdb {
    db: Arc<DB>,
    prefix: Vec<u8>,
}

/// Open (or create) the database every namespace shares.
pub fn open_db(path: impl AsRef<Path>) -> Result<Arc<DB>, RocksError> {
    let cache = Cache::new_lru_cache(ROCKS_BLOCK_CACHE_BYTES);

    let mut table = BlockBasedOptions::default();
    table.set_block_cache(&cache);
    table.set_cache_index_and_filter_blocks(true);
    table.set_pin_l0_filter_and_index_blocks_in_cache(true);
    table.set_bloom_filter(BLOOM_BITS_PER_KEY, false);

    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_max_open_files(-1);
    opts.set_block_based_table_factory(&table);

    Ok(Arc::new(DB::open(&opts, path)?))
}

impl Mdb {
    pub fn from_db(db: Arc<DB>, prefix: impl AsRef<[u8]>) -> Self {
        Self { db, prefix: prefix.as_ref().to_vec() }
    }

    pub fn open(path: impl AsRef<Path>, prefix: impl AsRef<[u8]>) -> Result<Self, RocksError> {
        Ok(Self::from_db(open_db(path)?, prefix))
    }

    #[inline]
    pub fn prefixed(&self, k: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + k.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(k);
        out
    }

    pub fn get(&self, k: &[u8]) -> Result<Option<Vec<u8>>, RocksError> {
        self.db.get(self.prefixed(k))
    }

    /// Point lookups in one round-trip, results in key order.
    pub fn multi_get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, RocksError> {
        let prefixed: Vec<Vec<u8>> = keys.iter().map(|k| self.prefixed(k)).collect();
        self.db
            .multi_get(prefixed)
            .into_iter()
            .map(|r| r.map(|v| v.map(|slice| slice.to_vec())))
            .collect()
    }

    pub fn put(&self, k: &[u8], v: &[u8]) -> Result<(), RocksError> {
        self.db.put(self.prefixed(k), v)
    }

    pub fn delete(&self, k: &[u8]) -> Result<(), RocksError> {
        self.db.delete(self.prefixed(k))
    }

    /// Collect puts/deletes and apply them atomically.
    pub fn bulk_write<F>(&self, build: F) -> Result<(), RocksError>
    where
        F: FnOnce(&mut MdbBatch<'_>),
    {
        let mut wb = WriteBatch::default();
        {
            let mut mb = MdbBatch { mdb: self, wb: &mut wb };
            build(&mut mb);
        }
        self.db.write(wb)
    }

    /// All (relative key, value) pairs under `rel_prefix`, in key order.
    pub fn scan_prefix(&self, rel_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RocksError> {
        let start = self.prefixed(rel_prefix);

        // upper bound: increment the last non-0xff byte
        let mut ub = start.clone();
        while let Some(last) = ub.pop() {
            if last != 0xff {
                ub.push(last + 1);
                break;
            }
        }

        let mut ro = ReadOptions::default();
        if !ub.is_empty() {
            ro.set_iterate_upper_bound(ub);
        }
        ro.set_total_order_seek(true);

        let it = self.db.iterator_opt(IteratorMode::From(&start, Direction::Forward), ro);
        let mut out = Vec::new();
        for kv in it {
            let (k_full, v) = kv?;
            if !k_full.starts_with(&start) {
                break;
            }
            out.push((k_full[self.prefix.len()..].to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    /// Relative keys only.
    pub fn scan_prefix_keys(&self, rel_prefix: &[u8]) -> Result<Vec<Vec<u8>>, RocksError> {
        Ok(self.scan_prefix(rel_prefix)?.into_iter().map(|(k, _)| k).collect())
    }

    #[inline]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

pub struct MdbBatch<'a> {
    mdb: &'a Mdb,
    wb: &'a mut WriteBatch,
}

impl<'a> MdbBatch<'a> {
    #[inline]
    pub fn put(&mut self, k: &[u8], v: &[u8]) {
        self.wb.put(self.mdb.prefixed(k), v);
    }

    #[inline]
    pub fn delete(&mut self, k: &[u8]) {
        self.wb.delete(self.mdb.prefixed(k));
    }
}
