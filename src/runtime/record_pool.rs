use crate::consts::RECORD_POOL_MAX_IDLE;
use crate::schemas::UtxoRecord;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub reused: u64,
    pub released: u64,
    pub idle: usize,
}

/// Free list of [`UtxoRecord`]s. Workers acquire, the serial stage releases.
pub struct RecordPool {
    free: Mutex<Vec<UtxoRecord>>,
    max_idle: usize,
    acquired: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
}

impl Default for RecordPool {
    fn default() -> Self {
        Self::new(RECORD_POOL_MAX_IDLE)
    }
}

impl RecordPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            acquired: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    fn free_list(&self) -> std::sync::MutexGuard<'_, Vec<UtxoRecord>> {
        self.free.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A blank record; recycled when one is idle.
    pub fn acquire(&self) -> UtxoRecord {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        match self.free_list().pop() {
            Some(rec) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                rec
            }
            None => UtxoRecord::default(),
        }
    }

    /// `n` blank records under one lock.
    pub fn acquire_many(&self, n: usize) -> Vec<UtxoRecord> {
        let mut out = Vec::with_capacity(n);
        {
            let mut free = self.free_list();
            let take = n.min(free.len());
            let start = free.len() - take;
            out.extend(free.drain(start..));
        }
        let reused = out.len();
        out.resize_with(n, UtxoRecord::default);
        self.acquired.fetch_add(n as u64, Ordering::Relaxed);
        self.reused.fetch_add(reused as u64, Ordering::Relaxed);
        out
    }

    pub fn release(&self, rec: UtxoRecord) {
        self.release_all(std::iter::once(rec));
    }

    /// Reset and return records; anything past the idle cap is dropped.
    pub fn release_all(&self, recs: impl IntoIterator<Item = UtxoRecord>) {
        let mut free = self.free_list();
        for mut rec in recs {
            self.released.fetch_add(1, Ordering::Relaxed);
            if free.len() >= self.max_idle {
                continue;
            }
            rec.reset();
            free.push(rec);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            idle: self.free_list().len(),
        }
    }
}
