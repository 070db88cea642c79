use crate::consts::MEMPOOL_HEIGHT;
use crate::schemas::{TxInRow, TxOutRow, TxRow};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Logical write contract of the analytical store.
///
/// Rows are buffered per table for one cycle, committed into staging, then
/// merged into the canonical tables.
pub trait AnalyticStore: Send + Sync {
    /// Recreate the staging tables and open this cycle's batches.
    fn prepare(&self) -> Result<()>;
    fn stage_txs(&self, rows: Vec<TxRow>) -> Result<()>;
    fn stage_outputs(&self, rows: Vec<TxOutRow>) -> Result<()>;
    fn stage_inputs(&self, rows: Vec<TxInRow>) -> Result<()>;
    /// Commit the tx + output batches. On error the rows stay buffered for a retry.
    fn commit_summary(&self) -> Result<()>;
    /// Commit the input-detail batch when `keep`, otherwise roll it back.
    fn finish_inputs(&self, keep: bool) -> Result<()>;
    /// Move committed staging rows into the canonical tables.
    fn merge_staged(&self) -> Result<()>;
    /// Delete every canonical row at the unconfirmed height.
    fn purge_unconfirmed(&self) -> Result<usize>;
}

/// One cycle's buffered rows.
#[derive(Default)]
pub struct StagingBuffers {
    pub txs: Vec<TxRow>,
    pub outputs: Vec<TxOutRow>,
    pub inputs: Vec<TxInRow>,
}

impl StagingBuffers {
    pub fn clear(&mut self) {
        self.txs.clear();
        self.outputs.clear();
        self.inputs.clear();
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

const CANONICAL_DDL: &str = "
CREATE TABLE IF NOT EXISTS blktx_height (
    txid BLOB NOT NULL, nin INTEGER, nout INTEGER, txsize INTEGER, locktime INTEGER,
    invalue INTEGER, outvalue INTEGER, rawtx BLOB, height INTEGER NOT NULL, txidx INTEGER
);
CREATE TABLE IF NOT EXISTS txout (
    utxid BLOB NOT NULL, vout INTEGER, address BLOB, codehash BLOB, genesis BLOB,
    data_value INTEGER, satoshi INTEGER, script_type TEXT, script_pk BLOB,
    height INTEGER NOT NULL, utxidx INTEGER
);
CREATE TABLE IF NOT EXISTS txin (
    height INTEGER NOT NULL, txidx INTEGER, txid BLOB NOT NULL, idx INTEGER, script_sig BLOB,
    nsequence INTEGER, height_txo INTEGER, utxidx INTEGER, utxid BLOB, vout INTEGER,
    address BLOB, codehash BLOB, genesis BLOB, data_value INTEGER, satoshi INTEGER,
    script_type TEXT, script_pk BLOB
);
CREATE TABLE IF NOT EXISTS txin_spent (
    height INTEGER NOT NULL, txid BLOB NOT NULL, idx INTEGER, utxid BLOB, vout INTEGER
);
CREATE INDEX IF NOT EXISTS blktx_height_h ON blktx_height(height);
CREATE INDEX IF NOT EXISTS txout_h ON txout(height);
CREATE INDEX IF NOT EXISTS txin_h ON txin(height);
CREATE INDEX IF NOT EXISTS txin_spent_h ON txin_spent(height);
CREATE INDEX IF NOT EXISTS txin_spent_outpoint ON txin_spent(utxid, vout);
";

const STAGING_DDL: &str = "
DROP TABLE IF EXISTS blktx_height_mempool_new;
DROP TABLE IF EXISTS txout_mempool_new;
DROP TABLE IF EXISTS txin_mempool_new;
CREATE TABLE blktx_height_mempool_new AS SELECT * FROM blktx_height WHERE 0;
CREATE TABLE txout_mempool_new AS SELECT * FROM txout WHERE 0;
CREATE TABLE txin_mempool_new AS SELECT * FROM txin WHERE 0;
";

const MERGE_SQL: &str = "
INSERT INTO txin SELECT * FROM txin_mempool_new;
INSERT INTO txin_spent (height, txid, idx, utxid, vout)
    SELECT height, txid, idx, utxid, vout FROM txin_mempool_new;
INSERT INTO txout SELECT * FROM txout_mempool_new;
INSERT INTO blktx_height SELECT * FROM blktx_height_mempool_new;
DROP TABLE txin_mempool_new;
DROP TABLE txout_mempool_new;
DROP TABLE blktx_height_mempool_new;
";

pub const CANONICAL_TABLES: [&str; 4] = ["blktx_height", "txout", "txin", "txin_spent"];

/// Token amounts use the whole u64 range; stored bit for bit.
fn sql_u64(v: u64) -> i64 {
    v as i64
}

/// SQLite-backed store.
pub struct SqliteAnalyticStore {
    conn: Mutex<Connection>,
    buffers: Mutex<StagingBuffers>,
}

impl SqliteAnalyticStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("opening analytic store {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .context("enabling WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CANONICAL_DDL).context("creating canonical tables")?;
        Ok(Self { conn: Mutex::new(conn), buffers: Mutex::new(StagingBuffers::default()) })
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        let known = CANONICAL_TABLES.contains(&table) || table.ends_with("_mempool_new");
        if !known {
            bail!("unknown table {table}");
        }
        let conn = lock(&self.conn);
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn count_unconfirmed(&self) -> Result<u64> {
        let conn = lock(&self.conn);
        let mut total = 0u64;
        for table in CANONICAL_TABLES {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE height >= ?1"),
                [MEMPOOL_HEIGHT],
                |r| r.get(0),
            )?;
            total += n as u64;
        }
        Ok(total)
    }

    fn insert_summary(conn: &mut Connection, txs: &[TxRow], outputs: &[TxOutRow]) -> Result<()> {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO blktx_height_mempool_new
                 (txid, nin, nout, txsize, locktime, invalue, outvalue, rawtx, height, txidx)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for r in txs {
                stmt.execute(params![
                    r.txid,
                    r.nin,
                    r.nout,
                    r.txsize,
                    r.locktime,
                    sql_u64(r.invalue),
                    sql_u64(r.outvalue),
                    r.rawtx,
                    r.height,
                    sql_u64(r.txidx),
                ])?;
            }
            let mut stmt = tx.prepare_cached(
                "INSERT INTO txout_mempool_new
                 (utxid, vout, address, codehash, genesis, data_value, satoshi, script_type,
                  script_pk, height, utxidx)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for r in outputs {
                stmt.execute(params![
                    r.utxid,
                    r.vout,
                    r.address,
                    r.codehash,
                    r.genesis,
                    sql_u64(r.data_value),
                    sql_u64(r.satoshi),
                    r.script_type.tag(),
                    r.script_pk,
                    r.height,
                    sql_u64(r.utxidx),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_inputs(conn: &mut Connection, inputs: &[TxInRow]) -> Result<()> {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO txin_mempool_new
                 (height, txidx, txid, idx, script_sig, nsequence, height_txo, utxidx, utxid, vout,
                  address, codehash, genesis, data_value, satoshi, script_type, script_pk)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;
            for r in inputs {
                stmt.execute(params![
                    r.height,
                    sql_u64(r.txidx),
                    r.txid,
                    r.idx,
                    r.script_sig,
                    r.nsequence,
                    r.height_txo,
                    sql_u64(r.utxidx),
                    r.utxid,
                    r.vout,
                    r.address,
                    r.codehash,
                    r.genesis,
                    sql_u64(r.data_value),
                    sql_u64(r.satoshi),
                    r.script_type.tag(),
                    r.script_pk,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl AnalyticStore for SqliteAnalyticStore {
    fn prepare(&self) -> Result<()> {
        lock(&self.buffers).clear();
        lock(&self.conn).execute_batch(STAGING_DDL).context("recreating staging tables")
    }

    fn stage_txs(&self, rows: Vec<TxRow>) -> Result<()> {
        lock(&self.buffers).txs.extend(rows);
        Ok(())
    }

    fn stage_outputs(&self, rows: Vec<TxOutRow>) -> Result<()> {
        lock(&self.buffers).outputs.extend(rows);
        Ok(())
    }

    fn stage_inputs(&self, rows: Vec<TxInRow>) -> Result<()> {
        lock(&self.buffers).inputs.extend(rows);
        Ok(())
    }

    fn commit_summary(&self) -> Result<()> {
        let mut buf = lock(&self.buffers);
        let mut conn = lock(&self.conn);
        Self::insert_summary(&mut conn, &buf.txs, &buf.outputs).context("summary commit")?;
        debug!("[store] committed {} tx rows, {} output rows", buf.txs.len(), buf.outputs.len());
        buf.txs.clear();
        buf.outputs.clear();
        Ok(())
    }

    fn finish_inputs(&self, keep: bool) -> Result<()> {
        let mut buf = lock(&self.buffers);
        if keep {
            let mut conn = lock(&self.conn);
            Self::insert_inputs(&mut conn, &buf.inputs).context("input commit")?;
            debug!("[store] committed {} input rows", buf.inputs.len());
        } else if !buf.inputs.is_empty() {
            debug!("[store] rolled back {} input rows", buf.inputs.len());
        }
        buf.inputs.clear();
        Ok(())
    }

    fn merge_staged(&self) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        tx.execute_batch(MERGE_SQL).context("merging staging tables")?;
        tx.commit()?;
        Ok(())
    }

    fn purge_unconfirmed(&self) -> Result<usize> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let mut removed = 0usize;
        for table in CANONICAL_TABLES {
            removed += tx.execute(&format!("DELETE FROM {table} WHERE height >= ?1"), [MEMPOOL_HEIGHT])?;
        }
        tx.commit()?;
        info!("[store] purged {removed} unconfirmed rows");
        Ok(removed)
    }
}

/// Discards everything; used when neither sync nor dump is enabled.
pub struct NullStore;

impl AnalyticStore for NullStore {
    fn prepare(&self) -> Result<()> {
        Ok(())
    }
    fn stage_txs(&self, _rows: Vec<TxRow>) -> Result<()> {
        Ok(())
    }
    fn stage_outputs(&self, _rows: Vec<TxOutRow>) -> Result<()> {
        Ok(())
    }
    fn stage_inputs(&self, _rows: Vec<TxInRow>) -> Result<()> {
        Ok(())
    }
    fn commit_summary(&self) -> Result<()> {
        Ok(())
    }
    fn finish_inputs(&self, _keep: bool) -> Result<()> {
        Ok(())
    }
    fn merge_staged(&self) -> Result<()> {
        Ok(())
    }
    fn purge_unconfirmed(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Forwards every call to each inner store (sync and dump together).
pub struct FanoutStore {
    stores: Vec<Arc<dyn AnalyticStore>>,
}

impl FanoutStore {
    pub fn new(stores: Vec<Arc<dyn AnalyticStore>>) -> Self {
        Self { stores }
    }

    fn each(&self, f: impl Fn(&dyn AnalyticStore) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for s in &self.stores {
            if let Err(e) = f(s.as_ref()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl AnalyticStore for FanoutStore {
    fn prepare(&self) -> Result<()> {
        self.each(|s| s.prepare())
    }
    fn stage_txs(&self, rows: Vec<TxRow>) -> Result<()> {
        self.each(|s| s.stage_txs(rows.clone()))
    }
    fn stage_outputs(&self, rows: Vec<TxOutRow>) -> Result<()> {
        self.each(|s| s.stage_outputs(rows.clone()))
    }
    fn stage_inputs(&self, rows: Vec<TxInRow>) -> Result<()> {
        self.each(|s| s.stage_inputs(rows.clone()))
    }
    fn commit_summary(&self) -> Result<()> {
        self.each(|s| s.commit_summary())
    }
    fn finish_inputs(&self, keep: bool) -> Result<()> {
        self.each(|s| s.finish_inputs(keep))
    }
    fn merge_staged(&self) -> Result<()> {
        self.each(|s| s.merge_staged())
    }
    fn purge_unconfirmed(&self) -> Result<usize> {
        let mut total = 0;
        for s in &self.stores {
            total += s.purge_unconfirmed()?;
        }
        Ok(total)
    }
}

#[derive(Default)]
struct MemoryTables {
    staged_txs: Vec<TxRow>,
    staged_outputs: Vec<TxOutRow>,
    staged_inputs: Vec<TxInRow>,
    txs: Vec<TxRow>,
    outputs: Vec<TxOutRow>,
    inputs: Vec<TxInRow>,
    /// (txid, idx, utxid, vout)
    spent: Vec<(Vec<u8>, u32, Vec<u8>, u32)>,
}

/// In-process store with the same staging semantics; backs tests.
#[derive(Default)]
pub struct MemoryStore {
    buffers: Mutex<StagingBuffers>,
    tables: Mutex<MemoryTables>,
    fail_summary: AtomicUsize,
}

impl MemoryStore {
    /// Make the next `n` summary commits fail.
    pub fn fail_next_summary_commits(&self, n: usize) {
        self.fail_summary.store(n, Ordering::SeqCst);
    }

    pub fn merged_txs(&self) -> Vec<TxRow> {
        lock(&self.tables).txs.clone()
    }

    pub fn merged_outputs(&self) -> Vec<TxOutRow> {
        lock(&self.tables).outputs.clone()
    }

    pub fn merged_inputs(&self) -> Vec<TxInRow> {
        lock(&self.tables).inputs.clone()
    }

    pub fn merged_spent(&self) -> Vec<(Vec<u8>, u32, Vec<u8>, u32)> {
        lock(&self.tables).spent.clone()
    }
}

impl AnalyticStore for MemoryStore {
    fn prepare(&self) -> Result<()> {
        lock(&self.buffers).clear();
        let mut t = lock(&self.tables);
        t.staged_txs.clear();
        t.staged_outputs.clear();
        t.staged_inputs.clear();
        Ok(())
    }

    fn stage_txs(&self, rows: Vec<TxRow>) -> Result<()> {
        lock(&self.buffers).txs.extend(rows);
        Ok(())
    }

    fn stage_outputs(&self, rows: Vec<TxOutRow>) -> Result<()> {
        lock(&self.buffers).outputs.extend(rows);
        Ok(())
    }

    fn stage_inputs(&self, rows: Vec<TxInRow>) -> Result<()> {
        lock(&self.buffers).inputs.extend(rows);
        Ok(())
    }

    fn commit_summary(&self) -> Result<()> {
        let failing = self
            .fail_summary
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("memory store: injected summary commit failure"));
        }
        let mut buf = lock(&self.buffers);
        let mut t = lock(&self.tables);
        t.staged_txs.append(&mut buf.txs);
        t.staged_outputs.append(&mut buf.outputs);
        Ok(())
    }

    fn finish_inputs(&self, keep: bool) -> Result<()> {
        let mut buf = lock(&self.buffers);
        if keep {
            lock(&self.tables).staged_inputs.append(&mut buf.inputs);
        }
        buf.inputs.clear();
        Ok(())
    }

    fn merge_staged(&self) -> Result<()> {
        let mut t = lock(&self.tables);
        let staged_inputs = std::mem::take(&mut t.staged_inputs);
        for r in &staged_inputs {
            t.spent.push((r.txid.clone(), r.idx, r.utxid.clone(), r.vout));
        }
        t.inputs.extend(staged_inputs);
        let staged_outputs = std::mem::take(&mut t.staged_outputs);
        t.outputs.extend(staged_outputs);
        let staged_txs = std::mem::take(&mut t.staged_txs);
        t.txs.extend(staged_txs);
        Ok(())
    }

    fn purge_unconfirmed(&self) -> Result<usize> {
        let mut t = lock(&self.tables);
        let before = t.txs.len() + t.outputs.len() + t.inputs.len();
        t.txs.retain(|r| r.height < MEMPOOL_HEIGHT);
        t.outputs.retain(|r| r.height < MEMPOOL_HEIGHT);
        t.inputs.retain(|r| r.height < MEMPOOL_HEIGHT);
        let removed = before - (t.txs.len() + t.outputs.len() + t.inputs.len());
        // spend links carry no height; they only ever come from mempool inputs
        let spent = t.spent.len();
        t.spent.clear();
        Ok(removed + spent)
    }
}
