use crate::runtime::analytic::{AnalyticStore, StagingBuffers, lock};
use crate::schemas::{TxInRow, TxOutRow, TxRow};
use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const TX_FILE: &str = "tx.jsonl";
pub const TXOUT_FILE: &str = "txout.jsonl";
pub const TXIN_FILE: &str = "txin.jsonl";

/// Appends committed rows as JSON lines; nothing is ever purged.
pub struct JsonlDumpStore {
    dir: PathBuf,
    buffers: Mutex<StagingBuffers>,
}

impl JsonlDumpStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating dump dir {}", dir.display()))?;
        Ok(Self { dir, buffers: Mutex::new(StagingBuffers::default()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append<T: Serialize>(&self, file: &str, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(file);
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut w = BufWriter::new(f);
        for row in rows {
            serde_json::to_writer(&mut w, row)?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
        debug!("[store] dumped {} rows to {}", rows.len(), path.display());
        Ok(())
    }
}

impl AnalyticStore for JsonlDumpStore {
    fn prepare(&self) -> Result<()> {
        lock(&self.buffers).clear();
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
        let mut buf = lock(&self.buffers);
        self.append(TX_FILE, &buf.txs)?;
        buf.txs.clear();
        self.append(TXOUT_FILE, &buf.outputs)?;
        buf.outputs.clear();
        Ok(())
    }

    fn finish_inputs(&self, keep: bool) -> Result<()> {
        let mut buf = lock(&self.buffers);
        if keep {
            self.append(TXIN_FILE, &buf.inputs)?;
        }
        buf.inputs.clear();
        Ok(())
    }

    fn merge_staged(&self) -> Result<()> {
        Ok(())
    }

    fn purge_unconfirmed(&self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MEMPOOL_HEIGHT;
    use tempfile::TempDir;

    #[test]
    fn committed_rows_land_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let store = JsonlDumpStore::new(dir.path().join("dump")).unwrap();
        store.prepare().unwrap();
        let row = TxRow {
            txid: vec![0xab; 32],
            nin: 1,
            nout: 2,
            txsize: 100,
            locktime: 0,
            invalue: 5,
            outvalue: 4,
            rawtx: vec![1, 2],
            height: MEMPOOL_HEIGHT,
            txidx: 3,
        };
        store.stage_txs(vec![row.clone(), row.clone()]).unwrap();
        store.commit_summary().unwrap();
        store.finish_inputs(false).unwrap();

        let text = fs::read_to_string(store.dir().join(TX_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: TxRow = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back, row);
        assert!(lines[0].contains(&"ab".repeat(32)));
        assert!(!store.dir().join(TXIN_FILE).exists());
    }
}
