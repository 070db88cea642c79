use crate::bitcoind_flexible::NodeRpc;
use crate::utils::hash256;
use anyhow::{Result, anyhow};
use bitcoincore_rpc::bitcoin::hashes::Hash;
use bitcoincore_rpc::bitcoin::{BlockHash, Txid};
use std::collections::HashSet;
use std::sync::Mutex;

/// In-memory stand-in for the upstream node.
/// Pending transactions are listed in insertion order.
pub struct MockNode {
    pending: Mutex<Vec<(Txid, Vec<u8>)>>,
    tip: Mutex<BlockHash>,
    failing: Mutex<HashSet<Txid>>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            tip: Mutex::new(BlockHash::all_zeros()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Add a raw transaction to the pending set and return its id.
    pub fn add_tx(&self, raw: Vec<u8>) -> Txid {
        let txid = Txid::from_byte_array(hash256(&raw));
        self.pending.lock().unwrap().push((txid, raw));
        txid
    }

    /// List an id whose raw bytes cannot be fetched.
    pub fn add_unfetchable(&self, txid: Txid) {
        self.pending.lock().unwrap().push((txid, Vec::new()));
        self.failing.lock().unwrap().insert(txid);
    }

    /// Drop everything pending (as if a block confirmed it all).
    pub fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }

    pub fn set_tip(&self, hash: [u8; 32]) {
        *self.tip.lock().unwrap() = BlockHash::from_byte_array(hash);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl NodeRpc for MockNode {
    fn list_pending_txids(&self) -> Result<Vec<Txid>> {
        Ok(self.pending.lock().unwrap().iter().map(|(t, _)| *t).collect())
    }

    fn fetch_raw_tx(&self, txid: &Txid) -> Result<Vec<u8>> {
        if self.failing.lock().unwrap().contains(txid) {
            return Err(anyhow!("mock: no such transaction {txid}"));
        }
        self.pending
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t == txid)
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| anyhow!("mock: no such transaction {txid}"))
    }

    fn best_block_hash(&self) -> Result<BlockHash> {
        Ok(*self.tip.lock().unwrap())
    }
}
