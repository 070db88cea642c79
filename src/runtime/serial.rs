use crate::consts::{MEMPOOL_HEIGHT, SUMMARY_COMMIT_ATTEMPTS};
use crate::core::script::{ScriptClassifier, classify_or_unknown};
use crate::runtime::analytic::AnalyticStore;
use crate::runtime::carryover::CarryoverMap;
use crate::runtime::parallel::{StagedBatch, stage_batch};
use crate::runtime::record_pool::RecordPool;
use crate::runtime::utxo_cache::{UtxoCache, UtxoDelta};
use crate::schemas::{OutpointKey, TokenSummary, Tx, TxInRow, TxOutRow, TxRow, UtxoRecord};
use anyhow::{Context, Result};
use log::{debug, error, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
pub struct ResolveOptions {
    /// When off only tx and output rows are written.
    pub track_utxo: bool,
    /// Worker threads for the order-independent stage.
    pub workers: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self { track_utxo: true, workers: default_workers() }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// What one cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub txs: usize,
    /// New records handed to the cache and the carryover map.
    pub new: usize,
    pub removed: usize,
    pub spent: usize,
    pub self_cancelled: usize,
    /// Inputs resolved to a placeholder. Counted per input, not per outpoint.
    pub anomalies: usize,
    pub input_rows: usize,
    pub tokens: usize,
    pub cache_ok: bool,
    pub store_ok: bool,
}

/// Records found for spent keys that this batch did not create.
#[derive(Default)]
pub struct SpentLookup {
    /// Evicted from the carryover map.
    pub removed: HashMap<OutpointKey, UtxoRecord>,
    /// Confirmed outputs from the cache.
    pub spent: HashMap<OutpointKey, UtxoRecord>,
    /// Nothing knows these.
    pub missing: HashSet<OutpointKey>,
}

#[derive(Default)]
pub struct InputResolution {
    pub rows: Vec<TxInRow>,
    pub tokens: HashMap<Vec<u8>, TokenSummary>,
    pub anomalies: usize,
}

/// Summary key: `code ‖ genesis`, plus the decimal token index for NFTs.
pub fn token_summary_key(rec: &UtxoRecord) -> Vec<u8> {
    let mut key = rec.token_id();
    if rec.is_nft() {
        key.extend_from_slice(rec.data_value.to_string().as_bytes());
    }
    key
}

/// The ordered half of a cycle plus both persistence adapters.
pub struct Resolver {
    cache: Arc<dyn UtxoCache>,
    store: Arc<dyn AnalyticStore>,
    classifier: Arc<dyn ScriptClassifier>,
    pool: Arc<RecordPool>,
    threads: ThreadPool,
    opts: ResolveOptions,
}

impl Resolver {
    pub fn new(
        cache: Arc<dyn UtxoCache>,
        store: Arc<dyn AnalyticStore>,
        classifier: Arc<dyn ScriptClassifier>,
        pool: Arc<RecordPool>,
        opts: ResolveOptions,
    ) -> Result<Self> {
        let threads = ThreadPoolBuilder::new()
            .num_threads(opts.workers.max(1))
            .thread_name(|i| format!("resolve-{i}"))
            .build()
            .context("build resolver thread pool")?;
        Ok(Self { cache, store, classifier, pool, threads, opts })
    }

    pub fn pool(&self) -> &Arc<RecordPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<dyn UtxoCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn AnalyticStore> {
        &self.store
    }

    pub fn options(&self) -> ResolveOptions {
        self.opts
    }

    /// Run one batch end to end. `start_position` is the position of `txs[0]`.
    pub fn process_batch(
        &self,
        txs: &mut [Tx],
        carryover: &mut CarryoverMap,
        start_position: u64,
    ) -> CycleReport {
        self.threads.install(|| self.run_batch(txs, carryover, start_position))
    }

    fn run_batch(
        &self,
        txs: &mut [Tx],
        carryover: &mut CarryoverMap,
        start_position: u64,
    ) -> CycleReport {
        let mut report = CycleReport { txs: txs.len(), cache_ok: true, ..Default::default() };
        let track = self.opts.track_utxo;

        let staged = if track {
            stage_batch(start_position, txs, &self.pool)
        } else {
            StagedBatch::default()
        };

        // lookup and output rows are independent
        let (lookup, outputs_ok) = rayon::join(
            || if track { self.lookup_spent(&staged, carryover) } else { SpentLookup::default() },
            || self.persist_outputs(txs, start_position),
        );

        let inputs = if track {
            self.resolve_inputs(txs, &staged, &lookup, start_position)
        } else {
            InputResolution::default()
        };
        report.anomalies = inputs.anomalies;
        report.input_rows = inputs.rows.len();
        report.tokens = inputs.tokens.len();
        for (key, t) in &inputs.tokens {
            debug!(
                "[resolve] token {} in_satoshi={} in_data_value={}",
                hex::encode(key),
                t.in_satoshi,
                t.in_data_value
            );
        }

        let mut staged_ok = outputs_ok;
        let tx_rows = tx_rows(txs, start_position);
        if let Err(e) = self.store.stage_txs(tx_rows) {
            error!("[resolve] staging tx rows failed: {e:?}");
            staged_ok = false;
        }
        if !inputs.rows.is_empty() {
            if let Err(e) = self.store.stage_inputs(inputs.rows) {
                error!("[resolve] staging input rows failed: {e:?}");
                staged_ok = false;
            }
        }
        let need_inputs = report.input_rows > 0;

        // self-cancelling records never leave the process
        let StagedBatch { spent_keys, new: mut restore } = staged;
        let cancelled: Vec<OutpointKey> =
            restore.keys().filter(|k| spent_keys.contains(*k)).copied().collect();
        report.self_cancelled = cancelled.len();
        self.pool.release_all(cancelled.iter().filter_map(|k| restore.remove(k)));

        let SpentLookup { removed, spent, missing } = lookup;
        report.new = restore.len();
        report.removed = removed.len();
        report.spent = spent.len();
        if !missing.is_empty() {
            debug!("[resolve] {} spent outpoints unresolved", missing.len());
        }

        let (cache_ok, store_ok) = rayon::join(
            || {
                if !track {
                    return true;
                }
                let delta = UtxoDelta { restore: &restore, remove: &removed, spend: &spent };
                match self.cache.apply_delta(&delta) {
                    Ok(_) => true,
                    Err(e) => {
                        error!("[resolve] cache update failed: {e:?}");
                        false
                    }
                }
            },
            || staged_ok && self.commit_store(need_inputs),
        );
        if !staged_ok {
            self.discard_store();
        }
        report.cache_ok = cache_ok;
        report.store_ok = store_ok;

        carryover.merge(restore, &self.pool);
        self.pool.release_all(removed.into_values().chain(spent.into_values()));

        report
    }

    /// Carryover first, then one confirmed-cache round-trip for the rest.
    pub fn lookup_spent(&self, staged: &StagedBatch, carryover: &mut CarryoverMap) -> SpentLookup {
        let mut out = SpentLookup::default();
        let mut remote: Vec<OutpointKey> = Vec::new();
        for key in &staged.spent_keys {
            if staged.new.contains_key(key) {
                continue;
            }
            match carryover.take(key) {
                Some(rec) => {
                    out.removed.insert(*key, rec);
                }
                None => remote.push(*key),
            }
        }
        if remote.is_empty() {
            return out;
        }

        let values = match self.cache.get_confirmed(&remote) {
            Ok(v) => v,
            Err(e) => {
                error!("[resolve] confirmed utxo lookup failed for {} keys: {e:?}", remote.len());
                out.missing.extend(remote);
                return out;
            }
        };
        for (key, value) in remote.into_iter().zip(values) {
            let Some(raw) = value else {
                out.missing.insert(key);
                continue;
            };
            let mut rec = self.pool.acquire();
            match rec.decode_into(&raw) {
                Ok(()) => {
                    let class = classify_or_unknown(self.classifier.as_ref(), &rec.script);
                    rec.apply_classification(&class);
                    out.spent.insert(key, rec);
                }
                Err(e) => {
                    warn!("[resolve] bad confirmed utxo encoding for {key}: {e}");
                    self.pool.release(rec);
                    out.missing.insert(key);
                }
            }
        }
        out
    }

    /// Ordered pass over every input: input totals, token summaries, input rows.
    pub fn resolve_inputs(
        &self,
        txs: &mut [Tx],
        staged: &StagedBatch,
        lookup: &SpentLookup,
        start_position: u64,
    ) -> InputResolution {
        let placeholder = UtxoRecord::placeholder();
        let mut out = InputResolution::default();

        for (i, tx) in txs.iter_mut().enumerate() {
            let mut in_value = 0u64;
            for (vin, input) in tx.inputs.iter().enumerate() {
                let key = &input.spent_key;
                let rec = match staged
                    .new
                    .get(key)
                    .or_else(|| lookup.removed.get(key))
                    .or_else(|| lookup.spent.get(key))
                {
                    Some(r) => r,
                    None => {
                        out.anomalies += 1;
                        warn!(
                            "[resolve] no utxo for tx {} vin {vin} spending {key}, using placeholder",
                            tx.hash_hex
                        );
                        &placeholder
                    }
                };
                in_value = in_value.saturating_add(rec.satoshi);

                if rec.has_token() {
                    let summary = out.tokens.entry(token_summary_key(rec)).or_insert_with(|| {
                        TokenSummary {
                            kind: rec.token_kind,
                            nft_index: if rec.is_nft() { rec.data_value } else { 0 },
                            code_hash: rec.code_hash.clone(),
                            genesis_id: rec.genesis_id.clone(),
                            ..Default::default()
                        }
                    });
                    summary.in_satoshi = summary.in_satoshi.saturating_add(rec.satoshi);
                    let by = if rec.is_nft() { 1 } else { rec.data_value };
                    summary.in_data_value = summary.in_data_value.saturating_add(by);
                }

                out.rows.push(TxInRow {
                    height: MEMPOOL_HEIGHT,
                    txidx: start_position + i as u64,
                    txid: tx.hash.to_vec(),
                    idx: vin as u32,
                    script_sig: input.script_sig.clone(),
                    nsequence: input.sequence,
                    height_txo: rec.height,
                    utxidx: rec.position,
                    utxid: input.prev_hash.to_vec(),
                    vout: input.prev_vout,
                    address: rec.address_pkh.clone(),
                    codehash: rec.code_hash.clone(),
                    genesis: rec.genesis_id.clone(),
                    data_value: rec.data_value,
                    satoshi: rec.satoshi,
                    script_type: rec.script_type,
                    script_pk: rec.script.clone(),
                });
            }
            tx.inputs_value = in_value;
        }
        out
    }

    fn persist_outputs(&self, txs: &mut [Tx], start_position: u64) -> bool {
        let mut rows = Vec::with_capacity(txs.iter().map(|t| t.outputs.len()).sum());
        for (i, tx) in txs.iter_mut().enumerate() {
            let mut out_value = 0u64;
            for (vout, out) in tx.outputs.iter().enumerate() {
                out_value = out_value.saturating_add(out.satoshi);
                let token = out.token();
                rows.push(TxOutRow {
                    utxid: tx.hash.to_vec(),
                    vout: vout as u32,
                    address: out.class.address_pkh.clone(),
                    codehash: token.map(|t| t.code_hash.clone()).unwrap_or_default(),
                    genesis: token.map(|t| t.genesis_id.clone()).unwrap_or_default(),
                    data_value: token.map(|t| t.data_value).unwrap_or(0),
                    satoshi: out.satoshi,
                    script_type: out.class.script_type,
                    script_pk: out.script.clone(),
                    height: MEMPOOL_HEIGHT,
                    utxidx: start_position + i as u64,
                });
            }
            tx.outputs_value = out_value;
        }
        match self.store.stage_outputs(rows) {
            Ok(()) => true,
            Err(e) => {
                error!("[resolve] staging output rows failed: {e:?}");
                false
            }
        }
    }

    /// Summary stage must land (retried); the input stage is kept only when it has rows.
    fn commit_store(&self, need_inputs: bool) -> bool {
        let mut committed = false;
        for attempt in 1..=SUMMARY_COMMIT_ATTEMPTS {
            match self.store.commit_summary() {
                Ok(()) => {
                    committed = true;
                    break;
                }
                Err(e) => warn!(
                    "[resolve] summary commit attempt {attempt}/{SUMMARY_COMMIT_ATTEMPTS} failed: {e:?}"
                ),
            }
        }
        if !committed {
            error!("[resolve] giving up on summary commit this cycle");
            self.discard_store();
            return false;
        }
        if let Err(e) = self.store.finish_inputs(need_inputs) {
            error!("[resolve] input stage commit failed: {e:?}");
            return false;
        }
        if let Err(e) = self.store.merge_staged() {
            error!("[resolve] merging staged rows failed: {e:?}");
            return false;
        }
        true
    }

    fn discard_store(&self) {
        if let Err(e) = self.store.finish_inputs(false) {
            warn!("[resolve] input stage rollback failed: {e:?}");
        }
    }
}

fn tx_rows(txs: &[Tx], start_position: u64) -> Vec<TxRow> {
    txs.iter()
        .enumerate()
        .map(|(i, tx)| TxRow {
            txid: tx.hash.to_vec(),
            nin: tx.inputs.len() as u32,
            nout: tx.outputs.len() as u32,
            txsize: tx.size,
            locktime: tx.locktime,
            invalue: tx.inputs_value,
            outvalue: tx.outputs_value,
            rawtx: tx.raw.clone(),
            height: MEMPOOL_HEIGHT,
            txidx: start_position + i as u64,
        })
        .collect()
}
