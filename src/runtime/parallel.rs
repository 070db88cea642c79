use crate::runtime::record_pool::RecordPool;
use crate::schemas::{OutpointKey, Tx, UtxoRecord};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Output of the order-independent stage.
#[derive(Default)]
pub struct StagedBatch {
    /// Every outpoint some input in the batch consumes.
    pub spent_keys: HashSet<OutpointKey>,
    /// Candidate UTXOs for every spendable output, keyed by outpoint.
    pub new: HashMap<OutpointKey, UtxoRecord>,
}

struct TxStage {
    spent: Vec<OutpointKey>,
    created: Vec<(OutpointKey, UtxoRecord)>,
}

fn stage_tx(position: u64, tx: &Tx, pool: &RecordPool) -> TxStage {
    let spendable = tx.outputs.iter().filter(|o| !o.unspendable);
    let mut blanks = pool.acquire_many(spendable.clone().count()).into_iter();
    let created = spendable
        .map(|out| {
            let mut rec = blanks.next().unwrap_or_default();
            rec.fill_from_output(out, position);
            (out.outpoint, rec)
        })
        .collect();
    TxStage { spent: tx.inputs.iter().map(|input| input.spent_key).collect(), created }
}

/// Stage spent keys and candidate records for the whole batch.
///
/// Runs on the current rayon pool; callers pick the pool with `install`.
/// Positions are `start_position + index in batch`.
pub fn stage_batch(start_position: u64, txs: &[Tx], pool: &RecordPool) -> StagedBatch {
    let results: Vec<TxStage> = txs
        .par_iter()
        .enumerate()
        .map(|(i, tx)| stage_tx(start_position + i as u64, tx, pool))
        .collect();

    let mut staged = StagedBatch::default();
    for r in results {
        staged.spent_keys.extend(r.spent);
        for (key, rec) in r.created {
            if let Some(dup) = staged.new.insert(key, rec) {
                pool.release(dup);
            }
        }
    }
    staged
}
