use crate::bitcoind_flexible::NodeRpc;
use crate::consts::{
    DEFAULT_BATCH_WINDOW_MS, DEFAULT_BLOCK_COALESCE_MS, DEFAULT_IDLE_TIMEOUT_MS,
    FEED_FETCH_CONCURRENCY,
};
use crate::core::decoder::decode_tx;
use crate::core::feed::FeedReceivers;
use crate::core::finality::is_non_final;
use crate::core::script::ScriptClassifier;
use crate::schemas::{Tx, TxHash};
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Added,
    Duplicate,
    NonFinal,
    Invalid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    pub added: usize,
    pub duplicates: usize,
    pub non_final: usize,
    pub invalid: usize,
}

/// How a streaming accumulation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Idle timeout or batch window hit; process what was gathered.
    BatchReady,
    /// A confirmed block arrived; the controller must resync.
    BlockReady,
    /// The feed is gone and nothing is pending.
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamOptions {
    pub idle_timeout: Duration,
    pub batch_window: Duration,
    pub block_coalesce: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            batch_window: Duration::from_millis(DEFAULT_BATCH_WINDOW_MS),
            block_coalesce: Duration::from_millis(DEFAULT_BLOCK_COALESCE_MS),
        }
    }
}

/// One cycle's working set: ordered transactions plus the dedup and skip sets.
#[derive(Default)]
pub struct MempoolBatch {
    pub txs: Vec<Tx>,
    seen: HashSet<TxHash>,
    skip: HashSet<TxHash>,
    stats: AccumulatorStats,
}

impl MempoolBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a batch that drops anything an earlier cycle already projected.
    pub fn with_projected(projected: HashSet<TxHash>) -> Self {
        Self { seen: projected, ..Self::default() }
    }

    /// Split into the transactions to resolve and every hash that counts as
    /// projected once they are. Non-final hashes stay out so a later cycle
    /// can take them.
    pub fn into_parts(self) -> (Vec<Tx>, HashSet<TxHash>) {
        let mut projected = self.seen;
        for h in &self.skip {
            projected.remove(h);
        }
        (self.txs, projected)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn stats(&self) -> AccumulatorStats {
        self.stats
    }

    pub fn skipped(&self) -> &HashSet<TxHash> {
        &self.skip
    }

    /// Decode, dedup and finality-filter one raw transaction, in arrival order.
    pub fn push_raw(&mut self, raw: Vec<u8>, classifier: &dyn ScriptClassifier) -> PushOutcome {
        let len = raw.len();
        let tx = match decode_tx(raw, classifier) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("[mempool] dropping undecodable tx ({len} bytes): {e}");
                self.stats.invalid += 1;
                return PushOutcome::Invalid;
            }
        };

        if !self.seen.insert(tx.hash) {
            debug!("[mempool] dropping duplicate tx {}", tx.hash_hex);
            self.stats.duplicates += 1;
            return PushOutcome::Duplicate;
        }

        if is_non_final(&tx, &self.skip) {
            debug!("[mempool] skipping non-final tx {}", tx.hash_hex);
            self.skip.insert(tx.hash);
            self.stats.non_final += 1;
            return PushOutcome::NonFinal;
        }

        self.txs.push(tx);
        self.stats.added += 1;
        PushOutcome::Added
    }

    /// Snapshot the node's whole mempool. Queued stream data is discarded first.
    pub async fn load_from_node(
        &mut self,
        node: Arc<dyn NodeRpc>,
        feed: &mut FeedReceivers,
        classifier: &dyn ScriptClassifier,
    ) -> usize {
        let stale = feed.drain_stale();
        if stale > 0 {
            debug!("[mempool] drained {stale} stale streamed txs");
        }

        let lister = node.clone();
        let txids = match tokio::task::spawn_blocking(move || lister.list_pending_txids()).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                warn!("[mempool] listing pending txs failed: {e:?}");
                return 0;
            }
            Err(e) => {
                warn!("[mempool] listing task panicked: {e:?}");
                return 0;
            }
        };
        let total = txids.len();
        info!("[mempool] bulk loading {total} pending txs");

        // `buffered` keeps node order, which the non-final cascade relies on
        let mut fetched = stream::iter(txids)
            .map(|txid| {
                let node = node.clone();
                async move {
                    let res = tokio::task::spawn_blocking(move || node.fetch_raw_tx(&txid)).await;
                    (txid, res)
                }
            })
            .buffered(FEED_FETCH_CONCURRENCY);

        let before = self.stats.added;
        let mut failed = 0usize;
        while let Some((txid, res)) = fetched.next().await {
            match res {
                Ok(Ok(raw)) => {
                    self.push_raw(raw, classifier);
                }
                Ok(Err(e)) => {
                    failed += 1;
                    warn!("[mempool] fetch {txid} failed: {e:?}");
                }
                Err(e) => {
                    failed += 1;
                    warn!("[mempool] fetch task for {txid} panicked: {e:?}");
                }
            }
        }
        let added = self.stats.added - before;
        info!(
            "[mempool] bulk load done: listed={total} added={added} fetch_failed={failed} non_final={} invalid={}",
            self.stats.non_final, self.stats.invalid
        );
        added
    }

    /// Accumulate from the push feed until the batch closes.
    ///
    /// Both timers start with the first received item; an empty batch waits
    /// indefinitely. A block notification wins over queued transactions.
    pub async fn sync_from_stream(
        &mut self,
        feed: &mut FeedReceivers,
        classifier: &dyn ScriptClassifier,
        opts: &StreamOptions,
    ) -> StreamOutcome {
        let mut first_at: Option<Instant> = None;
        let mut blocks_open = true;

        loop {
            let deadline = first_at
                .map(|first| (Instant::now() + opts.idle_timeout).min(first + opts.batch_window));

            tokio::select! {
                biased;
                block = feed.blocks.recv(), if blocks_open => match block {
                    Some(_) => {
                        let extra = feed.coalesce_blocks(opts.block_coalesce).await;
                        info!(
                            "[mempool] block notification (+{extra} coalesced), dropping {} gathered txs",
                            self.txs.len()
                        );
                        return StreamOutcome::BlockReady;
                    }
                    None => {
                        warn!("[mempool] block feed closed");
                        blocks_open = false;
                    }
                },
                raw = feed.raw_tx.recv() => match raw {
                    Some(raw) => {
                        first_at.get_or_insert_with(Instant::now);
                        self.push_raw(raw, classifier);
                    }
                    None => {
                        return if first_at.is_some() {
                            StreamOutcome::BatchReady
                        } else {
                            StreamOutcome::Closed
                        };
                    }
                },
                _ = sleep_until_opt(deadline) => return StreamOutcome::BatchReady,
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
