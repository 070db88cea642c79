use crate::bitcoind_flexible::NodeRpc;
use crate::consts::{FEED_FETCH_CONCURRENCY, MIN_RAW_TX_PAYLOAD};
use anyhow::{Context, Result};
use bitcoincore_rpc::bitcoin::hashes::Hash;
use bitcoincore_rpc::bitcoin::{BlockHash, Txid};
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::time::{Instant, timeout_at};

/// What a push-feed payload turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    RawTx(Vec<u8>),
    Block([u8; 32]),
    /// Topic names and sequence counters.
    Framing,
}

/// 32 bytes is a block hash, anything shorter than a minimal transaction is framing.
pub fn classify_payload(payload: Vec<u8>) -> FeedMessage {
    match payload.len() {
        32 => {
            let mut h = [0u8; 32];
            h.copy_from_slice(&payload);
            FeedMessage::Block(h)
        }
        n if n < MIN_RAW_TX_PAYLOAD => FeedMessage::Framing,
        _ => FeedMessage::RawTx(payload),
    }
}

pub fn feed_channels(raw_capacity: usize, block_capacity: usize) -> (FeedSink, FeedReceivers) {
    let (raw_tx, raw_rx) = mpsc::channel(raw_capacity);
    let (block_tx, block_rx) = mpsc::channel(block_capacity);
    (
        FeedSink { raw_tx, blocks: block_tx },
        FeedReceivers { raw_tx: raw_rx, blocks: block_rx, raw_capacity },
    )
}

/// Producer half: transports push every payload through [`FeedSink::dispatch`].
#[derive(Clone)]
pub struct FeedSink {
    raw_tx: mpsc::Sender<Vec<u8>>,
    blocks: mpsc::Sender<[u8; 32]>,
}

impl FeedSink {
    /// Route one payload. Returns `false` once the consumer side is gone.
    pub async fn dispatch(&self, payload: Vec<u8>) -> bool {
        match classify_payload(payload) {
            FeedMessage::RawTx(raw) => self.raw_tx.send(raw).await.is_ok(),
            FeedMessage::Block(hash) => match self.blocks.try_send(hash) {
                Ok(()) => true,
                // a full queue already guarantees a FULL resync
                Err(TrySendError::Full(_)) => {
                    debug!("[feed] block queue full, dropping notification");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
            FeedMessage::Framing => true,
        }
    }
}

/// Consumer half, owned by the sync controller.
pub struct FeedReceivers {
    pub raw_tx: mpsc::Receiver<Vec<u8>>,
    pub blocks: mpsc::Receiver<[u8; 32]>,
    raw_capacity: usize,
}

impl FeedReceivers {
    /// Discard queued raw transactions; a bulk load is about to supersede them.
    pub fn drain_stale(&mut self) -> usize {
        let mut dropped = 0usize;
        while dropped < self.raw_capacity {
            match self.raw_tx.try_recv() {
                Ok(_) => dropped += 1,
                Err(_) => break,
            }
        }
        dropped
    }

    /// Swallow further block notifications that arrive within `window`.
    pub async fn coalesce_blocks(&mut self, window: Duration) -> usize {
        let deadline = Instant::now() + window;
        let mut extra = 0usize;
        while let Ok(Some(_)) = timeout_at(deadline, self.blocks.recv()).await {
            extra += 1;
        }
        extra
    }

    /// Non-blocking check for a pending block notification.
    pub fn try_block(&mut self) -> Option<[u8; 32]> {
        match self.blocks.try_recv() {
            Ok(h) => Some(h),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Transport that polls the node instead of subscribing to a push feed.
pub struct PollingFeed {
    node: Arc<dyn NodeRpc>,
    sink: FeedSink,
    interval: Duration,
    seen: HashSet<Txid>,
    tip: Option<BlockHash>,
}

impl PollingFeed {
    pub fn new(node: Arc<dyn NodeRpc>, sink: FeedSink, interval: Duration) -> Self {
        Self { node, sink, interval, seen: HashSet::new(), tip: None }
    }

    pub async fn run(mut self) -> Result<()> {
        info!("[feed] polling node every {}ms", self.interval.as_millis());
        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    info!("[feed] consumer closed, stopping");
                    return Ok(());
                }
                Err(e) => warn!("[feed] poll failed: {e:?}"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One poll. Returns `Ok(false)` when the consumer has gone away.
    ///
    /// The first poll emits everything pending. Whatever a bulk load already
    /// picked up is dropped downstream as a duplicate.
    pub async fn poll_once(&mut self) -> Result<bool> {
        let node = self.node.clone();
        let best = tokio::task::spawn_blocking(move || node.best_block_hash())
            .await
            .context("best block task panicked")??;
        if self.tip.is_some_and(|t| t != best) {
            info!("[feed] new tip {best}");
            if !self.sink.dispatch(best.to_byte_array().to_vec()).await {
                return Ok(false);
            }
        }
        self.tip = Some(best);

        let node = self.node.clone();
        let pending = tokio::task::spawn_blocking(move || node.list_pending_txids())
            .await
            .context("mempool list task panicked")??;
        let pending: HashSet<Txid> = pending.into_iter().collect();
        self.seen.retain(|t| pending.contains(t));

        let fresh: Vec<Txid> = pending.into_iter().filter(|t| !self.seen.contains(t)).collect();
        if fresh.is_empty() {
            return Ok(true);
        }
        debug!("[feed] {} new pending txs", fresh.len());

        let node = self.node.clone();
        let mut fetched = stream::iter(fresh)
            .map(|txid| {
                let node = node.clone();
                async move {
                    let res = tokio::task::spawn_blocking(move || node.fetch_raw_tx(&txid)).await;
                    (txid, res)
                }
            })
            .buffer_unordered(FEED_FETCH_CONCURRENCY);

        while let Some((txid, res)) = fetched.next().await {
            match res {
                Ok(Ok(raw)) => {
                    self.seen.insert(txid);
                    if !self.sink.dispatch(raw).await {
                        return Ok(false);
                    }
                }
                Ok(Err(e)) => warn!("[feed] fetch {txid} failed: {e:?}"),
                Err(e) => warn!("[feed] fetch task for {txid} panicked: {e:?}"),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockNode, TxBuilder};

    #[test]
    fn payloads_are_classified_by_length() {
        assert_eq!(classify_payload(vec![1; 32]), FeedMessage::Block([1; 32]));
        assert_eq!(classify_payload(b"rawtx".to_vec()), FeedMessage::Framing);
        assert_eq!(classify_payload(vec![0, 0, 0, 1]), FeedMessage::Framing);
        assert_eq!(classify_payload(vec![7; 60]), FeedMessage::RawTx(vec![7; 60]));
    }

    #[tokio::test]
    async fn dispatch_routes_and_ignores_framing() {
        let (sink, mut rx) = feed_channels(8, 2);
        assert!(sink.dispatch(b"hashblock".to_vec()).await);
        assert!(sink.dispatch(vec![5; 32]).await);
        assert!(sink.dispatch(vec![6; 80]).await);
        assert_eq!(rx.blocks.try_recv().unwrap(), [5; 32]);
        assert_eq!(rx.raw_tx.try_recv().unwrap(), vec![6; 80]);
        assert!(rx.raw_tx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_block_queue_does_not_block() {
        let (sink, _rx) = feed_channels(1, 1);
        assert!(sink.dispatch(vec![1; 32]).await);
        assert!(sink.dispatch(vec![2; 32]).await);
    }

    #[tokio::test]
    async fn drain_and_coalesce() {
        let (sink, mut rx) = feed_channels(8, 8);
        for i in 0..3u8 {
            sink.dispatch(vec![i; 40]).await;
        }
        assert_eq!(rx.drain_stale(), 3);

        sink.dispatch(vec![1; 32]).await;
        sink.dispatch(vec![2; 32]).await;
        sink.dispatch(vec![3; 32]).await;
        assert!(rx.try_block().is_some());
        assert_eq!(rx.coalesce_blocks(Duration::from_millis(20)).await, 2);
        assert!(rx.try_block().is_none());
    }

    #[tokio::test]
    async fn polling_feed_emits_new_txs_and_tip_changes() {
        let node = Arc::new(MockNode::new());
        let first = TxBuilder::simple([1; 32], 0, 10).build();
        node.add_tx(first.clone());

        let (sink, mut rx) = feed_channels(16, 4);
        let mut feed = PollingFeed::new(node.clone(), sink, Duration::from_millis(1));

        assert!(feed.poll_once().await.unwrap());
        assert_eq!(rx.raw_tx.try_recv().unwrap(), first);
        assert!(feed.poll_once().await.unwrap());
        assert!(rx.raw_tx.try_recv().is_err(), "already emitted");

        let second = TxBuilder::simple([2; 32], 0, 20).build();
        node.add_tx(second.clone());
        assert!(feed.poll_once().await.unwrap());
        assert_eq!(rx.raw_tx.try_recv().unwrap(), second);
        assert!(rx.try_block().is_none());

        node.set_tip([9; 32]);
        assert!(feed.poll_once().await.unwrap());
        assert_eq!(rx.try_block(), Some([9; 32]));
    }
}
