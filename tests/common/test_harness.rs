//! End-to-end harness: mock node, in-process feed, RocksDB cache and an
//! in-memory analytic store wired into a real sync controller.
use anyhow::Result;
use mempool_indexer::core::feed::{FeedSink, feed_channels};
use mempool_indexer::core::script::{ClassifierChain, ScriptClassifier};
use mempool_indexer::runtime::analytic::MemoryStore;
use mempool_indexer::runtime::mdb::open_db;
use mempool_indexer::runtime::record_pool::RecordPool;
use mempool_indexer::runtime::serial::{CycleReport, Resolver};
use mempool_indexer::runtime::sync::{CycleOutcome, SyncController};
use mempool_indexer::runtime::utxo_cache::RocksUtxoCache;
use mempool_indexer::schemas::{OutpointKey, TxHash, UtxoRecord};
use mempool_indexer::test_utils::{MockNode, TestConfigBuilder, scripts};
use std::sync::Arc;
use tempfile::TempDir;

pub struct MempoolTestHarness {
    pub node: Arc<MockNode>,
    pub sink: FeedSink,
    pub cache: Arc<RocksUtxoCache>,
    pub store: Arc<MemoryStore>,
    pub controller: SyncController,
    _dir: TempDir,
}

impl MempoolTestHarness {
    pub fn new() -> Result<Self> {
        Self::with_tracking(true)
    }

    pub fn with_tracking(track_utxo: bool) -> Result<Self> {
        let (cfg, dir) = TestConfigBuilder::new().with_utxo(track_utxo).build();
        let cache = Arc::new(RocksUtxoCache::new(
            open_db(&cfg.cache_db_path)?,
            cfg.key_grouping()?.as_ref(),
        ));
        let store = Arc::new(MemoryStore::default());
        let node = Arc::new(MockNode::new());
        let classifier: Arc<dyn ScriptClassifier> = Arc::new(ClassifierChain::default());

        let resolver = Arc::new(Resolver::new(
            cache.clone(),
            store.clone(),
            classifier.clone(),
            Arc::new(RecordPool::new(10_000)),
            cfg.resolve_options(),
        )?);

        let (sink, feed) = feed_channels(1000, 10);
        let controller =
            SyncController::new(node.clone(), feed, resolver, classifier, cfg.sync_options());

        Ok(Self { node, sink, cache, store, controller, _dir: dir })
    }

    /// Push raw transaction bytes through the feed.
    pub async fn stream(&self, raw: Vec<u8>) {
        assert!(self.sink.dispatch(raw).await, "feed consumer gone");
    }

    pub async fn announce_block(&self, hash: [u8; 32]) {
        assert!(self.sink.dispatch(hash.to_vec()).await, "feed consumer gone");
    }

    pub async fn cycle(&mut self) -> CycleOutcome {
        self.controller.run_cycle().await
    }

    /// Cycle that must process a batch.
    pub async fn processed_cycle(&mut self) -> CycleReport {
        match self.cycle().await {
            CycleOutcome::Processed(r) => r,
            other => panic!("expected a processed cycle, got {other:?}"),
        }
    }

    /// A confirmed P2PKH output the block indexer would have written.
    pub fn seed_confirmed(&self, hash: TxHash, vout: u32, satoshi: u64, owner: [u8; 20]) {
        let rec = UtxoRecord {
            height: 100,
            position: 7,
            satoshi,
            script: scripts::p2pkh(&owner),
            ..Default::default()
        };
        self.cache.put_confirmed(&OutpointKey::new(&hash, vout), &rec).unwrap();
    }
}
