use anyhow::{Context, Result};
use log::{error, info};
use mempool_indexer::bitcoind_flexible::{FlexibleBitcoindClient, NodeRpc};
use mempool_indexer::config::{AppConfig, get_config, init_config};
use mempool_indexer::consts::{BLOCK_QUEUE_CAPACITY, RAW_TX_QUEUE_CAPACITY};
use mempool_indexer::core::feed::{PollingFeed, feed_channels};
use mempool_indexer::core::script::{ClassifierChain, ScriptClassifier};
use mempool_indexer::runtime::analytic::{
    AnalyticStore, FanoutStore, NullStore, SqliteAnalyticStore,
};
use mempool_indexer::runtime::dump::JsonlDumpStore;
use mempool_indexer::runtime::mdb::open_db;
use mempool_indexer::runtime::record_pool::RecordPool;
use mempool_indexer::runtime::serial::Resolver;
use mempool_indexer::runtime::sync::SyncController;
use mempool_indexer::runtime::utxo_cache::RocksUtxoCache;
use std::sync::Arc;
use tokio::runtime::Builder as TokioBuilder;

fn build_store(cfg: &AppConfig) -> Result<Arc<dyn AnalyticStore>> {
    let mut stores: Vec<Arc<dyn AnalyticStore>> = Vec::new();
    if cfg.sync {
        stores.push(Arc::new(SqliteAnalyticStore::open(&cfg.store_path)?));
        info!("[store] analytic store at {}", cfg.store_path);
    }
    if cfg.dump {
        stores.push(Arc::new(JsonlDumpStore::new(&cfg.dump_dir)?));
        info!("[store] dumping rows to {}", cfg.dump_dir);
    }
    Ok(match stores.len() {
        0 => Arc::new(NullStore),
        1 => stores.remove(0),
        _ => Arc::new(FanoutStore::new(stores)),
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    init_config()?;
    let cfg = get_config().context("config not initialized")?.clone();

    // blocking HTTP client; build before the runtime exists
    let node: Arc<dyn NodeRpc> =
        Arc::new(FlexibleBitcoindClient::new(&cfg.bitcoind_rpc_url, cfg.rpc_auth())?);

    let db = open_db(&cfg.cache_db_path)
        .with_context(|| format!("opening cache db at {}", cfg.cache_db_path))?;
    let grouping = cfg.key_grouping()?;
    let cache = Arc::new(RocksUtxoCache::new(db, grouping.as_ref()));
    let store = build_store(&cfg)?;

    let classifier: Arc<dyn ScriptClassifier> = Arc::new(ClassifierChain::default());
    let resolver = Arc::new(Resolver::new(
        cache,
        store,
        classifier.clone(),
        Arc::new(RecordPool::default()),
        cfg.resolve_options(),
    )?);
    info!(
        "[main] utxo tracking {}, {} workers, key grouping {}",
        if cfg.utxo { "on" } else { "off" },
        cfg.parallel_workers,
        cfg.key_grouping
    );

    let rt = TokioBuilder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let (sink, feed) = feed_channels(RAW_TX_QUEUE_CAPACITY, BLOCK_QUEUE_CAPACITY);
        let poller = PollingFeed::new(node.clone(), sink, cfg.feed_poll_interval());
        tokio::spawn(async move {
            if let Err(e) = poller.run().await {
                error!("[feed] stopped: {e:?}");
            }
        });

        SyncController::new(node, feed, resolver, classifier, cfg.sync_options()).run().await
    })
}
