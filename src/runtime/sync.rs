use crate::bitcoind_flexible::NodeRpc;
use crate::consts::CARRYOVER_DUMP_LIMIT;
use crate::core::feed::FeedReceivers;
use crate::core::script::ScriptClassifier;
use crate::runtime::carryover::CarryoverMap;
use crate::runtime::mempool::{MempoolBatch, StreamOptions, StreamOutcome};
use crate::runtime::serial::{CycleReport, Resolver};
use crate::utils::SpeedTracker;
use crate::schemas::TxHash;
use anyhow::Result;
use log::{Level, debug, error, info, log_enabled, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Wipe the projection and rebuild it from a node snapshot.
    Full,
    /// Append whatever the push feed delivers.
    Incremental,
}

#[derive(Clone, Copy, Debug)]
pub struct SyncOptions {
    pub initial: SyncState,
    /// Loop forever; otherwise run a single cycle.
    pub run_forever: bool,
    pub stream: StreamOptions,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { initial: SyncState::Full, run_forever: true, stream: StreamOptions::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Processed(CycleReport),
    /// A block arrived mid-stream; nothing was processed.
    Resync,
    /// The feed went away.
    Closed,
}

/// Drives FULL / INCREMENTAL cycles and owns all cross-cycle state.
pub struct SyncController {
    node: Arc<dyn NodeRpc>,
    feed: FeedReceivers,
    resolver: Arc<Resolver>,
    classifier: Arc<dyn ScriptClassifier>,
    carryover: CarryoverMap,
    /// Hashes applied to the projection since the last FULL resync.
    projected: HashSet<TxHash>,
    state: SyncState,
    next_position: u64,
    opts: SyncOptions,
    speed: SpeedTracker,
}

impl SyncController {
    pub fn new(
        node: Arc<dyn NodeRpc>,
        feed: FeedReceivers,
        resolver: Arc<Resolver>,
        classifier: Arc<dyn ScriptClassifier>,
        opts: SyncOptions,
    ) -> Self {
        Self {
            node,
            feed,
            resolver,
            classifier,
            carryover: CarryoverMap::new(),
            projected: HashSet::new(),
            state: opts.initial,
            next_position: 0,
            opts,
            speed: SpeedTracker::new(Duration::from_secs(1)),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    pub fn carryover(&self) -> &CarryoverMap {
        &self.carryover
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            "[sync] starting in {:?} mode ({})",
            self.state,
            if self.opts.run_forever { "continuous" } else { "one-shot" }
        );
        loop {
            if self.run_cycle().await == CycleOutcome::Closed {
                info!("[sync] feed closed, stopping");
                return Ok(());
            }
            if !self.opts.run_forever {
                return Ok(());
            }
        }
    }

    /// One pass of the state machine.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.state == SyncState::Full {
            self.enter_full().await;
        }
        let mut batch = MempoolBatch::with_projected(std::mem::take(&mut self.projected));
        match self.state {
            SyncState::Full => {
                batch
                    .load_from_node(self.node.clone(), &mut self.feed, self.classifier.as_ref())
                    .await;
                self.purge_store().await;
            }
            SyncState::Incremental => {
                let outcome = batch
                    .sync_from_stream(&mut self.feed, self.classifier.as_ref(), &self.opts.stream)
                    .await;
                match outcome {
                    StreamOutcome::BatchReady => {}
                    StreamOutcome::BlockReady => {
                        self.state = SyncState::Full;
                        return CycleOutcome::Resync;
                    }
                    StreamOutcome::Closed => return CycleOutcome::Closed,
                }
            }
        }

        let Some(report) = self.process(batch).await else {
            self.state = SyncState::Full;
            return CycleOutcome::Resync;
        };
        self.state = SyncState::Incremental;

        if self.feed.try_block().is_some() {
            let extra = self.feed.coalesce_blocks(self.opts.stream.block_coalesce).await;
            info!("[sync] block arrived during cycle (+{extra} coalesced), next cycle is FULL");
            self.state = SyncState::Full;
        }
        CycleOutcome::Processed(report)
    }

    async fn enter_full(&mut self) {
        info!("[sync] FULL resync: resetting projection");
        self.next_position = 0;
        self.carryover.clear(self.resolver.pool());
        self.projected.clear();

        let cache = self.resolver.cache().clone();
        match tokio::task::spawn_blocking(move || cache.wipe_projection()).await {
            Ok(Ok(n)) => info!("[sync] wiped {n} projection keys"),
            Ok(Err(e)) => error!("[sync] projection wipe failed: {e:?}"),
            Err(e) => error!("[sync] projection wipe task panicked: {e:?}"),
        }
    }

    async fn purge_store(&self) {
        let store = self.resolver.store().clone();
        match tokio::task::spawn_blocking(move || store.purge_unconfirmed()).await {
            Ok(Ok(n)) => debug!("[sync] purged {n} unconfirmed store rows"),
            Ok(Err(e)) => error!("[sync] store purge failed: {e:?}"),
            Err(e) => error!("[sync] store purge task panicked: {e:?}"),
        }
    }

    /// Stage the store, then resolve and persist off the executor.
    /// `None` means resolution panicked and cross-cycle state is gone.
    async fn process(&mut self, batch: MempoolBatch) -> Option<CycleReport> {
        let stats = batch.stats();
        let store = self.resolver.store().clone();
        match tokio::task::spawn_blocking(move || store.prepare()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[sync] store prepare failed: {e:?}"),
            Err(e) => warn!("[sync] store prepare task panicked: {e:?}"),
        }

        let resolver = self.resolver.clone();
        let mut carryover = std::mem::take(&mut self.carryover);
        let start = self.next_position;
        let (mut txs, projected) = batch.into_parts();
        self.projected = projected;

        let joined = tokio::task::spawn_blocking(move || {
            let report = resolver.process_batch(&mut txs, &mut carryover, start);
            (carryover, report)
        })
        .await;

        let (carryover, report) = match joined {
            Ok(v) => v,
            Err(e) => {
                error!("[sync] resolution panicked, forcing FULL resync: {e:?}");
                return None;
            }
        };
        self.carryover = carryover;
        self.next_position += report.txs as u64;

        info!(
            "[sync] cycle done: txs={} dup={} non_final={} invalid={} new={} removed={} spent={} \
             self_cancelled={} anomalies={} input_rows={} cache_ok={} store_ok={}",
            report.txs,
            stats.duplicates,
            stats.non_final,
            stats.invalid,
            report.new,
            report.removed,
            report.spent,
            report.self_cancelled,
            report.anomalies,
            report.input_rows,
            report.cache_ok,
            report.store_ok
        );
        if let Some(line) = self.speed.record(report.txs, self.carryover.len()) {
            info!("[sync] {line}");
        }
        if log_enabled!(Level::Debug) {
            let pool = self.resolver.pool().stats();
            debug!(
                "[sync] record pool acquired={} reused={} idle={}",
                pool.acquired, pool.reused, pool.idle
            );
            for line in self.carryover.dump_lines(CARRYOVER_DUMP_LIMIT) {
                debug!("[sync] carryover {line}");
            }
        }
        Some(report)
    }
}
