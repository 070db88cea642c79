mod common;

use anyhow::Result;
use common::{MempoolTestHarness, TxBuilder, scripts};
use mempool_indexer::consts::{
    K_BALANCE, K_SPENT_UTXO, K_UTXO, MEMPOOL_HEIGHT, SUMMARY_COMMIT_ATTEMPTS,
};
use mempool_indexer::runtime::sync::{CycleOutcome, SyncState};
use mempool_indexer::runtime::utxo_cache::UtxoCache;
use mempool_indexer::schemas::OutpointKey;
use std::collections::HashSet;

const FUNDING: [u8; 32] = [0xf0; 32];

fn member(hash: &[u8; 32], vout: u32) -> Vec<u8> {
    OutpointKey::new(hash, vout).as_bytes().to_vec()
}

/// Run the initial FULL cycle against an empty node mempool.
async fn settle(h: &mut MempoolTestHarness) {
    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 0);
    assert_eq!(h.controller.state(), SyncState::Incremental);
}

#[tokio::test]
async fn test_self_cancelling_output_never_reaches_projection() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    h.seed_confirmed(FUNDING, 0, 10_000, [0x0a; 20]);
    settle(&mut h).await;

    let a = TxBuilder::new()
        .input(FUNDING, 0, vec![], u32::MAX)
        .output(9_000, scripts::p2pkh(&[0x0b; 20]));
    let b = TxBuilder::new()
        .input(a.txid(), 0, vec![], u32::MAX)
        .output(8_000, scripts::p2pkh(&[0x0c; 20]));
    h.stream(a.build()).await;
    h.stream(b.build()).await;

    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 2);
    assert_eq!(report.self_cancelled, 1);
    assert_eq!(report.spent, 1);
    assert_eq!(report.anomalies, 0);
    assert!(report.cache_ok && report.store_ok);

    let a0 = OutpointKey::new(&a.txid(), 0);
    let b0 = OutpointKey::new(&b.txid(), 0);
    assert!(h.cache.projection_raw(&a0)?.is_none());
    assert!(!h.controller.carryover().contains(&a0));
    assert!(h.cache.projection_raw(&b0)?.is_some());
    assert!(h.controller.carryover().contains(&b0));

    let live: Vec<Vec<u8>> =
        h.cache.zset_members(&h.cache.structure_name(K_UTXO, &[]))?.into_iter().map(|(m, _)| m).collect();
    assert_eq!(live, vec![member(&b.txid(), 0)]);
    let spent = h.cache.zset_members(&h.cache.structure_name(K_SPENT_UTXO, &[]))?;
    assert_eq!(spent.len(), 1);
    assert_eq!(spent[0].0, member(&FUNDING, 0));

    // both inputs resolved: one from the confirmed set, one from the batch itself
    let inputs = h.store.merged_inputs();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0].satoshi, 10_000);
    assert_eq!(inputs[1].satoshi, 9_000);
    Ok(())
}

#[tokio::test]
async fn test_carryover_output_spent_next_cycle_is_removed() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    h.seed_confirmed(FUNDING, 0, 10_000, [0x0a; 20]);
    settle(&mut h).await;

    let a = TxBuilder::simple(FUNDING, 0, 9_000);
    h.stream(a.build()).await;
    let first = h.processed_cycle().await;
    assert_eq!(first.new, 1);
    let a0 = OutpointKey::new(&a.txid(), 0);
    assert!(h.cache.projection_raw(&a0)?.is_some());

    let b = TxBuilder::simple(a.txid(), 0, 8_000);
    h.stream(b.build()).await;
    let second = h.processed_cycle().await;
    assert_eq!(second.removed, 1);
    assert_eq!(second.anomalies, 0);
    assert!(h.cache.projection_raw(&a0)?.is_none());
    assert!(!h.controller.carryover().contains(&a0));
    assert!(h.controller.carryover().contains(&OutpointKey::new(&b.txid(), 0)));
    Ok(())
}

#[tokio::test]
async fn test_full_resync_wipes_projection_and_store() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    h.seed_confirmed(FUNDING, 0, 10_000, [0x0a; 20]);
    let a = TxBuilder::simple(FUNDING, 0, 9_000);
    h.node.add_tx(a.build());

    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 1);
    assert!(h.cache.registry_len()? > 0);
    assert_eq!(h.store.merged_txs().len(), 1);
    assert_eq!(h.controller.next_position(), 1);

    // the block confirms everything pending
    h.node.clear();
    h.announce_block([0xbb; 32]).await;
    assert_eq!(h.cycle().await, CycleOutcome::Resync);
    assert_eq!(h.controller.state(), SyncState::Full);

    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 0);
    assert_eq!(h.cache.registry_len()?, 0);
    assert!(h.cache.projection_raw(&OutpointKey::new(&a.txid(), 0))?.is_none());
    assert!(h.store.merged_txs().is_empty());
    assert!(h.store.merged_inputs().is_empty());
    assert!(h.controller.carryover().is_empty());
    assert_eq!(h.controller.next_position(), 0);
    Ok(())
}

#[tokio::test]
async fn test_block_during_full_cycle_forces_another_full() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    h.node.add_tx(TxBuilder::simple([0x01; 32], 0, 500).build());
    h.announce_block([0xbb; 32]).await;

    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 1);
    assert_eq!(h.controller.state(), SyncState::Full);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_stream_delivery_is_idempotent() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    settle(&mut h).await;

    let a = TxBuilder::simple([0x02; 32], 1, 700);
    h.stream(a.build()).await;
    h.stream(a.build()).await;

    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 1);
    assert_eq!(h.store.merged_txs().len(), 1);
    assert_eq!(h.store.merged_outputs().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_bulk_loaded_tx_streamed_again_is_not_reapplied() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    h.seed_confirmed(FUNDING, 0, 10_000, [0x0a; 20]);
    let a = TxBuilder::new()
        .input(FUNDING, 0, vec![], u32::MAX)
        .output(9_000, scripts::p2pkh(&[0x0b; 20]));
    h.node.add_tx(a.build());

    let full = h.processed_cycle().await;
    assert_eq!(full.txs, 1);
    let balance = h.cache.structure_name(K_BALANCE, &[]);
    let spent_set = h.cache.structure_name(K_SPENT_UTXO, &[]);
    assert_eq!(h.cache.counter(&balance, &[0x0a; 20])?, -10_000);
    assert_eq!(h.cache.counter(&balance, &[0x0b; 20])?, 9_000);

    // a poller that started before the snapshot reports the same tx again
    let c = TxBuilder::simple([0x06; 32], 0, 100);
    h.stream(a.build()).await;
    h.stream(c.build()).await;
    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 1);
    assert_eq!(report.spent, 0);

    assert_eq!(h.cache.counter(&balance, &[0x0a; 20])?, -10_000);
    assert_eq!(h.cache.counter(&balance, &[0x0b; 20])?, 9_000);
    assert_eq!(h.cache.zset_members(&spent_set)?.len(), 1);
    let txids: Vec<Vec<u8>> = h.store.merged_txs().iter().map(|r| r.txid.clone()).collect();
    assert_eq!(txids, vec![a.txid().to_vec(), c.txid().to_vec()]);
    assert_eq!(h.controller.next_position(), 2);

    // after a FULL resync the same tx is applied again from scratch
    h.announce_block([0xbb; 32]).await;
    assert_eq!(h.cycle().await, CycleOutcome::Resync);
    assert_eq!(h.processed_cycle().await.txs, 1);
    assert_eq!(h.cache.counter(&balance, &[0x0b; 20])?, 9_000);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_store_commit_does_not_block_next_cycle() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    settle(&mut h).await;

    h.store.fail_next_summary_commits(SUMMARY_COMMIT_ATTEMPTS);
    let a = TxBuilder::simple([0x07; 32], 0, 700);
    h.stream(a.build()).await;
    let failed = h.processed_cycle().await;
    assert!(!failed.store_ok);
    assert!(failed.cache_ok);
    assert!(h.store.merged_txs().is_empty());
    assert!(h.controller.carryover().contains(&OutpointKey::new(&a.txid(), 0)));

    let b = TxBuilder::simple(a.txid(), 0, 600);
    h.stream(b.build()).await;
    let next = h.processed_cycle().await;
    assert!(next.store_ok);
    assert_eq!(next.removed, 1);
    let txs = h.store.merged_txs();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].txid, b.txid().to_vec());
    Ok(())
}

#[tokio::test]
async fn test_non_final_chain_is_excluded() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    settle(&mut h).await;

    let locked = TxBuilder::new()
        .locktime(800_000)
        .input([0x03; 32], 0, vec![], 0)
        .output(600, scripts::p2pkh(&[0x0d; 20]));
    let child = TxBuilder::simple(locked.txid(), 0, 500);
    let grandchild = TxBuilder::simple(child.txid(), 0, 400);
    let unrelated = TxBuilder::simple([0x04; 32], 0, 300);
    for b in [&locked, &child, &grandchild, &unrelated] {
        h.stream(b.build()).await;
    }

    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 1);
    let txs = h.store.merged_txs();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].txid, unrelated.txid().to_vec());
    Ok(())
}

#[tokio::test]
async fn test_unknown_outpoint_yields_placeholder_input() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    settle(&mut h).await;

    h.stream(TxBuilder::simple([0x05; 32], 3, 900).build()).await;
    let report = h.processed_cycle().await;
    assert_eq!(report.anomalies, 1);
    assert_eq!(report.spent, 0);
    assert!(h.cache.zset_members(&h.cache.structure_name(K_SPENT_UTXO, &[]))?.is_empty());

    let inputs = h.store.merged_inputs();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].satoshi, 0);
    assert_eq!(inputs[0].vout, 3);
    assert_eq!(h.store.merged_txs()[0].invalue, 0);
    Ok(())
}

#[tokio::test]
async fn test_positions_continue_across_cycles() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    for i in 0..3u8 {
        h.node.add_tx(TxBuilder::simple([0x10 + i; 32], 0, 100).build());
    }
    assert_eq!(h.processed_cycle().await.txs, 3);

    h.stream(TxBuilder::simple([0x20; 32], 0, 100).build()).await;
    h.stream(TxBuilder::simple([0x21; 32], 0, 100).build()).await;
    assert_eq!(h.processed_cycle().await.txs, 2);
    assert_eq!(h.controller.next_position(), 5);

    let positions: Vec<u64> = h.store.merged_txs().iter().map(|r| r.txidx).collect();
    assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    assert!(h.store.merged_txs().iter().all(|r| r.height == MEMPOOL_HEIGHT));
    Ok(())
}

#[tokio::test]
async fn test_output_keys_are_unique() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    for i in 0..20u8 {
        h.node.add_tx(
            TxBuilder::new()
                .input([i; 32], 0, vec![], u32::MAX)
                .output(100, scripts::p2pkh(&[i; 20]))
                .output(200, scripts::p2sh(&[i; 20]))
                .output(0, scripts::op_return(b"memo"))
                .build(),
        );
    }
    h.processed_cycle().await;

    let outputs = h.store.merged_outputs();
    assert_eq!(outputs.len(), 60);
    let keys: HashSet<(Vec<u8>, u32)> = outputs.iter().map(|o| (o.utxid.clone(), o.vout)).collect();
    assert_eq!(keys.len(), outputs.len());
    // unspendable outputs are recorded but never enter the projection
    assert_eq!(h.controller.carryover().len(), 40);
    Ok(())
}

#[tokio::test]
async fn test_without_utxo_tracking_cache_stays_empty() -> Result<()> {
    let mut h = MempoolTestHarness::with_tracking(false)?;
    h.seed_confirmed(FUNDING, 0, 10_000, [0x0a; 20]);
    h.node.add_tx(TxBuilder::simple(FUNDING, 0, 9_000).build());

    let report = h.processed_cycle().await;
    assert_eq!(report.txs, 1);
    assert_eq!(h.cache.registry_len()?, 0);
    assert!(h.store.merged_inputs().is_empty());
    assert_eq!(h.store.merged_outputs().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_closed_feed_stops_incremental_sync() -> Result<()> {
    let mut h = MempoolTestHarness::new()?;
    settle(&mut h).await;
    let MempoolTestHarness { sink, mut controller, .. } = h;
    drop(sink);
    assert_eq!(controller.run_cycle().await, CycleOutcome::Closed);
    Ok(())
}
