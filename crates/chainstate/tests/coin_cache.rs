mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{spend, TestChain};
use ledgerd_chainstate::coins::{Coins, UtxoDelta};
use ledgerd_chainstate::coinview::{CachedCoinView, CoinView};
use ledgerd_chainstate::prefetch::{PrefetchStatus, PrefetchTicket, Prefetcher};
use ledgerd_consensus::money::COIN;

fn wait(ticket: &mut PrefetchTicket) -> PrefetchStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = ticket.poll();
        if status != PrefetchStatus::Pending || Instant::now() > deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn warm_from_before_a_commit_is_discarded() {
    let test = TestChain::new();
    let view = CachedCoinView::new(Arc::clone(&test.view), 16);
    let warm = view.warm_cache().expect("warmable");
    let stale_epoch = warm.epoch();

    let tx = spend(&[test.funding_outpoint(0)], 9 * COIN);
    let mut delta = UtxoDelta::new();
    delta.set(tx.txid(), Some(Coins::from_transaction(&tx, 1)));
    view.save_changes(&delta, &test.genesis.hash, &[1u8; 32])
        .expect("commit");
    assert!(warm.epoch() > stale_epoch);

    let entries = view.stats().entries;
    assert_eq!(
        warm.warm(&[test.funding.txid()], stale_epoch).expect("warm"),
        0
    );
    assert_eq!(view.stats().entries, entries);

    assert_eq!(
        warm.warm(&[test.funding.txid()], warm.epoch()).expect("warm"),
        1
    );
    assert_eq!(view.stats().entries, entries + 1);
    assert_eq!(view.stats().warmed, 1);
}

#[test]
fn committed_delta_is_served_from_cache() {
    let test = TestChain::new();
    let view = CachedCoinView::new(Arc::clone(&test.view), 16);
    let tx = spend(&[test.funding_outpoint(0)], 9 * COIN);
    let mut delta = UtxoDelta::new();
    delta.set(tx.txid(), Some(Coins::from_transaction(&tx, 1)));
    view.save_changes(&delta, &test.genesis.hash, &[1u8; 32])
        .expect("commit");

    let fetched = view.fetch_coins(&[tx.txid()]).expect("fetch");
    assert!(fetched.get(&tx.txid()).and_then(Option::as_ref).is_some());
    let stats = view.stats();
    assert_eq!((stats.hits, stats.misses), (1, 0));
    assert_eq!(view.best_block_hash().expect("best"), [1u8; 32]);
}

#[test]
fn prefetcher_warms_cache_in_background() {
    let test = TestChain::new();
    let view = CachedCoinView::new(Arc::clone(&test.view), 16);
    let prefetcher = Prefetcher::spawn().expect("spawn");
    let warm = view.warm_cache().expect("warmable");

    let mut ticket = prefetcher.schedule(warm, vec![test.funding.txid()]);
    assert_eq!(wait(&mut ticket), PrefetchStatus::Completed(1));

    view.fetch_coins(&[test.funding.txid()]).expect("fetch");
    assert_eq!(view.stats().hits, 1);
    assert_eq!(view.stats().misses, 0);
}

#[test]
fn stale_tip_commit_leaves_cache_alone() {
    let test = TestChain::new();
    let view = CachedCoinView::new(Arc::clone(&test.view), 16);
    let tx = spend(&[test.funding_outpoint(0)], 9 * COIN);
    let mut delta = UtxoDelta::new();
    delta.set(tx.txid(), Some(Coins::from_transaction(&tx, 1)));

    assert!(view.save_changes(&delta, &[5u8; 32], &[6u8; 32]).is_err());
    assert_eq!(view.stats().entries, 0);
    assert_eq!(view.best_block_hash().expect("best"), test.genesis.hash);
}
