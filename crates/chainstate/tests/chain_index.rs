mod common;

use common::{header_on, TestChain, BLOCK_VERSION};
use ledgerd_chainstate::error::ChainIndexError;
use ledgerd_chainstate::index::{ChainIndex, ChainedHeader};
use ledgerd_storage::memory::MemoryStore;

fn build(test: &TestChain, from: &ChainedHeader, count: usize, tag: u8) -> Vec<ChainedHeader> {
    let mut headers = vec![from.clone()];
    for _ in 0..count {
        let prev = headers.last().cloned().expect("non-empty");
        let next = test
            .chain
            .insert_header(&header_on(&prev, BLOCK_VERSION, tag))
            .expect("insert");
        headers.push(next);
    }
    headers
}

fn walk_back(chain: &ChainIndex<MemoryStore>, from: &ChainedHeader, height: i32) -> ChainedHeader {
    let mut current = from.clone();
    while current.height > height {
        current = chain
            .header_by_hash(current.prev_hash())
            .expect("lookup")
            .expect("parent");
    }
    current
}

#[test]
fn skip_ancestor_matches_parent_walk() {
    let test = TestChain::new();
    let headers = build(&test, &test.genesis, 300, 1);
    let tip = headers.last().expect("tip");
    assert_eq!(tip.height, 300);

    for height in [0, 1, 2, 15, 16, 17, 99, 128, 200, 255, 256, 299, 300] {
        let fast = test
            .chain
            .ancestor(tip, height)
            .expect("ancestor")
            .expect("present");
        assert_eq!(fast, walk_back(&test.chain, tip, height), "height {height}");
        assert_eq!(fast, headers[height as usize]);
    }
    assert_eq!(test.chain.ancestor(tip, 301).expect("ancestor"), None);
    assert_eq!(test.chain.ancestor(tip, -1).expect("ancestor"), None);
}

#[test]
fn best_header_follows_most_work() {
    let test = TestChain::new();
    let main = build(&test, &test.genesis, 20, 1);
    let side = build(&test, &main[10], 5, 2);
    assert_eq!(
        test.chain.best_header().expect("best").map(|best| best.hash),
        Some(main[20].hash)
    );

    let longer = build(&test, side.last().expect("side tip"), 10, 2);
    let best = test.chain.best_header().expect("best").expect("some");
    assert_eq!(best.hash, longer.last().expect("tip").hash);
    assert_eq!(best.height, 25);
    assert!(best.chainwork_value() > main[20].chainwork_value());
}

#[test]
fn insert_is_idempotent_and_needs_parent() {
    let test = TestChain::new();
    let main = build(&test, &test.genesis, 3, 1);
    let again = test
        .chain
        .insert_header(&main[3].header)
        .expect("reinsert");
    assert_eq!(again, main[3]);

    let mut orphan = header_on(&main[3], BLOCK_VERSION, 9);
    orphan.prev_block = [0x44; 32];
    assert_eq!(
        test.chain.insert_header(&orphan),
        Err(ChainIndexError::MissingParent([0x44; 32]))
    );
}

#[test]
fn median_time_past_uses_eleven_blocks() {
    let test = TestChain::new();
    let main = build(&test, &test.genesis, 30, 1);
    let tip = &main[30];
    assert_eq!(
        test.chain.median_time_past(tip).expect("mtp"),
        tip.time() - 5 * 600
    );
    assert_eq!(
        test.chain.median_time_past(&main[0]).expect("mtp"),
        main[0].time()
    );
    let short = &main[3];
    assert_eq!(
        test.chain.median_time_past(short).expect("mtp"),
        main[2].time()
    );
}

#[test]
fn regtest_never_retargets() {
    let test = TestChain::new();
    let main = build(&test, &test.genesis, 5, 1);
    let bits = test
        .chain
        .next_work_required(&main[5], main[5].time() + 600, &test.params)
        .expect("bits");
    assert_eq!(bits, common::REGTEST_BITS);
}
