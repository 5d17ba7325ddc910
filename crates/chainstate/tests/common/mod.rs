#![allow(dead_code)]

use std::sync::Arc;

use ledgerd_chainstate::coins::{Coins, UtxoDelta};
use ledgerd_chainstate::coinview::{CoinView, DbCoinView};
use ledgerd_chainstate::index::{ChainIndex, ChainedHeader};
use ledgerd_chainstate::validator::script_push_int;
use ledgerd_consensus::money::COIN;
use ledgerd_consensus::params::{chain_params, ConsensusParams, Network};
use ledgerd_consensus::Hash256;
use ledgerd_pow::check_proof_of_work;
use ledgerd_primitives::block::{merkle_root, Block, BlockHeader};
use ledgerd_primitives::build_genesis_block;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use ledgerd_storage::memory::MemoryStore;

pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const BLOCK_VERSION: i32 = 0x2000_0000;
pub const FUNDING_VALUE: i64 = 10 * COIN;

/// A regtest chain holding only genesis, with one spendable
/// non-coinbase funding transaction seeded into the coin set.
pub struct TestChain {
    pub params: ConsensusParams,
    pub store: Arc<MemoryStore>,
    pub chain: Arc<ChainIndex<MemoryStore>>,
    pub view: Arc<DbCoinView<MemoryStore>>,
    pub genesis: ChainedHeader,
    pub funding: Transaction,
    pub genesis_time: u32,
}

impl TestChain {
    pub fn new() -> Self {
        let chain_params = chain_params(Network::Regtest);
        let genesis_block = build_genesis_block(&chain_params.genesis).expect("genesis");
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(ChainIndex::new(Arc::clone(&store)));
        let genesis = chain
            .insert_header(&genesis_block.header)
            .expect("insert genesis");
        let view = Arc::new(DbCoinView::new(Arc::clone(&store)));

        let funding = funding_tx();
        let mut delta = UtxoDelta::new();
        delta.set(funding.txid(), Some(Coins::from_transaction(&funding, 0)));
        view.save_changes(&delta, &[0u8; 32], &genesis.hash)
            .expect("seed genesis");

        Self {
            params: chain_params.consensus,
            store,
            chain,
            view,
            genesis,
            funding,
            genesis_time: chain_params.genesis.time,
        }
    }

    pub fn funding_outpoint(&self, index: u32) -> OutPoint {
        OutPoint::new(self.funding.txid(), index)
    }

    pub fn builder(&self) -> BlockBuilder {
        BlockBuilder {
            params: self.params.clone(),
            prev_hash: self.genesis.hash,
            height: 0,
            genesis_time: self.genesis_time,
        }
    }
}

/// Mines regtest blocks one after another.
pub struct BlockBuilder {
    params: ConsensusParams,
    prev_hash: Hash256,
    height: i32,
    genesis_time: u32,
}

impl BlockBuilder {
    pub fn next_height(&self) -> i32 {
        self.height + 1
    }

    /// Builds the next block without advancing the builder.
    pub fn peek(&self, version: i32, transactions: Vec<Transaction>) -> Block {
        let height = self.next_height();
        let mut all = vec![coinbase(height, 50 * COIN)];
        all.extend(transactions);
        let txids: Vec<Hash256> = all.iter().map(Transaction::txid).collect();
        let (root, _) = merkle_root(&txids);
        let header = BlockHeader {
            version,
            prev_block: self.prev_hash,
            merkle_root: root,
            time: self.genesis_time + 600 * height as u32,
            bits: REGTEST_BITS,
            nonce: 0,
        };
        Block {
            header: grind(header, &self.params),
            transactions: all,
        }
    }

    pub fn next(&mut self, transactions: Vec<Transaction>) -> Block {
        let block = self.peek(BLOCK_VERSION, transactions);
        self.accept(&block);
        block
    }

    pub fn accept(&mut self, block: &Block) {
        self.prev_hash = block.hash();
        self.height += 1;
    }
}

pub fn grind(mut header: BlockHeader, params: &ConsensusParams) -> BlockHeader {
    while check_proof_of_work(&header.hash(), header.bits, params).is_err() {
        header.nonce += 1;
    }
    header
}

/// Re-seals a block after its transactions were edited.
pub fn reseal(mut block: Block, params: &ConsensusParams) -> Block {
    let txids = block.txids();
    block.header.merkle_root = merkle_root(&txids).0;
    block.header = grind(block.header, params);
    block
}

pub fn coinbase(height: i32, value: i64) -> Transaction {
    let mut script_sig = script_push_int(height as i64);
    script_sig.extend_from_slice(&[0x01, 0x2a]);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

pub fn spend(prevouts: &[OutPoint], value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: prevouts
            .iter()
            .map(|prevout| TxIn {
                prevout: *prevout,
                script_sig: vec![0x51],
                sequence: SEQUENCE_FINAL,
            })
            .collect(),
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x52],
        }],
        lock_time: 0,
    }
}

fn funding_tx() -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0xfe; 32], 0),
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![
            TxOut {
                value: FUNDING_VALUE,
                script_pubkey: vec![0x51],
            },
            TxOut {
                value: FUNDING_VALUE,
                script_pubkey: vec![0x51],
            },
        ],
        lock_time: 0,
    }
}

/// Header-only chain link for index and activation tests; no proof of work.
pub fn header_on(prev: &ChainedHeader, version: i32, tag: u8) -> BlockHeader {
    BlockHeader {
        version,
        prev_block: prev.hash,
        merkle_root: [tag; 32],
        time: prev.header.time + 600,
        bits: REGTEST_BITS,
        nonce: prev.height as u32 + 1,
    }
}
