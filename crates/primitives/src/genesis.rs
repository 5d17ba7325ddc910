//! Construction of the hard-coded genesis block.

use ledgerd_consensus::params::{bytes_from_hex, GenesisParams, HexError};

use crate::block::{merkle_root, Block, BlockHeader};
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};

pub fn build_genesis_block(genesis: &GenesisParams) -> Result<Block, HexError> {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: bytes_from_hex(genesis.coinbase_script_sig)?,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: genesis.reward,
            script_pubkey: bytes_from_hex(genesis.output_script_pubkey)?,
        }],
        lock_time: 0,
    };
    let (root, _) = merkle_root(&[coinbase.txid()]);
    Ok(Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root: root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        },
        transactions: vec![coinbase],
    })
}
