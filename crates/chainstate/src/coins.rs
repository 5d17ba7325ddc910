//! Per-transaction unspent output records and the deltas applied to them.

use std::collections::BTreeMap;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use ledgerd_primitives::transaction::{Transaction, TxOut};

/// The unspent remainder of one transaction's outputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coins {
    pub coinbase: bool,
    pub height: i32,
    pub version: i32,
    /// `None` marks an output that has been spent.
    pub outputs: Vec<Option<TxOut>>,
}

impl Coins {
    pub fn from_transaction(tx: &Transaction, height: i32) -> Self {
        Self {
            coinbase: tx.is_coinbase(),
            height,
            version: tx.version,
            outputs: tx.vout.iter().cloned().map(Some).collect(),
        }
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize)?.as_ref()
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    pub fn spend(&mut self, index: u32) -> Option<TxOut> {
        let taken = self.outputs.get_mut(index as usize)?.take();
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
        taken
    }

    /// True once every output is spent; such records are deleted from views.
    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn unspent_count(&self) -> usize {
        self.outputs.iter().filter(|output| output.is_some()).count()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_u8(u8::from(self.coinbase));
        encoder.write_i32_le(self.height);
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            match output {
                Some(output) => {
                    encoder.write_u8(1);
                    output.consensus_encode(&mut encoder);
                }
                None => encoder.write_u8(0),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_i32_le()?;
        let coinbase = match decoder.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(DecodeError::InvalidData("invalid coinbase flag")),
        };
        let height = decoder.read_i32_le()?;
        let count = decoder.read_count(1)?;
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            let output = match decoder.read_u8()? {
                0 => None,
                1 => Some(TxOut::consensus_decode(&mut decoder)?),
                _ => return Err(DecodeError::InvalidData("invalid output marker")),
            };
            outputs.push(output);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            coinbase,
            height,
            version,
            outputs,
        })
    }
}

/// Result of a batch lookup: every requested txid maps to its coins, or
/// `None` when the view holds nothing for it.
pub type FetchedCoins = BTreeMap<Hash256, Option<Coins>>;

/// Net change produced by one block. `None` deletes the record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UtxoDelta {
    changes: BTreeMap<Hash256, Option<Coins>>,
}

impl UtxoDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, txid: Hash256, coins: Option<Coins>) {
        self.changes.insert(txid, coins);
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Option<Coins>> {
        self.changes.get(txid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash256, &Option<Coins>)> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
