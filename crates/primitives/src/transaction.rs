//! Transaction types and serialization.

use ledgerd_consensus::Hash256;

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// A transaction in its base (non-witness) serialization.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        encoding::encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        encoding::decode(bytes)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + 4;
        size += encoding::varint_len(self.vin.len() as u64);
        for input in &self.vin {
            size += OutPoint::SERIALIZED_SIZE
                + encoding::varint_len(input.script_sig.len() as u64)
                + input.script_sig.len()
                + 4;
        }
        size += encoding::varint_len(self.vout.len() as u64);
        for output in &self.vout {
            size += 8
                + encoding::varint_len(output.script_pubkey.len() as u64)
                + output.script_pubkey.len();
        }
        size
    }

    /// Sum of output values, or `None` on overflow.
    pub fn value_out(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |total, output| total.checked_add(output.value))
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        write_vec(encoder, &self.vin);
        write_vec(encoder, &self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin = read_vec(decoder, OutPoint::SERIALIZED_SIZE + 5)?;
        let vout = read_vec(decoder, 9)?;
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

fn write_vec<T: Encodable>(encoder: &mut Encoder, values: &[T]) {
    encoder.write_varint(values.len() as u64);
    for value in values {
        value.consensus_encode(encoder);
    }
}

pub(crate) fn read_vec<T: Decodable>(
    decoder: &mut Decoder,
    min_item_size: usize,
) -> Result<Vec<T>, DecodeError> {
    let count = decoder.read_count(min_item_size)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(T::consensus_decode(decoder)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                script_sig: vec![0x51],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![
                TxOut {
                    value: 1_000,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 2_000,
                    script_pubkey: vec![0x52, 0x53],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let tx = sample_tx();
        assert_eq!(tx.serialized_size(), tx.consensus_encode().len());
    }

    #[test]
    fn coinbase_detection_uses_null_prevout() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
        tx.vin.push(tx.vin[0].clone());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn value_out_detects_overflow() {
        let mut tx = sample_tx();
        assert_eq!(tx.value_out(), Some(3_000));
        tx.vout[0].value = i64::MAX;
        assert_eq!(tx.value_out(), None);
    }
}
