//! Block header and block types.

use ledgerd_consensus::Hash256;

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::{sha256d, sha256d_pair};
use crate::transaction::{read_vec, Transaction};

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        encoding::decode(bytes)
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.consensus_encode_to(encoder);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        encoding::encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        encoding::decode(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + encoding::varint_len(self.transactions.len() as u64)
            + self
                .transactions
                .iter()
                .map(Transaction::serialized_size)
                .sum::<usize>()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode_to(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            Encodable::consensus_encode(tx, encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = <BlockHeader as Decodable>::consensus_decode(decoder)?;
        let transactions = read_vec(decoder, 10)?;
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// Computes the merkle root over `leaves`.
///
/// The flag is set when some level hashes two identical siblings, which lets
/// distinct transaction lists share a root.
pub fn merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    if left == right {
                        mutated = true;
                    }
                    next.push(sha256d_pair(left, right));
                }
                [last] => next.push(sha256d_pair(last, last)),
                _ => unreachable!("chunks(2) yields one or two items"),
            }
        }
        level = next;
    }
    (level[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_eighty_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 3,
            bits: 4,
            nonce: 5,
        };
        let bytes = header.consensus_encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::consensus_decode(&bytes).expect("decode"), header);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = [9u8; 32];
        assert_eq!(merkle_root(&[leaf]), (leaf, false));
    }

    #[test]
    fn odd_level_duplicates_last_without_mutation() {
        let leaves = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let (root, mutated) = merkle_root(&leaves);
        assert!(!mutated);
        let left = sha256d_pair(&leaves[0], &leaves[1]);
        let right = sha256d_pair(&leaves[2], &leaves[2]);
        assert_eq!(root, sha256d_pair(&left, &right));
    }

    #[test]
    fn duplicated_pair_is_mutation() {
        let leaves = [[1u8; 32], [2u8; 32], [3u8; 32], [3u8; 32]];
        let (root, mutated) = merkle_root(&leaves);
        assert!(mutated);
        let (odd_root, odd_mutated) = merkle_root(&leaves[..3]);
        assert_eq!(root, odd_root);
        assert!(!odd_mutated);
    }
}
