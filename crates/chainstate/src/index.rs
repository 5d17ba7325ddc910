use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use ledgerd_consensus::constants::MEDIAN_TIME_SPAN;
use ledgerd_consensus::{ConsensusParams, Hash256};
use ledgerd_pow::difficulty::{block_proof, get_next_work_required, DifficultyError};
use ledgerd_pow::HeaderInfo;
use ledgerd_primitives::block::{BlockHeader, HEADER_SIZE};
use ledgerd_primitives::encoding::{Decodable, Decoder, Encoder};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::error::ChainIndexError;

const META_BEST_HEADER_KEY: &[u8] = b"best_header";
const HEADER_CACHE_CAPACITY: usize = 50_000;
const NULL_HASH: Hash256 = [0u8; 32];

/// A header bound to its position in the header chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainedHeader {
    pub hash: Hash256,
    pub height: i32,
    pub header: BlockHeader,
    /// Cumulative work up to and including this header, big-endian.
    pub chainwork: [u8; 32],
}

impl ChainedHeader {
    pub fn prev_hash(&self) -> &Hash256 {
        &self.header.prev_block
    }

    pub fn time(&self) -> i64 {
        self.header.time as i64
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: self.height as i64,
            time: self.time(),
            bits: self.header.bits,
        }
    }
}

#[derive(Clone, Debug)]
struct IndexEntry {
    header: BlockHeader,
    height: i32,
    chainwork: [u8; 32],
    skip_hash: Hash256,
}

impl IndexEntry {
    fn chained(&self, hash: Hash256) -> ChainedHeader {
        ChainedHeader {
            hash,
            height: self.height,
            header: self.header.clone(),
            chainwork: self.chainwork,
        }
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip pointer of an entry at `height` jumps to.
fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

struct HeaderCache {
    entries: HashMap<Hash256, IndexEntry>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl HeaderCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<IndexEntry> {
        self.entries.get(hash).cloned()
    }

    fn insert(&mut self, hash: Hash256, entry: IndexEntry) {
        if self.entries.insert(hash, entry).is_some() {
            return;
        }
        self.order.push_back(hash);
        if self.entries.len() > self.capacity {
            while let Some(evicted) = self.order.pop_front() {
                if self.entries.remove(&evicted).is_some() {
                    break;
                }
            }
        }
    }
}

/// Store-backed header tree. Readers may run concurrently with a single
/// header writer.
pub struct ChainIndex<S> {
    store: Arc<S>,
    cache: Mutex<HeaderCache>,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            cache: Mutex::new(HeaderCache::new(HEADER_CACHE_CAPACITY)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool, ChainIndexError> {
        Ok(self.entry(hash)?.is_some())
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Result<Option<ChainedHeader>, ChainIndexError> {
        Ok(self.entry(hash)?.map(|entry| entry.chained(*hash)))
    }

    pub fn best_header(&self) -> Result<Option<ChainedHeader>, ChainIndexError> {
        let Some(bytes) = self.store.get(Column::Meta, META_BEST_HEADER_KEY)? else {
            return Ok(None);
        };
        let hash = decode_hash(&bytes)?;
        self.header_by_hash(&hash)
    }

    /// Links `header` under its indexed parent. A null parent makes it a
    /// genesis entry. Re-inserting a known header returns the stored entry.
    pub fn insert_header(&self, header: &BlockHeader) -> Result<ChainedHeader, ChainIndexError> {
        let hash = header.hash();
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ChainIndexError::Corrupt("header writer lock poisoned"))?;
        if let Some(existing) = self.header_by_hash(&hash)? {
            return Ok(existing);
        }

        let work = block_proof(header.bits).map_err(|_| ChainIndexError::InvalidBits)?;
        let (height, chainwork, skip_hash) = if header.prev_block == NULL_HASH {
            (0, work, NULL_HASH)
        } else {
            let parent = self
                .header_by_hash(&header.prev_block)?
                .ok_or(ChainIndexError::MissingParent(header.prev_block))?;
            let height = parent.height + 1;
            let chainwork = parent.chainwork_value().saturating_add(work);
            let skip_hash = self
                .ancestor(&parent, get_skip_height(height))?
                .map(|skip| skip.hash)
                .unwrap_or(NULL_HASH);
            (height, chainwork, skip_hash)
        };

        let entry = IndexEntry {
            header: header.clone(),
            height,
            chainwork: chainwork.to_big_endian(),
            skip_hash,
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::HeaderIndex, hash, encode_entry(&entry));
        let improves_best = match self.best_header()? {
            Some(best) => chainwork > best.chainwork_value(),
            None => true,
        };
        if improves_best {
            batch.put(Column::Meta, META_BEST_HEADER_KEY, hash);
        }
        self.store.write_batch(&batch)?;

        let chained = entry.chained(hash);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(hash, entry);
        }
        Ok(chained)
    }

    /// The ancestor of `from` at `height`, following skip pointers where
    /// they do not overshoot.
    pub fn ancestor(
        &self,
        from: &ChainedHeader,
        height: i32,
    ) -> Result<Option<ChainedHeader>, ChainIndexError> {
        if height < 0 || height > from.height {
            return Ok(None);
        }
        if height == from.height {
            return Ok(Some(from.clone()));
        }
        let mut current_hash = from.hash;
        let Some(mut entry) = self.entry(&current_hash)? else {
            return Ok(None);
        };
        while entry.height > height {
            let skip_height = get_skip_height(entry.height);
            current_hash = if entry.skip_hash != NULL_HASH && skip_height >= height {
                entry.skip_hash
            } else {
                entry.header.prev_block
            };
            entry = match self.entry(&current_hash)? {
                Some(entry) => entry,
                None => return Ok(None),
            };
        }
        Ok(Some(entry.chained(current_hash)))
    }

    /// Median timestamp of `tip` and up to ten of its ancestors.
    pub fn median_time_past(&self, tip: &ChainedHeader) -> Result<i64, ChainIndexError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        times.push(tip.time());
        let mut prev = tip.header.prev_block;
        while times.len() < MEDIAN_TIME_SPAN && prev != NULL_HASH {
            let Some(entry) = self.entry(&prev)? else {
                break;
            };
            times.push(entry.header.time as i64);
            prev = entry.header.prev_block;
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// Compact target the child of `prev` must carry.
    pub fn next_work_required(
        &self,
        prev: &ChainedHeader,
        next_block_time: i64,
        params: &ConsensusParams,
    ) -> Result<u32, ChainIndexError> {
        let mut lookup_error = None;
        let result = get_next_work_required(
            Some(&prev.header_info()),
            next_block_time,
            params,
            |height| match self.ancestor(prev, height as i32) {
                Ok(found) => found.map(|header| header.header_info()),
                Err(err) => {
                    lookup_error = Some(err);
                    None
                }
            },
        );
        if let Some(err) = lookup_error {
            return Err(err);
        }
        result.map_err(|err| match err {
            DifficultyError::MissingAncestor(_) => ChainIndexError::Corrupt("missing ancestor"),
            DifficultyError::Compact(_) => ChainIndexError::InvalidBits,
        })
    }

    fn entry(&self, hash: &Hash256) -> Result<Option<IndexEntry>, ChainIndexError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(entry) = cache.get(hash) {
                return Ok(Some(entry));
            }
        }
        let Some(bytes) = self.store.get(Column::HeaderIndex, hash)? else {
            return Ok(None);
        };
        let entry = decode_entry(&bytes)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(*hash, entry.clone());
        }
        Ok(Some(entry))
    }
}

fn encode_entry(entry: &IndexEntry) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(HEADER_SIZE + 4 + 32 + 32);
    encoder.write_bytes(&entry.header.consensus_encode());
    encoder.write_i32_le(entry.height);
    encoder.write_bytes(&entry.chainwork);
    encoder.write_hash_le(&entry.skip_hash);
    encoder.into_inner()
}

fn decode_entry(bytes: &[u8]) -> Result<IndexEntry, ChainIndexError> {
    let mut decoder = Decoder::new(bytes);
    let header = <BlockHeader as Decodable>::consensus_decode(&mut decoder)?;
    let height = decoder.read_i32_le()?;
    let chainwork = decoder.read_fixed::<32>()?;
    let skip_hash = decoder.read_hash_le()?;
    if !decoder.is_empty() {
        return Err(ChainIndexError::Corrupt("trailing bytes in header entry"));
    }
    Ok(IndexEntry {
        header,
        height,
        chainwork,
        skip_hash,
    })
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, ChainIndexError> {
    bytes
        .try_into()
        .map_err(|_| ChainIndexError::Corrupt("invalid hash length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_heights_point_backwards() {
        assert_eq!(get_skip_height(0), 0);
        assert_eq!(get_skip_height(1), 0);
        for height in 2..2_000 {
            let skip = get_skip_height(height);
            assert!(skip < height, "skip {skip} at {height}");
        }
        assert_eq!(get_skip_height(16), 0);
        assert_eq!(get_skip_height(24), 16);
    }
}
