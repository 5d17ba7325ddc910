//! Coin views: the store-backed view and a write-through cache in front of it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ledgerd_consensus::Hash256;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};
use serde::Serialize;

use crate::coins::{Coins, FetchedCoins, UtxoDelta};
use crate::error::CoinViewError;

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";
pub const DEFAULT_COIN_CACHE_ENTRIES: usize = 200_000;

/// Mapping from txid to unspent outputs, committed one block transition at
/// a time.
pub trait CoinView: Send + Sync {
    /// Hash of the last committed block, all zeroes before the first commit.
    fn best_block_hash(&self) -> Result<Hash256, CoinViewError>;

    fn fetch_coins(&self, txids: &[Hash256]) -> Result<FetchedCoins, CoinViewError>;

    /// Applies `delta` if and only if the committed tip is still `old_tip`.
    fn save_changes(
        &self,
        delta: &UtxoDelta,
        old_tip: &Hash256,
        new_tip: &Hash256,
    ) -> Result<(), CoinViewError>;

    /// Present when the view can be warmed ahead of use.
    fn warm_cache(&self) -> Option<Arc<dyn WarmCache>> {
        None
    }
}

/// Best-effort population of a cache from a background thread.
pub trait WarmCache: Send + Sync {
    /// Changes on every commit. Warms started under an older epoch are
    /// discarded.
    fn epoch(&self) -> u64;

    /// Loads `txids` into the cache. Returns how many entries were inserted.
    fn warm(&self, txids: &[Hash256], epoch: u64) -> Result<usize, CoinViewError>;
}

impl<T: CoinView + ?Sized> CoinView for Arc<T> {
    fn best_block_hash(&self) -> Result<Hash256, CoinViewError> {
        self.as_ref().best_block_hash()
    }

    fn fetch_coins(&self, txids: &[Hash256]) -> Result<FetchedCoins, CoinViewError> {
        self.as_ref().fetch_coins(txids)
    }

    fn save_changes(
        &self,
        delta: &UtxoDelta,
        old_tip: &Hash256,
        new_tip: &Hash256,
    ) -> Result<(), CoinViewError> {
        self.as_ref().save_changes(delta, old_tip, new_tip)
    }

    fn warm_cache(&self) -> Option<Arc<dyn WarmCache>> {
        self.as_ref().warm_cache()
    }
}

pub struct DbCoinView<S> {
    store: Arc<S>,
    commit_lock: Mutex<()>,
}

impl<S: KeyValueStore> DbCoinView<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn read_best(&self) -> Result<Hash256, CoinViewError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| CoinViewError::Corrupt("best block hash length")),
            None => Ok([0u8; 32]),
        }
    }
}

impl<S: KeyValueStore> CoinView for DbCoinView<S> {
    fn best_block_hash(&self) -> Result<Hash256, CoinViewError> {
        self.read_best()
    }

    fn fetch_coins(&self, txids: &[Hash256]) -> Result<FetchedCoins, CoinViewError> {
        let mut fetched = FetchedCoins::new();
        for txid in txids {
            let coins = match self.store.get(Column::Coins, txid)? {
                Some(bytes) => Some(
                    Coins::decode(&bytes).map_err(|_| CoinViewError::Corrupt("undecodable coins"))?,
                ),
                None => None,
            };
            fetched.insert(*txid, coins);
        }
        Ok(fetched)
    }

    fn save_changes(
        &self,
        delta: &UtxoDelta,
        old_tip: &Hash256,
        new_tip: &Hash256,
    ) -> Result<(), CoinViewError> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| CoinViewError::Corrupt("commit lock poisoned"))?;
        let current = self.read_best()?;
        if current != *old_tip {
            return Err(CoinViewError::TipMismatch {
                expected: *old_tip,
                actual: current,
            });
        }

        let mut batch = WriteBatch::new();
        batch.reserve(delta.len() + 1);
        for (txid, coins) in delta.iter() {
            match coins {
                Some(coins) if !coins.is_pruned() => {
                    batch.put(Column::Coins, *txid, coins.encode())
                }
                _ => batch.delete(Column::Coins, *txid),
            }
        }
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, *new_tip);
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

struct CoinCacheEntry {
    coins: Option<Coins>,
    stamp: u64,
}

/// LRU over txids using lazy stamps in the order queue.
struct CoinCache {
    entries: HashMap<Hash256, CoinCacheEntry>,
    order: VecDeque<(Hash256, u64)>,
    capacity: usize,
    clock: u64,
}

impl CoinCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            clock: 0,
        }
    }

    fn get(&mut self, txid: &Hash256) -> Option<Option<Coins>> {
        if self.capacity == 0 {
            return None;
        }
        let stamp = self.bump_stamp();
        let entry = self.entries.get_mut(txid)?;
        entry.stamp = stamp;
        self.order.push_back((*txid, stamp));
        Some(entry.coins.clone())
    }

    fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    fn insert(&mut self, txid: Hash256, coins: Option<Coins>) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.bump_stamp();
        self.entries.insert(txid, CoinCacheEntry { coins, stamp });
        self.order.push_back((txid, stamp));
        self.evict();
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn bump_stamp(&mut self) -> u64 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((txid, stamp)) = self.order.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            if entry.stamp != stamp {
                continue;
            }
            self.entries.remove(&txid);
        }
        if self.order.len() > self.capacity.saturating_mul(4).max(64) {
            let entries = &self.entries;
            self.order
                .retain(|(txid, stamp)| entries.get(txid).is_some_and(|e| e.stamp == *stamp));
        }
    }
}

struct CacheState {
    cache: CoinCache,
    epoch: u64,
}

struct CachedInner<V> {
    backing: V,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    warmed: AtomicU64,
}

impl<V> CachedInner<V> {
    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CoinViewError> {
        self.state
            .lock()
            .map_err(|_| CoinViewError::Corrupt("coin cache lock poisoned"))
    }
}

impl<V: CoinView> CachedInner<V> {
    /// Loads `missing` from the backing view and caches the results unless a
    /// commit moved the epoch on in the meantime.
    fn load_missing(
        &self,
        missing: &[Hash256],
        epoch: u64,
    ) -> Result<(FetchedCoins, usize), CoinViewError> {
        let loaded = self.backing.fetch_coins(missing)?;
        let mut state = self.lock()?;
        if state.epoch != epoch {
            return Ok((loaded, 0));
        }
        let mut inserted = 0usize;
        for (txid, coins) in &loaded {
            if !state.cache.contains(txid) {
                state.cache.insert(*txid, coins.clone());
                inserted += 1;
            }
        }
        Ok((loaded, inserted))
    }
}

impl<V: CoinView> WarmCache for CachedInner<V> {
    fn epoch(&self) -> u64 {
        self.lock().map(|state| state.epoch).unwrap_or(u64::MAX)
    }

    fn warm(&self, txids: &[Hash256], epoch: u64) -> Result<usize, CoinViewError> {
        let missing: Vec<Hash256> = {
            let state = self.lock()?;
            if state.epoch != epoch {
                return Ok(0);
            }
            txids
                .iter()
                .filter(|txid| !state.cache.contains(txid))
                .copied()
                .collect()
        };
        if missing.is_empty() {
            return Ok(0);
        }
        let (_, inserted) = self.load_missing(&missing, epoch)?;
        self.warmed.fetch_add(inserted as u64, Ordering::Relaxed);
        Ok(inserted)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CoinCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub epoch: u64,
    pub hits: u64,
    pub misses: u64,
    pub warmed: u64,
}

/// Bounded write-through cache over another coin view.
pub struct CachedCoinView<V> {
    inner: Arc<CachedInner<V>>,
}

impl<V: CoinView + 'static> CachedCoinView<V> {
    pub fn new(backing: V, capacity: usize) -> Self {
        Self {
            inner: Arc::new(CachedInner {
                backing,
                state: Mutex::new(CacheState {
                    cache: CoinCache::new(capacity),
                    epoch: 0,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                warmed: AtomicU64::new(0),
            }),
        }
    }

    pub fn backing(&self) -> &V {
        &self.inner.backing
    }

    pub fn stats(&self) -> CoinCacheStats {
        let (entries, capacity, epoch) = match self.inner.lock() {
            Ok(state) => (state.cache.entries.len(), state.cache.capacity, state.epoch),
            Err(_) => (0, 0, 0),
        };
        CoinCacheStats {
            entries,
            capacity,
            epoch,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            warmed: self.inner.warmed.load(Ordering::Relaxed),
        }
    }
}

impl<V: CoinView + 'static> CoinView for CachedCoinView<V> {
    fn best_block_hash(&self) -> Result<Hash256, CoinViewError> {
        self.inner.backing.best_block_hash()
    }

    fn fetch_coins(&self, txids: &[Hash256]) -> Result<FetchedCoins, CoinViewError> {
        let mut fetched = FetchedCoins::new();
        let mut missing = Vec::new();
        let epoch = {
            let mut state = self.inner.lock()?;
            for txid in txids {
                match state.cache.get(txid) {
                    Some(coins) => {
                        fetched.insert(*txid, coins);
                    }
                    None => missing.push(*txid),
                }
            }
            state.epoch
        };
        self.inner
            .hits
            .fetch_add(fetched.len() as u64, Ordering::Relaxed);
        if missing.is_empty() {
            return Ok(fetched);
        }
        self.inner
            .misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);
        let (loaded, _) = self.inner.load_missing(&missing, epoch)?;
        fetched.extend(loaded);
        Ok(fetched)
    }

    fn save_changes(
        &self,
        delta: &UtxoDelta,
        old_tip: &Hash256,
        new_tip: &Hash256,
    ) -> Result<(), CoinViewError> {
        // Warms racing the backing write must not land.
        self.inner.lock()?.epoch += 1;
        if let Err(err) = self.inner.backing.save_changes(delta, old_tip, new_tip) {
            // The backing view may have moved on without us. Nothing cached
            // before this point is known to match it.
            let mut state = self.inner.lock()?;
            state.cache.clear();
            state.epoch += 1;
            return Err(err);
        }
        let mut state = self.inner.lock()?;
        for (txid, coins) in delta.iter() {
            let coins = coins.clone().filter(|coins| !coins.is_pruned());
            state.cache.insert(*txid, coins);
        }
        state.epoch += 1;
        Ok(())
    }

    fn warm_cache(&self) -> Option<Arc<dyn WarmCache>> {
        let warm: Arc<dyn WarmCache> = self.inner.clone();
        Some(warm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::transaction::TxOut;
    use ledgerd_storage::memory::MemoryStore;

    fn coins(value: i64) -> Coins {
        Coins {
            coinbase: false,
            height: 1,
            version: 1,
            outputs: vec![Some(TxOut {
                value,
                script_pubkey: vec![0x51],
            })],
        }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut cache = CoinCache::new(2);
        cache.insert([1u8; 32], None);
        cache.insert([2u8; 32], None);
        assert!(cache.get(&[1u8; 32]).is_some());
        cache.insert([3u8; 32], None);
        assert!(cache.contains(&[1u8; 32]));
        assert!(!cache.contains(&[2u8; 32]));
        assert!(cache.contains(&[3u8; 32]));
    }

    #[test]
    fn db_view_rejects_stale_old_tip() {
        let view = DbCoinView::new(Arc::new(MemoryStore::new()));
        assert_eq!(view.best_block_hash().expect("best"), [0u8; 32]);
        let mut delta = UtxoDelta::new();
        delta.set([9u8; 32], Some(coins(5)));
        view.save_changes(&delta, &[0u8; 32], &[1u8; 32])
            .expect("first commit");
        let err = view
            .save_changes(&UtxoDelta::new(), &[0u8; 32], &[2u8; 32])
            .expect_err("stale tip");
        assert_eq!(
            err,
            CoinViewError::TipMismatch {
                expected: [0u8; 32],
                actual: [1u8; 32],
            }
        );
        assert_eq!(view.best_block_hash().expect("best"), [1u8; 32]);
    }

    #[test]
    fn rejected_commit_drops_cached_entries() {
        let view = CachedCoinView::new(DbCoinView::new(Arc::new(MemoryStore::new())), 16);
        let mut seed = UtxoDelta::new();
        seed.set([4u8; 32], Some(coins(7)));
        view.save_changes(&seed, &[0u8; 32], &[1u8; 32])
            .expect("seed");
        assert!(view.fetch_coins(&[[4u8; 32]]).expect("fetch")[&[4u8; 32]].is_some());

        let mut spent = UtxoDelta::new();
        spent.set([4u8; 32], None);
        view.backing()
            .save_changes(&spent, &[1u8; 32], &[2u8; 32])
            .expect("backing moves");
        let epoch = view.stats().epoch;
        let err = view
            .save_changes(&UtxoDelta::new(), &[1u8; 32], &[3u8; 32])
            .expect_err("stale tip");
        assert!(matches!(err, CoinViewError::TipMismatch { .. }));

        let stats = view.stats();
        assert_eq!(stats.entries, 0);
        assert!(stats.epoch > epoch);
        assert_eq!(view.fetch_coins(&[[4u8; 32]]).expect("fetch")[&[4u8; 32]], None);
    }

    #[test]
    fn cached_view_counts_hits_after_miss() {
        let view = CachedCoinView::new(DbCoinView::new(Arc::new(MemoryStore::new())), 16);
        let mut delta = UtxoDelta::new();
        delta.set([4u8; 32], Some(coins(7)));
        view.backing()
            .save_changes(&delta, &[0u8; 32], &[1u8; 32])
            .expect("seed");

        let first = view.fetch_coins(&[[4u8; 32]]).expect("fetch");
        let second = view.fetch_coins(&[[4u8; 32]]).expect("fetch");
        assert_eq!(first, second);
        let stats = view.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }
}
