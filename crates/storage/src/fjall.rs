//! Persistent store: one fjall partition per column in a single keyspace.
//!
//! Batches are committed with buffered durability. The journal is synced on
//! [`FjallStore::persist`], which the node calls once the loop has stopped.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);
const SLOW_COMMIT_LOG_INTERVAL_SECS: u64 = 30;

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub fsync_ms: Option<u16>,
}

impl FjallOptions {
    fn apply(&self, mut config: Config) -> Config {
        if let Some(bytes) = self.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = self.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        if let Some(ms) = self.fsync_ms {
            config = config.fsync_ms(Some(ms));
        }
        config
    }
}

#[derive(Default)]
struct CommitCounters {
    batches: AtomicU64,
    ops: AtomicU64,
    coin_batches: AtomicU64,
    slow: AtomicU64,
    last_slow_log_secs: AtomicU64,
}

/// Keyspace pressure plus this store's own commit counters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FjallTelemetrySnapshot {
    pub write_buffer_bytes: u64,
    pub journal_count: u64,
    pub journal_disk_space_bytes: u64,
    pub flushes_completed: u64,
    pub active_compactions: u64,
    /// Segments per column, in `Column::ALL` order.
    pub segments: [u64; 3],
    pub batches_committed: u64,
    pub ops_committed: u64,
    /// Batches that touched the coins column.
    pub coin_batches: u64,
    pub slow_commits: u64,
}

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    counters: CommitCounters,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let keyspace = options
            .apply(Config::new(path))
            .open()
            .map_err(map_err)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| {
                keyspace
                    .open_partition(column.as_str(), PartitionCreateOptions::default())
                    .map_err(map_err)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keyspace,
            partitions,
            counters: CommitCounters::default(),
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }

    /// Syncs the journal so every committed batch survives a crash.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }

    pub fn telemetry_snapshot(&self) -> FjallTelemetrySnapshot {
        let mut segments = [0u64; 3];
        for (slot, partition) in segments.iter_mut().zip(&self.partitions) {
            *slot = partition.segment_count() as u64;
        }
        FjallTelemetrySnapshot {
            write_buffer_bytes: self.keyspace.write_buffer_size(),
            journal_count: self.keyspace.journal_count() as u64,
            journal_disk_space_bytes: self.keyspace.journal_disk_space(),
            flushes_completed: self.keyspace.flushes_completed() as u64,
            active_compactions: self.keyspace.active_compactions() as u64,
            segments,
            batches_committed: self.counters.batches.load(Ordering::Relaxed),
            ops_committed: self.counters.ops.load(Ordering::Relaxed),
            coin_batches: self.counters.coin_batches.load(Ordering::Relaxed),
            slow_commits: self.counters.slow.load(Ordering::Relaxed),
        }
    }

    fn record_commit(&self, batch: &WriteBatch, elapsed: Duration) {
        let counters = &self.counters;
        counters.batches.fetch_add(1, Ordering::Relaxed);
        counters.ops.fetch_add(batch.len() as u64, Ordering::Relaxed);
        if batch.columns().contains(Column::Coins) {
            counters.coin_batches.fetch_add(1, Ordering::Relaxed);
        }
        if elapsed < SLOW_COMMIT_THRESHOLD {
            return;
        }
        counters.slow.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let last = counters.last_slow_log_secs.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= SLOW_COMMIT_LOG_INTERVAL_SECS
            && counters
                .last_slow_log_secs
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            ledgerd_log::log_warn!(
                "slow fjall commit: {}ms for {} ops on {} (write_buffer {}B, journals {})",
                elapsed.as_millis(),
                batch.len(),
                batch.columns(),
                self.keyspace.write_buffer_size(),
                self.keyspace.journal_count(),
            );
        }
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.partition(column)?
            .prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(map_err)
            })
            .collect()
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut fjall_batch = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
        for op in batch.iter() {
            let partition = self.partition(op.column())?;
            match op {
                WriteOp::Put { key, value, .. } => {
                    fjall_batch.insert(partition, key.as_slice(), value.as_slice())
                }
                WriteOp::Delete { key, .. } => fjall_batch.remove(partition, key.as_slice()),
            }
        }
        let started = Instant::now();
        fjall_batch.commit().map_err(map_err)?;
        self.record_commit(batch, started.elapsed());
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
