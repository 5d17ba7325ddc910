//! Consensus loop timing and outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::BlockResult;
use crate::prefetch::PrefetchStatus;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    BlockFetch,
    /// Header, context and structure checks.
    Validation,
    UtxoFetch,
    /// Applying transactions to the working set.
    Execution,
    Commit,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::BlockFetch,
        Stage::Validation,
        Stage::UtxoFetch,
        Stage::Execution,
        Stage::Commit,
    ];

    const fn index(self) -> usize {
        match self {
            Stage::BlockFetch => 0,
            Stage::Validation => 1,
            Stage::UtxoFetch => 2,
            Stage::Execution => 3,
            Stage::Commit => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::BlockFetch => "block_fetch",
            Stage::Validation => "validation",
            Stage::UtxoFetch => "utxo_fetch",
            Stage::Execution => "execution",
            Stage::Commit => "commit",
        }
    }
}

#[derive(Debug, Default)]
struct StageCounter {
    total_us: AtomicU64,
    count: AtomicU64,
}

#[derive(Debug, Default)]
pub struct ConsensusPerformanceCounter {
    stages: [StageCounter; 5],
    connected: AtomicU64,
    invalid: AtomicU64,
    failed: AtomicU64,
    prefetch_scheduled: AtomicU64,
    prefetch_dropped: AtomicU64,
    prefetch_completed: AtomicU64,
    prefetch_failed: AtomicU64,
    prefetch_warmed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub total_us: u64,
    pub count: u64,
}

impl StageSnapshot {
    pub fn average_us(&self) -> u64 {
        self.total_us.checked_div(self.count).unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ConsensusPerformanceSnapshot {
    pub block_fetch: StageSnapshot,
    pub validation: StageSnapshot,
    pub utxo_fetch: StageSnapshot,
    pub execution: StageSnapshot,
    pub commit: StageSnapshot,
    pub connected: u64,
    pub invalid: u64,
    pub failed: u64,
    pub prefetch_scheduled: u64,
    pub prefetch_dropped: u64,
    pub prefetch_completed: u64,
    pub prefetch_failed: u64,
    pub prefetch_warmed: u64,
}

impl ConsensusPerformanceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the time until the returned guard is dropped against `stage`.
    pub fn time(&self, stage: Stage) -> StageTimer<'_> {
        StageTimer {
            counter: self,
            stage,
            start: Instant::now(),
        }
    }

    pub fn record(&self, stage: Stage, elapsed: Duration) {
        let counter = &self.stages[stage.index()];
        counter
            .total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        counter.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, result: &BlockResult) {
        let counter = match result {
            BlockResult::Connected(_) => &self.connected,
            BlockResult::Invalid { .. } => &self.invalid,
            BlockResult::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_scheduled(&self) {
        self.prefetch_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a resolved ticket. `Pending` is ignored.
    pub fn record_prefetch(&self, status: PrefetchStatus) {
        match status {
            PrefetchStatus::Pending => {}
            PrefetchStatus::Completed(warmed) => {
                self.prefetch_completed.fetch_add(1, Ordering::Relaxed);
                self.prefetch_warmed
                    .fetch_add(warmed as u64, Ordering::Relaxed);
            }
            PrefetchStatus::Failed => {
                self.prefetch_failed.fetch_add(1, Ordering::Relaxed);
            }
            PrefetchStatus::Dropped => {
                self.prefetch_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stage(&self, stage: Stage) -> StageSnapshot {
        let counter = &self.stages[stage.index()];
        StageSnapshot {
            total_us: counter.total_us.load(Ordering::Relaxed),
            count: counter.count.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> ConsensusPerformanceSnapshot {
        ConsensusPerformanceSnapshot {
            block_fetch: self.stage(Stage::BlockFetch),
            validation: self.stage(Stage::Validation),
            utxo_fetch: self.stage(Stage::UtxoFetch),
            execution: self.stage(Stage::Execution),
            commit: self.stage(Stage::Commit),
            connected: self.connected.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            prefetch_scheduled: self.prefetch_scheduled.load(Ordering::Relaxed),
            prefetch_dropped: self.prefetch_dropped.load(Ordering::Relaxed),
            prefetch_completed: self.prefetch_completed.load(Ordering::Relaxed),
            prefetch_failed: self.prefetch_failed.load(Ordering::Relaxed),
            prefetch_warmed: self.prefetch_warmed.load(Ordering::Relaxed),
        }
    }
}

pub struct StageTimer<'a> {
    counter: &'a ConsensusPerformanceCounter,
    stage: Stage,
    start: Instant,
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.counter.record(self.stage, self.start.elapsed());
    }
}
