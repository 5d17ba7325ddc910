//! The block-at-a-time validation loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ledgerd_consensus::{hash256_to_hex, Hash256};
use ledgerd_pow::block_proof;
use ledgerd_primitives::block::Block;
use ledgerd_storage::KeyValueStore;

use crate::coinview::CoinView;
use crate::error::{
    BlockResult, ChainIndexError, CoinViewError, ConnectedBlock, ConsensusError, LoopError,
    PullError,
};
use crate::flags::ConsensusFlags;
use crate::index::{ChainIndex, ChainedHeader};
use crate::metrics::{ConsensusPerformanceCounter, Stage};
use crate::prefetch::{PrefetchStatus, PrefetchTicket, Prefetcher};
use crate::puller::BlockPuller;
use crate::validator::{ContextInformation, Validator};
use crate::versionbits::ActivationStateCache;
use crate::working::WorkingUtxoSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoopOptions {
    /// Warm the coin cache with the next block's inputs while the current
    /// block executes.
    pub prefetch: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self { prefetch: true }
    }
}

enum StepError {
    Invalid(Hash256, ConsensusError),
    Failed(LoopError),
}

impl From<LoopError> for StepError {
    fn from(err: LoopError) -> Self {
        StepError::Failed(err)
    }
}

impl From<ChainIndexError> for StepError {
    fn from(err: ChainIndexError) -> Self {
        StepError::Failed(err.into())
    }
}

impl From<CoinViewError> for StepError {
    fn from(err: CoinViewError) -> Self {
        StepError::Failed(err.into())
    }
}

impl From<PullError> for StepError {
    fn from(err: PullError) -> Self {
        StepError::Failed(err.into())
    }
}

fn rejected(hash: Hash256) -> impl Fn(ConsensusError) -> StepError {
    move |err| StepError::Invalid(hash, err)
}

/// Owns the validated tip and moves it forward one block per `advance`.
///
/// The tip always names the block the coin view last committed. A call
/// either commits the next block and moves the tip, or leaves both alone.
pub struct ConsensusLoop<X, V, P, S> {
    validator: X,
    chain: Arc<ChainIndex<S>>,
    coin_view: V,
    puller: P,
    tip: ChainedHeader,
    activation: ActivationStateCache,
    metrics: Arc<ConsensusPerformanceCounter>,
    prefetcher: Option<Prefetcher>,
    /// Scheduled warms whose outcome has not been recorded yet.
    pending_prefetch: Vec<PrefetchTicket>,
    diverged: bool,
}

impl<X, V, P, S> ConsensusLoop<X, V, P, S>
where
    X: Validator,
    V: CoinView,
    P: BlockPuller,
    S: KeyValueStore,
{
    pub fn new(
        validator: X,
        chain: Arc<ChainIndex<S>>,
        coin_view: V,
        mut puller: P,
        options: LoopOptions,
    ) -> Result<Self, LoopError> {
        let tip = resolve_tip(&chain, &coin_view)?;
        puller.set_location(&tip);
        let prefetcher = if options.prefetch {
            match Prefetcher::spawn() {
                Ok(prefetcher) => Some(prefetcher),
                Err(err) => {
                    ledgerd_log::log_warn!("utxo prefetch disabled: {err}");
                    None
                }
            }
        } else {
            None
        };
        ledgerd_log::log_info!(
            "consensus loop starting at height {} ({})",
            tip.height,
            hash256_to_hex(&tip.hash)
        );
        Ok(Self {
            validator,
            chain,
            coin_view,
            puller,
            tip,
            activation: ActivationStateCache::new(),
            metrics: Arc::new(ConsensusPerformanceCounter::new()),
            prefetcher,
            pending_prefetch: Vec::new(),
            diverged: false,
        })
    }

    pub fn tip(&self) -> &ChainedHeader {
        &self.tip
    }

    pub fn validator(&self) -> &X {
        &self.validator
    }

    pub fn puller(&self) -> &P {
        &self.puller
    }

    pub fn puller_mut(&mut self) -> &mut P {
        &mut self.puller
    }

    pub fn coin_view(&self) -> &V {
        &self.coin_view
    }

    pub fn chain(&self) -> &Arc<ChainIndex<S>> {
        &self.chain
    }

    pub fn activation_cache(&self) -> &ActivationStateCache {
        &self.activation
    }

    pub fn metrics(&self) -> &Arc<ConsensusPerformanceCounter> {
        &self.metrics
    }

    /// Scheduled warms still running.
    pub fn pending_prefetches(&self) -> usize {
        self.pending_prefetch.len()
    }

    pub fn is_diverged(&self) -> bool {
        self.diverged
    }

    /// Re-reads the tip from the coin view and repositions the puller.
    pub fn resync(&mut self) -> Result<&ChainedHeader, LoopError> {
        let tip = resolve_tip(&self.chain, &self.coin_view)?;
        if tip.hash != self.tip.hash {
            ledgerd_log::log_warn!(
                "resync moved tip from height {} to {} ({})",
                self.tip.height,
                tip.height,
                hash256_to_hex(&tip.hash)
            );
        }
        self.puller.set_location(&tip);
        self.tip = tip;
        self.diverged = false;
        Ok(&self.tip)
    }

    /// Validates and applies the next block from the puller.
    pub fn advance(&mut self) -> BlockResult {
        let result = if self.diverged {
            BlockResult::Failed(LoopError::Diverged)
        } else {
            self.collect_prefetch();
            match self.execute_next_block() {
                Ok(connected) => BlockResult::Connected(Box::new(connected)),
                Err(StepError::Invalid(hash, error)) => BlockResult::Invalid { hash, error },
                Err(StepError::Failed(err)) => BlockResult::Failed(err),
            }
        };
        self.metrics.record_outcome(&result);
        match &result {
            BlockResult::Connected(connected) => ledgerd_log::log_debug!(
                "connected block {} at height {} ({} txs)",
                hash256_to_hex(&connected.tip.hash),
                connected.tip.height,
                connected.block.transactions.len()
            ),
            BlockResult::Invalid { hash, error } => ledgerd_log::log_warn!(
                "rejected block {} on top of height {}: {error}",
                hash256_to_hex(hash),
                self.tip.height
            ),
            BlockResult::Failed(LoopError::CommitRejected { expected, actual }) => {
                ledgerd_log::log_error!(
                    "coin view moved underneath the loop: expected {}, found {}",
                    hash256_to_hex(expected),
                    hash256_to_hex(actual)
                )
            }
            BlockResult::Failed(LoopError::Pull(PullError::Disconnected)) => {}
            BlockResult::Failed(err) => ledgerd_log::log_warn!("advance failed: {err}"),
        }
        result
    }

    fn execute_next_block(&mut self) -> Result<ConnectedBlock, StepError> {
        let metrics = Arc::clone(&self.metrics);
        let block = {
            let _timer = metrics.time(Stage::BlockFetch);
            self.puller.next_block()?
        };
        let hash = block.hash();
        let params = self.validator.params();

        let (chained, flags) = {
            let _timer = metrics.time(Stage::Validation);
            self.validator
                .check_block_header(&block.header)
                .map_err(rejected(hash))?;
            if block.header.prev_block != self.tip.hash {
                return Err(StepError::Invalid(
                    hash,
                    ConsensusError::header_context("bad-prevblk"),
                ));
            }
            let work = block_proof(block.header.bits)
                .map_err(|_| StepError::Invalid(hash, ConsensusError::header("bad-diffbits")))?;
            let chained = ChainedHeader {
                hash,
                height: self.tip.height + 1,
                header: block.header.clone(),
                chainwork: self
                    .tip
                    .chainwork_value()
                    .saturating_add(work)
                    .to_big_endian(),
            };
            let context = ContextInformation {
                height: chained.height,
                median_time_past: self.chain.median_time_past(&self.tip)?,
                expected_bits: self.chain.next_work_required(
                    &self.tip,
                    chained.time(),
                    params,
                )?,
                adjusted_time: adjusted_time(),
            };
            self.validator
                .contextual_check_block_header(&block.header, &context)
                .map_err(rejected(hash))?;

            let states = self.activation.get_states(&self.chain, params, &self.tip)?;
            let bip34_ancestor = self
                .chain
                .ancestor(&self.tip, params.bip34_height)?
                .map(|header| header.hash);
            let flags = ConsensusFlags::new(&chained, bip34_ancestor.as_ref(), &states, params);

            self.validator
                .contextual_check_block(&block, &flags, &context)
                .map_err(rejected(hash))?;
            self.validator
                .check_block(&block)
                .map_err(rejected(hash))?;
            (chained, flags)
        };

        let working = {
            let _timer = metrics.time(Stage::UtxoFetch);
            let ids = fetch_ids(&block, flags.enforce_bip30);
            WorkingUtxoSet::from_fetched(self.coin_view.fetch_coins(&ids)?)
        };

        self.try_prefetch(&flags);

        let working = {
            let _timer = metrics.time(Stage::Execution);
            self.validator
                .execute_block(&block, &chained, &flags, working)
                .map_err(rejected(hash))?
        };

        {
            let _timer = metrics.time(Stage::Commit);
            let delta = working.into_delta();
            if let Err(err) = self
                .coin_view
                .save_changes(&delta, &self.tip.hash, &chained.hash)
            {
                let err = LoopError::from(err);
                if matches!(err, LoopError::CommitRejected { .. }) {
                    self.diverged = true;
                }
                return Err(StepError::Failed(err));
            }
        }

        self.tip = chained.clone();
        // Only committed blocks reach the index.
        if !self.chain.contains(&hash)? {
            self.chain.insert_header(&block.header)?;
        }
        Ok(ConnectedBlock {
            tip: chained,
            block,
        })
    }

    /// Starts warming the cache for the block after this one, if both the
    /// view and the puller support it. Never waits.
    fn try_prefetch(&mut self, flags: &ConsensusFlags) {
        let Some(prefetcher) = self.prefetcher.as_ref() else {
            return;
        };
        let Some(cache) = self.coin_view.warm_cache() else {
            return;
        };
        let Some(lookahead) = self.puller.lookahead() else {
            return;
        };
        let Some(next) = lookahead.try_get_lookahead(0) else {
            return;
        };
        let ids = fetch_ids(&next, flags.enforce_bip30);
        if ids.is_empty() {
            return;
        }
        self.metrics.record_prefetch_scheduled();
        self.pending_prefetch.push(prefetcher.schedule(cache, ids));
        self.collect_prefetch();
    }

    /// Records every ticket that has resolved and keeps the rest.
    fn collect_prefetch(&mut self) {
        let metrics = &self.metrics;
        self.pending_prefetch.retain_mut(|ticket| match ticket.poll() {
            PrefetchStatus::Pending => true,
            resolved => {
                metrics.record_prefetch(resolved);
                false
            }
        });
    }
}

/// Transactions whose coins `block` reads: its own txids when duplicate
/// transactions are being rejected, and every txid a non-coinbase input
/// spends. Deduplicated, in first-seen order.
pub fn fetch_ids(block: &Block, enforce_bip30: bool) -> Vec<Hash256> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for tx in &block.transactions {
        if enforce_bip30 {
            let txid = tx.txid();
            if seen.insert(txid) {
                ids.push(txid);
            }
        }
        if tx.is_coinbase() {
            continue;
        }
        for input in &tx.vin {
            if seen.insert(input.prevout.hash) {
                ids.push(input.prevout.hash);
            }
        }
    }
    ids
}

fn resolve_tip<V: CoinView, S: KeyValueStore>(
    chain: &ChainIndex<S>,
    coin_view: &V,
) -> Result<ChainedHeader, LoopError> {
    let hash = coin_view.best_block_hash()?;
    chain
        .header_by_hash(&hash)?
        .ok_or(LoopError::MissingTip(hash))
}

fn adjusted_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
