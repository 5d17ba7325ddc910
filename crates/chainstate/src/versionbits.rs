//! Versionbits deployment states, memoized per retargeting window.

use std::collections::HashMap;

use ledgerd_consensus::deployments::MAX_DEPLOYMENTS;
use ledgerd_consensus::{
    ConsensusParams, DeploymentId, DeploymentStates, Hash256, ThresholdState, ALL_DEPLOYMENTS,
};
use ledgerd_storage::KeyValueStore;
use serde::Serialize;

use crate::error::ChainIndexError;
use crate::index::{ChainIndex, ChainedHeader};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ActivationCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub windows_computed: u64,
    pub reorg_evictions: u64,
}

/// Deployment states for the block after a tip.
///
/// A block's state only depends on the last block of the previous window
/// (the representative). Windows are cached by representative hash, so two
/// branches never share an entry unless they share the representative.
#[derive(Default)]
pub struct ActivationStateCache {
    windows: [HashMap<Hash256, (i32, ThresholdState)>; MAX_DEPLOYMENTS],
    last: Option<(ChainedHeader, DeploymentStates)>,
    stats: ActivationCacheStats,
}

impl ActivationStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ActivationCacheStats {
        self.stats
    }

    pub fn cached_windows(&self) -> usize {
        self.windows.iter().map(HashMap::len).sum()
    }

    pub fn get_states<S: KeyValueStore>(
        &mut self,
        chain: &ChainIndex<S>,
        params: &ConsensusParams,
        tip: &ChainedHeader,
    ) -> Result<DeploymentStates, ChainIndexError> {
        let period = window_period(params);
        let representative = chain.ancestor(tip, representative_height(tip.height, period))?;

        let Some(representative) = representative else {
            self.stats.hits += 1;
            return Ok(DeploymentStates::all_defined());
        };
        if let Some((last_rep, states)) = &self.last {
            if last_rep.hash == representative.hash {
                self.stats.hits += 1;
                return Ok(*states);
            }
        }
        self.stats.misses += 1;
        self.evict_abandoned_branch(chain, &representative, period)?;

        let mut states = DeploymentStates::all_defined();
        for id in ALL_DEPLOYMENTS {
            let state = self.state_for(chain, params, id, Some(representative.clone()))?;
            states.set(id, state);
        }
        self.last = Some((representative, states));
        Ok(states)
    }

    /// Drops windows cached above the fork point when `representative` does
    /// not extend the previously seen one.
    fn evict_abandoned_branch<S: KeyValueStore>(
        &mut self,
        chain: &ChainIndex<S>,
        representative: &ChainedHeader,
        period: i32,
    ) -> Result<(), ChainIndexError> {
        let Some((last_rep, _)) = &self.last else {
            return Ok(());
        };
        let mut height = last_rep.height.min(representative.height);
        loop {
            if height < 0 {
                break;
            }
            let ours = chain.ancestor(representative, height)?;
            let theirs = chain.ancestor(last_rep, height)?;
            match (ours, theirs) {
                (Some(ours), Some(theirs)) if ours.hash == theirs.hash => break,
                _ => height -= period,
            }
        }
        if height == last_rep.height {
            return Ok(());
        }
        let mut evicted = 0u64;
        for windows in &mut self.windows {
            let before = windows.len();
            windows.retain(|_, (entry_height, _)| *entry_height <= height);
            evicted += (before - windows.len()) as u64;
        }
        if evicted > 0 {
            self.stats.reorg_evictions += evicted;
            ledgerd_log::log_debug!(
                "activation cache dropped {evicted} window(s) above height {height} after reorg"
            );
        }
        Ok(())
    }

    fn state_for<S: KeyValueStore>(
        &mut self,
        chain: &ChainIndex<S>,
        params: &ConsensusParams,
        id: DeploymentId,
        representative: Option<ChainedHeader>,
    ) -> Result<ThresholdState, ChainIndexError> {
        let deployment = *params.deployment(id);
        let period = window_period(params);
        let cache = &mut self.windows[id.as_usize()];

        let mut to_compute = Vec::new();
        let mut cursor = representative;
        let mut state = loop {
            let Some(current) = cursor else {
                break ThresholdState::Defined;
            };
            if let Some((_, state)) = cache.get(&current.hash) {
                break *state;
            }
            let mtp = chain.median_time_past(&current)?;
            if mtp < deployment.start_time {
                cache.insert(current.hash, (current.height, ThresholdState::Defined));
                break ThresholdState::Defined;
            }
            cursor = chain.ancestor(&current, current.height - period)?;
            to_compute.push((current, mtp));
        };

        while let Some((current, mtp)) = to_compute.pop() {
            let next = match state {
                ThresholdState::Defined if mtp >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Defined if mtp >= deployment.start_time => ThresholdState::Started,
                ThresholdState::Started if mtp >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Started => {
                    let votes = count_signals(chain, &current, period, |version| {
                        deployment.signals(version)
                    })?;
                    if votes >= params.rule_change_activation_threshold {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                other => other,
            };
            self.stats.windows_computed += 1;
            cache.insert(current.hash, (current.height, next));
            state = next;
        }
        Ok(state)
    }
}

fn window_period(params: &ConsensusParams) -> i32 {
    params.miner_confirmation_window.max(1) as i32
}

/// Height of the last block of the window preceding the child of `height`.
fn representative_height(height: i32, period: i32) -> i32 {
    height - ((height + 1) % period)
}

fn count_signals<S, F>(
    chain: &ChainIndex<S>,
    last: &ChainedHeader,
    period: i32,
    signals: F,
) -> Result<u32, ChainIndexError>
where
    S: KeyValueStore,
    F: Fn(i32) -> bool,
{
    let mut count = 0u32;
    let mut current = last.clone();
    for step in 0..period {
        if signals(current.header.version) {
            count += 1;
        }
        if step + 1 == period || current.height == 0 {
            break;
        }
        current = chain
            .header_by_hash(current.prev_hash())?
            .ok_or(ChainIndexError::Corrupt("window header missing"))?;
    }
    Ok(count)
}
