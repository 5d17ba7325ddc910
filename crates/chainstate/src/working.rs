//! Block-scoped coin overlay that execution mutates and the loop commits.

use std::collections::BTreeMap;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxOut};

use crate::coins::{Coins, FetchedCoins, UtxoDelta};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub output: TxOut,
    pub height: i32,
    pub coinbase: bool,
}

#[derive(Clone, Debug)]
struct WorkingEntry {
    original: Option<Coins>,
    current: Option<Coins>,
}

/// Coins one block reads and writes. Built from a fetch, consumed by
/// `into_delta`.
#[derive(Clone, Debug, Default)]
pub struct WorkingUtxoSet {
    entries: BTreeMap<Hash256, WorkingEntry>,
}

impl WorkingUtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fetched(fetched: FetchedCoins) -> Self {
        let entries = fetched
            .into_iter()
            .map(|(txid, coins)| {
                let coins = coins.filter(|coins| !coins.is_pruned());
                (
                    txid,
                    WorkingEntry {
                        original: coins.clone(),
                        current: coins,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unspent coins of `txid`, if any remain.
    pub fn coins(&self, txid: &Hash256) -> Option<&Coins> {
        self.entries
            .get(txid)?
            .current
            .as_ref()
            .filter(|coins| !coins.is_pruned())
    }

    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.coins(&outpoint.hash)?.output(outpoint.index)
    }

    pub fn spend(&mut self, outpoint: &OutPoint) -> Option<SpentOutput> {
        let entry = self.entries.get_mut(&outpoint.hash)?;
        let coins = entry.current.as_mut()?;
        let output = coins.spend(outpoint.index)?;
        let spent = SpentOutput {
            output,
            height: coins.height,
            coinbase: coins.coinbase,
        };
        if coins.is_pruned() {
            entry.current = None;
        }
        Some(spent)
    }

    /// Records the outputs of `tx` as unspent at `height`.
    pub fn add_transaction(&mut self, tx: &Transaction, txid: Hash256, height: i32) {
        let coins = Coins::from_transaction(tx, height);
        let current = (!coins.is_pruned()).then_some(coins);
        self.entries
            .entry(txid)
            .and_modify(|entry| entry.current = current.clone())
            .or_insert(WorkingEntry {
                original: None,
                current,
            });
    }

    /// The entries whose value changed since the fetch.
    pub fn into_delta(self) -> UtxoDelta {
        let mut delta = UtxoDelta::new();
        for (txid, entry) in self.entries {
            if entry.original != entry.current {
                delta.set(txid, entry.current);
            }
        }
        delta
    }
}
