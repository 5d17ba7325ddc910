//! Monetary units, money range rules, and the block subsidy schedule.

use crate::params::ConsensusParams;

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in satoshi) is valid.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    if params.subsidy_halving_interval <= 0 || height < 0 {
        return 50 * COIN;
    }
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}
