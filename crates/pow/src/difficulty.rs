//! Difficulty and compact target utilities.

use ledgerd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    MissingAncestor(i64),
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingAncestor(height) => {
                write!(f, "missing ancestor header at height {height}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The fields of a chain entry that retargeting looks at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(u256_to_hash(value))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Bits required for the block after `prev`.
///
/// `ancestor` resolves a height on the chain ending at `prev`; it is only
/// consulted on retarget boundaries and on the min-difficulty walk back.
pub fn get_next_work_required<F>(
    prev: Option<&HeaderInfo>,
    next_block_time: i64,
    params: &ConsensusParams,
    mut ancestor: F,
) -> Result<u32, DifficultyError>
where
    F: FnMut(i64) -> Option<HeaderInfo>,
{
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let Some(last) = prev else {
        return Ok(pow_limit_bits);
    };
    let interval = params.difficulty_adjustment_interval();

    if (last.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            if next_block_time > last.time + params.pow_target_spacing * 2 {
                return Ok(pow_limit_bits);
            }
            let mut cursor = *last;
            while cursor.height > 0
                && cursor.height % interval != 0
                && cursor.bits == pow_limit_bits
            {
                cursor = ancestor(cursor.height - 1)
                    .ok_or(DifficultyError::MissingAncestor(cursor.height - 1))?;
            }
            return Ok(cursor.bits);
        }
        return Ok(last.bits);
    }

    let first_height = last.height - (interval - 1);
    let first = ancestor(first_height).ok_or(DifficultyError::MissingAncestor(first_height))?;
    calculate_next_work_required(last, first.time, params)
}

pub fn calculate_next_work_required(
    last: &HeaderInfo,
    first_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let timespan = params.pow_target_timespan;
    let actual = (last.time - first_block_time).clamp(timespan / 4, timespan * 4);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let target = compact_to_u256(last.bits)?;
    let scaled = target
        .checked_mul(U256::from(actual as u64))
        .map(|value| value / U256::from(timespan as u64))
        .unwrap_or(pow_limit);
    let next = if scaled > pow_limit { pow_limit } else { scaled };
    Ok(u256_to_compact(next))
}

fn u256_to_hash(value: U256) -> Hash256 {
    value.to_little_endian()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_consensus::{consensus_params, Network};

    fn info(height: i64, time: i64, bits: u32) -> HeaderInfo {
        HeaderInfo { height, time, bits }
    }

    #[test]
    fn compact_target_bytes_are_little_endian() {
        let target = compact_to_target(0x1d00_ffff).expect("target");
        let mut expected = [0u8; 32];
        expected[26] = 0xff;
        expected[27] = 0xff;
        assert_eq!(target, expected);
        assert_eq!(target_to_compact(&target), 0x1d00_ffff);
    }

    #[test]
    fn retarget_vector_from_mainnet_block_32255() {
        let params = consensus_params(Network::Mainnet);
        let last = info(32_255, 1_262_152_739, 0x1d00_ffff);
        let bits = calculate_next_work_required(&last, 1_261_130_161, &params).expect("bits");
        assert_eq!(bits, 0x1d00_d86a);
    }

    #[test]
    fn retarget_is_clamped_to_a_factor_of_four() {
        let params = consensus_params(Network::Mainnet);
        let last = info(2015, 1_000_000, 0x1c05_a3f4);
        let fast = calculate_next_work_required(&last, 1_000_000 - 60, &params).expect("fast");
        let slow =
            calculate_next_work_required(&last, 1_000_000 - 400 * 24 * 3600, &params).expect("slow");
        let start = compact_to_u256(0x1c05_a3f4).expect("target");
        let fast_target = compact_to_u256(fast).expect("fast target");
        let slow_target = compact_to_u256(slow).expect("slow target");
        assert!(fast_target <= start / U256::from(4u64));
        assert!(fast_target > start / U256::from(5u64));
        assert!(slow_target <= start * U256::from(4u64));
        assert!(slow_target > start * U256::from(3u64));
    }

    #[test]
    fn easiest_target_never_exceeds_limit() {
        let params = consensus_params(Network::Mainnet);
        let last = info(2015, 10_000_000, 0x1d00_ffff);
        let bits = calculate_next_work_required(&last, 0, &params).expect("bits");
        assert_eq!(bits, 0x1d00_ffff);
    }

    #[test]
    fn no_retargeting_keeps_bits() {
        let params = consensus_params(Network::Regtest);
        let last = info(2015, 1_000, 0x207f_ffff);
        let bits =
            get_next_work_required(Some(&last), 1_600, &params, |_| Some(info(0, 0, 0x207f_ffff)))
                .expect("bits");
        assert_eq!(bits, 0x207f_ffff);
    }

    #[test]
    fn off_boundary_keeps_previous_bits() {
        let params = consensus_params(Network::Mainnet);
        let last = info(100, 1_000, 0x1c00_ffff);
        let bits = get_next_work_required(Some(&last), 1_600, &params, |_| None).expect("bits");
        assert_eq!(bits, 0x1c00_ffff);
    }

    #[test]
    fn min_difficulty_walks_back_past_easy_blocks() {
        let params = consensus_params(Network::Testnet);
        let limit = target_to_compact(&params.pow_limit);
        let chain = [
            info(4032, 0, 0x1c00_ffff),
            info(4033, 600, 0x1c00_ffff),
            info(4034, 1_200, limit),
            info(4035, 1_800, limit),
        ];
        let last = chain[3];
        let lookup = |height: i64| chain.iter().find(|entry| entry.height == height).copied();
        let late = get_next_work_required(Some(&last), 1_800 + 1_201, &params, lookup)
            .expect("late block");
        assert_eq!(late, limit);
        let on_time =
            get_next_work_required(Some(&last), 2_400, &params, lookup).expect("on time");
        assert_eq!(on_time, 0x1c00_ffff);
    }

    #[test]
    fn boundary_needs_first_block_of_window() {
        let params = consensus_params(Network::Mainnet);
        let last = info(2015, 1_209_600, 0x1d00_ffff);
        let err = get_next_work_required(Some(&last), 1_210_200, &params, |_| None)
            .expect_err("missing ancestor");
        assert_eq!(err, DifficultyError::MissingAncestor(0));
        let bits = get_next_work_required(Some(&last), 1_210_200, &params, |height| {
            Some(info(height, 0, 0x1d00_ffff))
        })
        .expect("bits");
        assert_eq!(bits, 0x1d00_ffff);
    }

    #[test]
    fn genesis_uses_pow_limit() {
        let params = consensus_params(Network::Mainnet);
        let bits = get_next_work_required(None, 0, &params, |_| None).expect("bits");
        assert_eq!(bits, 0x1d00_ffff);
    }
}
