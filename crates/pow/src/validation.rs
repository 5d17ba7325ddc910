use ledgerd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `hash` satisfies the compact target `bits` and that the target
/// is within the network's proof-of-work limit.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash_value = U256::from_little_endian(hash);
    if hash_value > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_consensus::{consensus_params, Network};

    #[test]
    fn genesis_hash_meets_its_own_target() {
        let params = consensus_params(Network::Mainnet);
        check_proof_of_work(&params.hash_genesis_block, 0x1d00_ffff, &params).expect("pow");
    }

    #[test]
    fn target_above_limit_is_rejected() {
        let params = consensus_params(Network::Mainnet);
        let err = check_proof_of_work(&[0u8; 32], 0x207f_ffff, &params).expect_err("limit");
        assert_eq!(err, PowError::InvalidBits("pow target above limit"));
    }

    #[test]
    fn hash_above_target_is_rejected() {
        let params = consensus_params(Network::Regtest);
        let err = check_proof_of_work(&[0xffu8; 32], 0x207f_ffff, &params).expect_err("hash");
        assert_eq!(err, PowError::HashMismatch);
    }

    #[test]
    fn negative_compact_is_rejected() {
        let params = consensus_params(Network::Regtest);
        let err = check_proof_of_work(&[0u8; 32], 0x0480_0001, &params).expect_err("negative");
        assert_eq!(err, PowError::Compact(CompactError::Negative));
    }
}
