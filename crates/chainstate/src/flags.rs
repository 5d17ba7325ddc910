use ledgerd_consensus::constants::{
    SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, SCRIPT_VERIFY_DERSIG,
    SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS,
};
use ledgerd_consensus::{ConsensusParams, DeploymentId, DeploymentStates, Hash256};

use crate::index::ChainedHeader;

/// Optional rules in force for one block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConsensusFlags {
    /// Reject blocks that overwrite a transaction with unspent outputs.
    pub enforce_bip30: bool,
    /// Coinbase must start with the block height.
    pub enforce_bip34: bool,
    pub script_flags: u32,
    /// Lock times compare against median-time-past instead of block time.
    pub lock_time_uses_mtp: bool,
    pub segwit_active: bool,
}

impl ConsensusFlags {
    /// `bip34_ancestor` is the hash at `bip34_height` on the chain the
    /// block extends, if the chain is that tall.
    pub fn new(
        header: &ChainedHeader,
        bip34_ancestor: Option<&Hash256>,
        states: &DeploymentStates,
        params: &ConsensusParams,
    ) -> Self {
        let exception = params.is_bip30_exception(header.height, &header.hash);
        let bip34_settled = bip34_ancestor.is_some_and(|hash| *hash == params.bip34_hash);
        let enforce_bip30 = !exception && !bip34_settled;

        let mut script_flags = SCRIPT_VERIFY_NONE;
        if header.time() >= params.bip16_time {
            script_flags |= SCRIPT_VERIFY_P2SH;
        }
        if header.height >= params.bip66_height {
            script_flags |= SCRIPT_VERIFY_DERSIG;
        }
        if header.height >= params.bip65_height {
            script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        let csv_active = states.is_active(DeploymentId::Csv);
        if csv_active {
            script_flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
        }
        let segwit_active = states.is_active(DeploymentId::Segwit);
        if segwit_active {
            script_flags |= SCRIPT_VERIFY_WITNESS;
        }

        Self {
            enforce_bip30,
            enforce_bip34: header.height >= params.bip34_height,
            script_flags,
            lock_time_uses_mtp: csv_active,
            segwit_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_consensus::{consensus_params, Network, ThresholdState};
    use ledgerd_primitives::block::BlockHeader;

    fn chained(height: i32, hash: Hash256, time: u32) -> ChainedHeader {
        ChainedHeader {
            hash,
            height,
            header: BlockHeader {
                version: 4,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time,
                bits: 0x1d00_ffff,
                nonce: 0,
            },
            chainwork: [0u8; 32],
        }
    }

    #[test]
    fn bip30_exception_blocks_skip_enforcement() {
        let params = consensus_params(Network::Mainnet);
        let (height, hash) = params.bip30_exceptions[0];
        let states = DeploymentStates::all_defined();
        let flags = ConsensusFlags::new(&chained(height, hash, 1_300_000_000), None, &states, &params);
        assert!(!flags.enforce_bip30);
        assert!(!flags.enforce_bip34);
        assert_eq!(flags.script_flags, SCRIPT_VERIFY_NONE);

        let other = ConsensusFlags::new(&chained(height, [1u8; 32], 1_300_000_000), None, &states, &params);
        assert!(other.enforce_bip30);
    }

    #[test]
    fn bip34_ancestor_turns_off_bip30() {
        let params = consensus_params(Network::Mainnet);
        let states = DeploymentStates::all_defined();
        let header = chained(params.bip34_height + 10, [2u8; 32], 1_400_000_000);
        let settled = ConsensusFlags::new(&header, Some(&params.bip34_hash), &states, &params);
        assert!(!settled.enforce_bip30);
        assert!(settled.enforce_bip34);
        assert_ne!(settled.script_flags & SCRIPT_VERIFY_P2SH, 0);

        let other_chain = ConsensusFlags::new(&header, Some(&[3u8; 32]), &states, &params);
        assert!(other_chain.enforce_bip30);
    }

    #[test]
    fn deployment_states_gate_script_flags() {
        let params = consensus_params(Network::Regtest);
        let mut states = DeploymentStates::all_defined();
        states.set(DeploymentId::Csv, ThresholdState::Active);
        let flags = ConsensusFlags::new(&chained(10, [4u8; 32], 1), None, &states, &params);
        assert!(flags.lock_time_uses_mtp);
        assert_ne!(flags.script_flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, 0);
        assert_eq!(flags.script_flags & SCRIPT_VERIFY_WITNESS, 0);
        assert!(!flags.segwit_active);
        assert!(flags.enforce_bip30);
    }
}
