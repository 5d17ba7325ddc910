//! Consensus constants, network parameters, and versionbits deployments.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;

pub use deployments::{
    Deployment, DeploymentId, DeploymentStates, Hash256, ThresholdState, ALL_DEPLOYMENTS,
};
pub use money::{block_subsidy, Amount};
pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams,
    ConsensusParams, GenesisParams, Network,
};
