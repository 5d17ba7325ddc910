//! Consensus parameter definitions.

use crate::deployments::{Deployment, DeploymentId, Hash256, MAX_DEPLOYMENTS};
use crate::money::{Amount, COIN};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub subsidy_halving_interval: i32,
    /// Blocks timestamped at or after this use P2SH evaluation.
    pub bip16_time: i64,
    pub bip34_height: i32,
    pub bip34_hash: Hash256,
    pub bip65_height: i32,
    pub bip66_height: i32,
    /// Historical blocks allowed to overwrite unspent coinbase transactions.
    pub bip30_exceptions: Vec<(i32, Hash256)>,
    pub pow_limit: Hash256,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub rule_change_activation_threshold: u32,
    pub miner_confirmation_window: u32,
    pub deployments: [Deployment; MAX_DEPLOYMENTS],
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn deployment(&self, id: DeploymentId) -> &Deployment {
        &self.deployments[id.as_usize()]
    }

    pub fn is_bip30_exception(&self, height: i32, hash: &Hash256) -> bool {
        self.bip30_exceptions
            .iter()
            .any(|(exception_height, exception_hash)| {
                *exception_height == height && exception_hash == hash
            })
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a hash written in display order (most significant byte first).
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let bytes = bytes_from_hex(&padded)?;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Ok(hash)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

pub fn bytes_from_hex(input: &str) -> Result<Vec<u8>, HexError> {
    let hex = input.trim();
    if hex.len() % 2 == 1 {
        return Err(HexError::InvalidLength);
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for start in (0..hex.len()).step_by(2) {
        let pair = hex.get(start..start + 2).ok_or(HexError::InvalidHex)?;
        let byte = u8::from_str_radix(pair, 16).map_err(|_| HexError::InvalidHex)?;
        out.push(byte);
    }
    Ok(out)
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

/// Fields of the hard-coded genesis block.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub reward: Amount,
    pub coinbase_script_sig: &'static str,
    pub output_script_pubkey: &'static str,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub genesis: GenesisParams,
    pub default_rpc_port: u16,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

const GENESIS_COINBASE_SCRIPT_SIG: &str = "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73";
const GENESIS_OUTPUT_SCRIPT_PUBKEY: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

const MAINNET_POW_LIMIT: &str = "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
const REGTEST_POW_LIMIT: &str = "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

const TWO_WEEKS: i64 = 14 * 24 * 60 * 60;
const TEN_MINUTES: i64 = 10 * 60;

fn fixed_hash(hex: &str, label: &str) -> Hash256 {
    hash256_from_hex(hex).expect(label)
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: fixed_hash(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            "mainnet genesis hash",
        ),
        subsidy_halving_interval: 210_000,
        bip16_time: 1_333_238_400,
        bip34_height: 227_931,
        bip34_hash: fixed_hash(
            "000000000000024b89b42a942fe0d9fea3bb44ab7bd1b19115dd6a759c0808b8",
            "mainnet bip34 hash",
        ),
        bip65_height: 388_381,
        bip66_height: 363_725,
        bip30_exceptions: vec![
            (
                91_842,
                fixed_hash(
                    "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
                    "bip30 exception 91842",
                ),
            ),
            (
                91_880,
                fixed_hash(
                    "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
                    "bip30 exception 91880",
                ),
            ),
        ],
        pow_limit: fixed_hash(MAINNET_POW_LIMIT, "mainnet pow limit"),
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        pow_target_spacing: TEN_MINUTES,
        pow_target_timespan: TWO_WEEKS,
        rule_change_activation_threshold: 1916,
        miner_confirmation_window: 2016,
        deployments: [
            Deployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            Deployment {
                bit: 0,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },
            Deployment {
                bit: 1,
                start_time: 1_479_168_000,
                timeout: 1_510_704_000,
            },
        ],
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: fixed_hash(
            "000000000933ea01ad0ee984209779baad7ef2c7c2e92cfb38ccb0c1ae3e5ee7",
            "testnet genesis hash",
        ),
        subsidy_halving_interval: 210_000,
        bip16_time: 1_329_264_000,
        bip34_height: 21_111,
        bip34_hash: fixed_hash(
            "0000000023b3a96d3484e5abb3755c413e7d41500f8e2a5c3f0dd01299cd8ef8",
            "testnet bip34 hash",
        ),
        bip65_height: 581_885,
        bip66_height: 330_776,
        bip30_exceptions: Vec::new(),
        pow_limit: fixed_hash(MAINNET_POW_LIMIT, "testnet pow limit"),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        pow_target_spacing: TEN_MINUTES,
        pow_target_timespan: TWO_WEEKS,
        rule_change_activation_threshold: 1512,
        miner_confirmation_window: 2016,
        deployments: [
            Deployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            Deployment {
                bit: 0,
                start_time: 1_456_790_400,
                timeout: 1_493_596_800,
            },
            Deployment {
                bit: 1,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },
        ],
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: fixed_hash(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            "regtest genesis hash",
        ),
        subsidy_halving_interval: 150,
        bip16_time: 0,
        bip34_height: 100_000_000,
        bip34_hash: [0u8; 32],
        bip65_height: 1351,
        bip66_height: 1251,
        bip30_exceptions: Vec::new(),
        pow_limit: fixed_hash(REGTEST_POW_LIMIT, "regtest pow limit"),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        pow_target_spacing: TEN_MINUTES,
        pow_target_timespan: TWO_WEEKS,
        rule_change_activation_threshold: 108,
        miner_confirmation_window: 144,
        deployments: [
            Deployment {
                bit: 28,
                start_time: 0,
                timeout: 999_999_999_999,
            },
            Deployment {
                bit: 0,
                start_time: 0,
                timeout: 999_999_999_999,
            },
            Deployment {
                bit: 1,
                start_time: 0,
                timeout: 999_999_999_999,
            },
        ],
    }
}

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        consensus: mainnet_consensus_params(),
        genesis: GenesisParams {
            version: 1,
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
            reward: 50 * COIN,
            coinbase_script_sig: GENESIS_COINBASE_SCRIPT_SIG,
            output_script_pubkey: GENESIS_OUTPUT_SCRIPT_PUBKEY,
        },
        default_rpc_port: 8332,
    }
}

fn testnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        consensus: testnet_consensus_params(),
        genesis: GenesisParams {
            version: 1,
            time: 1_296_688_602,
            bits: 0x1d00_ffff,
            nonce: 414_098_458,
            reward: 50 * COIN,
            coinbase_script_sig: GENESIS_COINBASE_SCRIPT_SIG,
            output_script_pubkey: GENESIS_OUTPUT_SCRIPT_PUBKEY,
        },
        default_rpc_port: 18332,
    }
}

fn regtest_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        consensus: regtest_consensus_params(),
        genesis: GenesisParams {
            version: 1,
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
            reward: 50 * COIN,
            coinbase_script_sig: GENESIS_COINBASE_SCRIPT_SIG,
            output_script_pubkey: GENESIS_OUTPUT_SCRIPT_PUBKEY,
        },
        default_rpc_port: 18443,
    }
}
