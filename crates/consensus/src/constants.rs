//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a block excluding witness data, in bytes (network rule).
pub const MAX_BLOCK_BASE_SIZE: u32 = 1_000_000;
/// The maximum allowed weight for a block (network rule).
pub const MAX_BLOCK_WEIGHT: u32 = 4_000_000;
pub const WITNESS_SCALE_FACTOR: u32 = 4;
/// The maximum allowed number of signature check operations in a block, scaled by witness factor.
pub const MAX_BLOCK_SIGOPS_COST: u32 = 80_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Blocks may not be timestamped further than this ahead of adjusted time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks used for median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Lock times below this are block heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Script verification flags handed to the script verifier.
pub const SCRIPT_VERIFY_NONE: u32 = 0;
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
pub const SCRIPT_VERIFY_DERSIG: u32 = 1 << 2;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
pub const SCRIPT_VERIFY_WITNESS: u32 = 1 << 11;
