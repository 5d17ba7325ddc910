//! Error types shared by the chain index, coin views and the consensus loop.

use std::fmt;

use ledgerd_consensus::{hash256_to_hex, Hash256};
use ledgerd_primitives::block::Block;
use ledgerd_primitives::encoding::DecodeError;
use ledgerd_storage::StoreError;

use crate::index::ChainedHeader;

/// Which class of consensus rule a block broke.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConsensusErrorKind {
    /// Proof of work or other context-free header rule.
    HeaderInvalid,
    /// Timestamp, difficulty or version against the chain history.
    HeaderContextInvalid,
    /// Size, merkle root or per-transaction sanity.
    BlockStructureInvalid,
    /// Finality, coinbase height, weight, duplicate txids under BIP30.
    BlockContextInvalid,
    /// A transaction failed while being applied to the coin set.
    ExecutionInvalid,
}

impl ConsensusErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeaderInvalid => "header-invalid",
            Self::HeaderContextInvalid => "header-context-invalid",
            Self::BlockStructureInvalid => "block-structure-invalid",
            Self::BlockContextInvalid => "block-context-invalid",
            Self::ExecutionInvalid => "execution-invalid",
        }
    }
}

/// A consensus verdict against one block. Never fatal to the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConsensusError {
    pub kind: ConsensusErrorKind,
    pub reason: &'static str,
}

impl ConsensusError {
    pub const fn new(kind: ConsensusErrorKind, reason: &'static str) -> Self {
        Self { kind, reason }
    }

    pub const fn header(reason: &'static str) -> Self {
        Self::new(ConsensusErrorKind::HeaderInvalid, reason)
    }

    pub const fn header_context(reason: &'static str) -> Self {
        Self::new(ConsensusErrorKind::HeaderContextInvalid, reason)
    }

    pub const fn structure(reason: &'static str) -> Self {
        Self::new(ConsensusErrorKind::BlockStructureInvalid, reason)
    }

    pub const fn block_context(reason: &'static str) -> Self {
        Self::new(ConsensusErrorKind::BlockContextInvalid, reason)
    }

    pub const fn execution(reason: &'static str) -> Self {
        Self::new(ConsensusErrorKind::ExecutionInvalid, reason)
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.reason)
    }
}

impl std::error::Error for ConsensusError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainIndexError {
    Store(StoreError),
    Corrupt(&'static str),
    MissingParent(Hash256),
    InvalidBits,
}

impl fmt::Display for ChainIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainIndexError::Store(err) => write!(f, "{err}"),
            ChainIndexError::Corrupt(message) => write!(f, "corrupt header index: {message}"),
            ChainIndexError::MissingParent(hash) => {
                write!(f, "parent header {} not indexed", hash256_to_hex(hash))
            }
            ChainIndexError::InvalidBits => write!(f, "header has an invalid compact target"),
        }
    }
}

impl std::error::Error for ChainIndexError {}

impl From<StoreError> for ChainIndexError {
    fn from(err: StoreError) -> Self {
        ChainIndexError::Store(err)
    }
}

impl From<DecodeError> for ChainIndexError {
    fn from(_: DecodeError) -> Self {
        ChainIndexError::Corrupt("undecodable header entry")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CoinViewError {
    Store(StoreError),
    Corrupt(&'static str),
    /// The store's committed tip is not the one the commit was conditioned on.
    TipMismatch { expected: Hash256, actual: Hash256 },
}

impl fmt::Display for CoinViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinViewError::Store(err) => write!(f, "{err}"),
            CoinViewError::Corrupt(message) => write!(f, "corrupt coin entry: {message}"),
            CoinViewError::TipMismatch { expected, actual } => write!(
                f,
                "coin view tip mismatch: expected {}, store has {}",
                hash256_to_hex(expected),
                hash256_to_hex(actual)
            ),
        }
    }
}

impl std::error::Error for CoinViewError {}

impl From<StoreError> for CoinViewError {
    fn from(err: StoreError) -> Self {
        CoinViewError::Store(err)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PullError {
    /// The block supply is closed; no further blocks will arrive.
    Disconnected,
    Io(String),
}

impl fmt::Display for PullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullError::Disconnected => write!(f, "block source disconnected"),
            PullError::Io(message) => write!(f, "block source: {message}"),
        }
    }
}

impl std::error::Error for PullError {}

/// Operational failures of one `advance` call. None of these say anything
/// about the validity of the block that was being processed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoopError {
    Pull(PullError),
    Store(CoinViewError),
    Index(ChainIndexError),
    CommitRejected { expected: Hash256, actual: Hash256 },
    /// A commit was rejected earlier and `resync` has not run since.
    Diverged,
    MissingTip(Hash256),
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Pull(err) => write!(f, "{err}"),
            LoopError::Store(err) => write!(f, "{err}"),
            LoopError::Index(err) => write!(f, "{err}"),
            LoopError::CommitRejected { expected, actual } => write!(
                f,
                "commit rejected: loop tip {} but store tip {}",
                hash256_to_hex(expected),
                hash256_to_hex(actual)
            ),
            LoopError::Diverged => write!(f, "loop diverged from store, resync required"),
            LoopError::MissingTip(hash) => {
                write!(f, "store tip {} is not in the chain index", hash256_to_hex(hash))
            }
        }
    }
}

impl std::error::Error for LoopError {}

impl From<PullError> for LoopError {
    fn from(err: PullError) -> Self {
        LoopError::Pull(err)
    }
}

impl From<CoinViewError> for LoopError {
    fn from(err: CoinViewError) -> Self {
        match err {
            CoinViewError::TipMismatch { expected, actual } => {
                LoopError::CommitRejected { expected, actual }
            }
            other => LoopError::Store(other),
        }
    }
}

impl From<ChainIndexError> for LoopError {
    fn from(err: ChainIndexError) -> Self {
        LoopError::Index(err)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectedBlock {
    pub tip: ChainedHeader,
    pub block: Block,
}

/// Outcome of a single `ConsensusLoop::advance`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockResult {
    Connected(Box<ConnectedBlock>),
    Invalid { hash: Hash256, error: ConsensusError },
    Failed(LoopError),
}

impl BlockResult {
    pub fn is_connected(&self) -> bool {
        matches!(self, BlockResult::Connected(_))
    }

    pub fn consensus_error(&self) -> Option<&ConsensusError> {
        match self {
            BlockResult::Invalid { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn loop_error(&self) -> Option<&LoopError> {
        match self {
            BlockResult::Failed(err) => Some(err),
            _ => None,
        }
    }
}
