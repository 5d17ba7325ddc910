//! Block validation against the chain index and the coin set.

pub mod coins;
pub mod coinview;
pub mod consensus_loop;
pub mod error;
pub mod flags;
pub mod index;
pub mod metrics;
pub mod prefetch;
pub mod puller;
pub mod validator;
pub mod versionbits;
pub mod working;

pub use coins::{Coins, FetchedCoins, UtxoDelta};
pub use coinview::{
    CachedCoinView, CoinCacheStats, CoinView, DbCoinView, WarmCache, DEFAULT_COIN_CACHE_ENTRIES,
};
pub use consensus_loop::{fetch_ids, ConsensusLoop, LoopOptions};
pub use error::{
    BlockResult, ChainIndexError, CoinViewError, ConnectedBlock, ConsensusError,
    ConsensusErrorKind, LoopError, PullError,
};
pub use flags::ConsensusFlags;
pub use index::{ChainIndex, ChainedHeader};
pub use metrics::{ConsensusPerformanceCounter, ConsensusPerformanceSnapshot, Stage};
pub use puller::{BlockPuller, ChannelPuller, LookaheadPuller};
pub use validator::{ConsensusValidator, ContextInformation, Validator};
pub use versionbits::ActivationStateCache;
pub use working::WorkingUtxoSet;
