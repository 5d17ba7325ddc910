//! Block sources the consensus loop pulls from.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use ledgerd_consensus::Hash256;
use ledgerd_primitives::block::Block;

use crate::error::PullError;
use crate::index::ChainedHeader;

pub trait BlockPuller: Send {
    /// Positions the source so the next block returned extends `location`.
    fn set_location(&mut self, location: &ChainedHeader);

    /// Blocks until the next block in chain order is available.
    fn next_block(&mut self) -> Result<Block, PullError>;

    /// Present when the source can peek ahead without blocking.
    fn lookahead(&mut self) -> Option<&mut dyn LookaheadPuller> {
        None
    }
}

pub trait LookaheadPuller {
    /// Block `offset` places after the one `next_block` will return next.
    /// Never blocks.
    fn try_get_lookahead(&mut self, offset: usize) -> Option<Arc<Block>>;
}

/// Source fed by a channel, typically from an import or network thread.
pub struct ChannelPuller {
    receiver: Receiver<Block>,
    buffered: VecDeque<Arc<Block>>,
    seek: Option<Hash256>,
    skipped: u64,
}

impl ChannelPuller {
    pub fn new(receiver: Receiver<Block>) -> Self {
        Self {
            receiver,
            buffered: VecDeque::new(),
            seek: None,
            skipped: 0,
        }
    }

    pub fn bounded(capacity: usize) -> (Sender<Block>, Self) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (sender, Self::new(receiver))
    }

    pub fn unbounded() -> (Sender<Block>, Self) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (sender, Self::new(receiver))
    }

    /// Blocks discarded while seeking to a location.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn pop(&mut self) -> Result<Arc<Block>, PullError> {
        if let Some(block) = self.buffered.pop_front() {
            return Ok(block);
        }
        self.receiver
            .recv()
            .map(Arc::new)
            .map_err(|_| PullError::Disconnected)
    }
}

impl BlockPuller for ChannelPuller {
    fn set_location(&mut self, location: &ChainedHeader) {
        self.seek = Some(location.hash);
    }

    fn next_block(&mut self) -> Result<Block, PullError> {
        loop {
            let block = self.pop()?;
            if let Some(location) = self.seek {
                if block.header.prev_block != location {
                    self.skipped += 1;
                    continue;
                }
                self.seek = None;
            }
            return Ok(Arc::try_unwrap(block).unwrap_or_else(|shared| (*shared).clone()));
        }
    }

    fn lookahead(&mut self) -> Option<&mut dyn LookaheadPuller> {
        Some(self)
    }
}

impl LookaheadPuller for ChannelPuller {
    fn try_get_lookahead(&mut self, offset: usize) -> Option<Arc<Block>> {
        if self.seek.is_some() {
            return None;
        }
        while self.buffered.len() <= offset {
            match self.receiver.try_recv() {
                Ok(block) => self.buffered.push_back(Arc::new(block)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
        self.buffered.get(offset).cloned()
    }
}
