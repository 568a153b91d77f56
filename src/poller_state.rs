use std::fmt::Display;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};
use std::time::SystemTime;

use crate::{BlockHeader, TransactionWindow};

/// Latest block header and transaction window seen by the poller.
///
/// Readers get cheap [`Arc`] snapshots. Writes go through [`ChainState::apply_block`] and
/// [`ChainState::apply_window`], which drop responses that are older than what's already
/// applied: every request draws a sequence number when its tick fires, and a slow response
/// that arrives after a newer one is discarded instead of overwriting it.
#[derive(Debug, Default)]
pub struct ChainState {
    block: RwLock<Slot<BlockHeader>>,
    window: RwLock<Slot<TransactionWindow>>,
    block_sequence: AtomicU64,
    window_sequence: AtomicU64,
    failures: AtomicU64,
    last_failure: RwLock<Option<PollFailure>>,
}

#[derive(Debug)]
struct Slot<T> {
    sequence: u64,
    value: Option<Arc<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            sequence: 0,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget {
    Block,
    Transactions,
}

impl Display for PollTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollTarget::Block => write!(f, "block"),
            PollTarget::Transactions => write!(f, "transactions"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollFailure {
    pub target: PollTarget,
    pub message: String,
    pub at: SystemTime,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_block(&self) -> Option<Arc<BlockHeader>> {
        self.block
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .value
            .clone()
    }

    pub fn current_window(&self) -> Option<Arc<TransactionWindow>> {
        self.window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .value
            .clone()
    }

    /// Height of the current block, if one with a positive height is known.
    pub fn current_height(&self) -> Option<crate::BlockHeight> {
        self.current_block()
            .map(|block| block.number)
            .filter(|height| *height > 0)
    }

    pub(crate) fn next_block_sequence(&self) -> u64 {
        self.block_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_window_sequence(&self) -> u64 {
        self.window_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Replaces the current block unless a newer request was already applied or the block
    /// isn't ahead of the current one on the same chain. A block of a different chain id
    /// always replaces the current one. Returns the block if it became current.
    pub(crate) fn apply_block(&self, sequence: u64, block: BlockHeader) -> Option<Arc<BlockHeader>> {
        let mut slot = self.block.write().unwrap_or_else(PoisonError::into_inner);
        if sequence <= slot.sequence {
            log::debug!(target: "gnopoller::state", "Discarding stale block {} (request {sequence}, applied {})",
                block.number, slot.sequence);
            return None;
        }
        if let Some(current) = slot.value.as_ref().filter(|current| current.id == block.id) {
            if block.number < current.number {
                log::debug!(target: "gnopoller::state", "Discarding block {} which is behind current block {}",
                    block.number, current.number);
                return None;
            }
            if block.number == current.number {
                slot.sequence = sequence;
                return None;
            }
        }
        if let Some(current) = slot.value.as_ref().filter(|current| current.id != block.id) {
            log::info!(target: "gnopoller::state", "Chain changed from {} (block {}) to {} (block {})",
                current.id, current.number, block.id, block.number);
        }
        let block = Arc::new(block);
        slot.sequence = sequence;
        slot.value = Some(Arc::clone(&block));
        Some(block)
    }

    /// Replaces the current window unless a newer request was already applied.
    pub(crate) fn apply_window(
        &self,
        sequence: u64,
        window: TransactionWindow,
    ) -> Option<Arc<TransactionWindow>> {
        let mut slot = self.window.write().unwrap_or_else(PoisonError::into_inner);
        if sequence <= slot.sequence {
            log::debug!(target: "gnopoller::state", "Discarding stale window {}..={} (request {sequence}, applied {})",
                window.from_height, window.to_height, slot.sequence);
            return None;
        }
        let window = Arc::new(window);
        slot.sequence = sequence;
        slot.value = Some(Arc::clone(&window));
        Some(window)
    }

    pub(crate) fn record_failure(&self, target: PollTarget, error: &impl Display) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self
            .last_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(PollFailure {
            target,
            message: error.to_string(),
            at: SystemTime::now(),
        });
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<PollFailure> {
        self.last_failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
pub enum PollerError {
    Join(tokio::task::JoinError),
    Observer(String),
}

impl Display for PollerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollerError::Join(e) => write!(f, "Join error: {e:?}"),
            PollerError::Observer(e) => write!(f, "Observer error: {e}"),
        }
    }
}

impl std::error::Error for PollerError {}
