//! Network epoch state
//!
//! Epochs are advanced by the network map outside of the storage engine.
//! Components that need the current epoch take an [`EpochState`] handle
//! instead of reading process-wide state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Discrete network time unit
pub type Epoch = u64;

/// Source of the current network epoch
pub trait EpochState: Send + Sync {
    /// Snapshot of the current epoch
    fn current_epoch(&self) -> Epoch;
}

/// Atomic epoch holder updated by the caller on every new-epoch event
#[derive(Debug, Default)]
pub struct EpochCounter(AtomicU64);

impl EpochCounter {
    /// Create a counter starting at `epoch`
    #[must_use]
    pub const fn new(epoch: Epoch) -> Self {
        Self(AtomicU64::new(epoch))
    }

    /// Set the current epoch
    pub fn set(&self, epoch: Epoch) {
        self.0.store(epoch, Ordering::SeqCst);
    }
}

impl EpochState for EpochCounter {
    fn current_epoch(&self) -> Epoch {
        self.0.load(Ordering::SeqCst)
    }
}
