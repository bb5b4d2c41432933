//! Shard metrics sink

use crate::metabase::ObjectCounters;
use cairn_common::Mode;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Receiver of shard state changes
///
/// Every method has an empty default so sinks implement only what they
/// export.
pub trait MetricsWriter: Send + Sync {
    fn set_object_counters(&self, _counters: ObjectCounters) {}

    /// Adjust the total payload size of stored objects
    fn add_payload_size(&self, _delta: i64) {}

    fn set_mode(&self, _mode: Mode) {}

    fn inc_errors(&self) {}
}

/// Sink that drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsWriter for NoopMetrics {}

/// In-memory sink backed by atomics
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    phy: AtomicU64,
    logic: AtomicU64,
    payload_size: AtomicI64,
    errors: AtomicU64,
    mode: RwLock<Mode>,
}

/// Point-in-time copy of [`AtomicMetrics`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub counters: ObjectCounters,
    pub payload_size: i64,
    pub errors: u64,
    pub mode: Mode,
}

impl AtomicMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: ObjectCounters {
                phy: self.phy.load(Ordering::Relaxed),
                logic: self.logic.load(Ordering::Relaxed),
            },
            payload_size: self.payload_size.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            mode: *self.mode.read(),
        }
    }
}

impl MetricsWriter for AtomicMetrics {
    fn set_object_counters(&self, counters: ObjectCounters) {
        self.phy.store(counters.phy, Ordering::Relaxed);
        self.logic.store(counters.logic, Ordering::Relaxed);
    }

    fn add_payload_size(&self, delta: i64) {
        self.payload_size.fetch_add(delta, Ordering::Relaxed);
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.write() = mode;
    }

    fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}
