//! Shard
//!
//! Coordinator owning one metabase, one blob store and an optional
//! write-cache. The mode field doubles as the shard lock: data operations
//! hold it shared for their duration, mode transitions and `reload` hold
//! it exclusively.
//!
//! Mode transitions:
//! - `ReadWrite -> ReadOnly` on request or on persistent write-cache failure
//! - `ReadWrite/ReadOnly -> DegradedReadOnly` when the metabase fails during
//!   open or init and `ReadOnly` cannot be entered either
//! - `ReadOnly/DegradedReadOnly -> ReadWrite` through `reload`
//! - any mode `-> Disabled` through `close` only

mod control;
mod delete;
mod dump;
mod flush;
mod gc;
mod get;
mod inhume;
mod metrics;
mod put;
mod restore;

pub use dump::{DUMP_MAGIC, DumpRes};
pub use metrics::{AtomicMetrics, MetricsSnapshot, MetricsWriter, NoopMetrics};
pub use restore::RestoreRes;

use crate::blobstor::{BlobStor, SubStorageInfo};
use crate::metabase::{Metabase, MetabaseInfo, ObjectCounters};
use crate::writecache::{WriteCache, WriteCacheInfo};
use cairn_common::{EpochState, Error, Mode, Result, ShardConfig};
use flush::ShardFlusher;
use gc::Gc;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

/// Shard state for administrative reporting
#[derive(Clone, Debug)]
pub struct ShardInfo {
    pub mode: Mode,
    pub metabase: Option<MetabaseInfo>,
    pub blobstor: Vec<SubStorageInfo>,
    pub writecache: Option<WriteCacheInfo>,
    pub counters: Option<ObjectCounters>,
}

pub struct Shard {
    inner: Arc<ShardInner>,
    gc: Gc,
}

struct ShardInner {
    mode: RwLock<Mode>,
    config: RwLock<ShardConfig>,
    metabase: Metabase,
    blobstor: BlobStor,
    writecache: Option<WriteCache>,
    metrics: Arc<dyn MetricsWriter>,
}

impl Shard {
    pub fn new(config: ShardConfig, epoch: Arc<dyn EpochState>) -> Result<Self> {
        Self::with_metrics(config, epoch, Arc::new(NoopMetrics))
    }

    /// Build a shard reporting to `metrics`
    ///
    /// Nothing is touched on disk until [`Shard::open`].
    pub fn with_metrics(
        config: ShardConfig,
        epoch: Arc<dyn EpochState>,
        metrics: Arc<dyn MetricsWriter>,
    ) -> Result<Self> {
        let blobstor = BlobStor::new(&config.blobstor)?;
        let metabase = Metabase::new(config.metabase.clone(), epoch);
        let writecache = config
            .writecache
            .enabled
            .then(|| WriteCache::new(config.writecache.clone()));
        let gc = Gc::new(config.gc.clone());
        Ok(Self {
            inner: Arc::new(ShardInner {
                mode: RwLock::new(Mode::Disabled),
                config: RwLock::new(config),
                metabase,
                blobstor,
                writecache,
                metrics,
            }),
            gc,
        })
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode()
    }

    /// Request a mode change
    ///
    /// Leaving `ReadWrite` flushes the write-cache first. `Disabled` is
    /// only entered by `close`; `DegradedReadOnly` is only left by `reload`.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.inner.set_mode(mode)
    }

    pub fn object_counters(&self) -> Result<ObjectCounters> {
        let mode = self.inner.mode.read();
        index_available(*mode)?;
        self.inner.metabase.object_counters()
    }

    pub fn info(&self) -> ShardInfo {
        let mode = self.inner.mode.read();
        let with_index = !mode.no_metabase();
        ShardInfo {
            mode: *mode,
            metabase: with_index.then(|| self.inner.metabase.info().ok()).flatten(),
            blobstor: self.inner.blobstor.info(),
            writecache: self.inner.writecache.as_ref().map(WriteCache::info),
            counters: with_index
                .then(|| self.inner.metabase.object_counters().ok())
                .flatten(),
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to close shard on drop");
        }
    }
}

impl ShardInner {
    fn mode(&self) -> Mode {
        *self.mode.read()
    }

    fn set_mode(self: &Arc<Self>, target: Mode) -> Result<()> {
        let current = self.mode();
        if current == target {
            return Ok(());
        }
        if !current.can_transition_to(target) {
            return Err(Error::InvalidModeTransition {
                from: current,
                to: target,
            });
        }
        if current == Mode::ReadWrite {
            self.flush_writecache();
        }

        let mut mode = self.mode.write();
        let from = *mode;
        if from == target {
            return Ok(());
        }
        if !from.can_transition_to(target) {
            return Err(Error::InvalidModeTransition { from, to: target });
        }
        self.apply_mode(target)?;
        *mode = target;
        info!(%from, to = %target, "shard mode changed");
        Ok(())
    }

    /// Switch every component to `target`
    fn apply_mode(&self, target: Mode) -> Result<()> {
        self.metabase.set_mode(target)?;
        let read_only = target.read_only();
        self.blobstor.set_read_only(read_only)?;
        if let Some(wc) = &self.writecache {
            wc.set_read_only(read_only)?;
        }
        self.metrics.set_mode(target);
        Ok(())
    }

    /// Drain the write-cache before the shard stops accepting writes
    fn flush_writecache(self: &Arc<Self>) {
        let Some(wc) = &self.writecache else {
            return;
        };
        match wc.flush(&ShardFlusher::new(self), true) {
            Ok(res) if res.failed > 0 => {
                error!(failed = res.failed, "write-cache entries left unflushed");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "write-cache flush failed"),
        }
    }

    /// Count an unexpected failure and pass it on
    fn report(&self, e: Error) -> Error {
        if e.is_corruption() {
            error!(error = %e, "storage corruption detected");
            self.metrics.inc_errors();
        }
        e
    }

    fn update_metrics(&self) {
        if let Ok(counters) = self.metabase.object_counters() {
            self.metrics.set_object_counters(counters);
        }
    }
}

/// Mutations are accepted in `ReadWrite` only
fn writable(mode: Mode) -> Result<()> {
    match mode {
        Mode::ReadWrite => Ok(()),
        Mode::ReadOnly | Mode::DegradedReadOnly => Err(Error::ReadOnly),
        Mode::Disabled => Err(Error::ShardDisabled),
    }
}

/// Index lookups need an open metabase
fn index_available(mode: Mode) -> Result<()> {
    match mode {
        Mode::Disabled => Err(Error::ShardDisabled),
        m if m.no_metabase() => Err(Error::Degraded),
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use cairn_common::{ContainerId, EpochCounter, Object, ObjectType, OwnerId};
    use std::path::Path;

    pub fn config(dir: &Path, writecache: bool) -> ShardConfig {
        let mut config = ShardConfig::with_root(dir);
        config.metabase.sync_on_write = false;
        config.metabase.background_compaction = false;
        config.writecache.enabled = writecache;
        config.writecache.flush_interval_ms = 10;
        config.writecache.max_backoff_ms = 40;
        config.gc.remover_interval_ms = 3_600_000;
        config
    }

    pub fn start(config: ShardConfig) -> (Shard, Arc<EpochCounter>) {
        let epoch = Arc::new(EpochCounter::new(10));
        let shard = Shard::new(config, epoch.clone()).unwrap();
        shard.open().unwrap();
        shard.init().unwrap();
        (shard, epoch)
    }

    pub fn open(dir: &Path, writecache: bool) -> (Shard, Arc<EpochCounter>) {
        start(config(dir, writecache))
    }

    pub fn object(cid: ContainerId) -> Object {
        Object::new(cid, OwnerId::random(), ObjectType::Regular, b"0123456789".to_vec())
    }
}
