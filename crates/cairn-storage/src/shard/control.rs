//! Shard lifecycle: open, init, close and reload

use super::{Shard, ShardFlusher, ShardInner};
use crate::metabase::InhumePrm;
use cairn_common::{Address, Error, Lock, Mode, Object, ObjectType, Result, ShardConfig, Tombstone};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Modes tried in order after a metabase failure
///
/// A store written by another layout version is never served.
fn fallback_chain(cause: &Error) -> &'static [Mode] {
    match cause {
        Error::OutdatedVersion { .. } => &[],
        _ => &[Mode::ReadOnly, Mode::DegradedReadOnly],
    }
}

impl Shard {
    /// Open every component
    ///
    /// A metabase that fails to open does not stop the remaining
    /// components from opening; the shard then falls back to a read-only
    /// mode.
    pub fn open(&self) -> Result<()> {
        let inner = &self.inner;
        let mut mode = inner.mode.write();
        let target = inner.config.read().mode;
        if target == Mode::Disabled {
            return Err(Error::Configuration(
                "shard cannot be opened in disabled mode".into(),
            ));
        }

        let read_only = target.read_only();
        inner.blobstor.open(read_only)?;
        let opened = if target.no_metabase() {
            Ok(())
        } else {
            inner.metabase.open(read_only)
        };
        if let Some(wc) = &inner.writecache {
            wc.open(read_only)?;
        }

        match opened {
            Ok(()) => {
                inner.apply_mode(target)?;
                *mode = target;
            }
            Err(e) => *mode = inner.degrade("open", e)?,
        }
        info!(mode = %*mode, "shard opened");
        Ok(())
    }

    /// Initialize components in dependency order and start background work
    ///
    /// With `refill_metabase` set, the metabase is rebuilt from blob store
    /// contents instead of being initialized.
    pub fn init(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut mode = inner.mode.write();
            if *mode == Mode::Disabled {
                return Err(Error::ShardDisabled);
            }
            inner.blobstor.init()?;
            if !mode.no_metabase() {
                let refill = inner.config.read().refill_metabase && !mode.read_only();
                let initialized = if refill {
                    inner.refill_metabase()
                } else {
                    inner.metabase.init()
                };
                if let Err(e) = initialized {
                    *mode = inner.degrade("init", e)?;
                }
            }
            if let Some(wc) = &inner.writecache {
                wc.init()?;
            }
            if *mode == Mode::ReadWrite {
                inner.index_cached();
            }
            inner.update_metrics();
            info!(mode = %*mode, "shard initialized");
        }

        if let Some(wc) = &inner.writecache {
            wc.start_flusher(Arc::new(ShardFlusher::new(inner)));
        }
        self.gc.start(Arc::downgrade(inner));
        Ok(())
    }

    /// Release components in reverse dependency order, then stop the GC
    ///
    /// Safe to call on a shard that was never opened or already closed.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if let Some(wc) = &inner.writecache {
            wc.stop_flusher();
        }

        let mut first_err = None;
        {
            let mut mode = inner.mode.write();
            if *mode != Mode::Disabled {
                let mut results = Vec::with_capacity(3);
                if let Some(wc) = &inner.writecache {
                    results.push(("write-cache", wc.close()));
                }
                results.push(("blob store", inner.blobstor.close()));
                results.push(("metabase", inner.metabase.close()));
                for (component, res) in results {
                    if let Err(e) = res {
                        error!(component, error = %e, "could not close shard component");
                        first_err.get_or_insert(e);
                    }
                }
                *mode = Mode::Disabled;
                inner.metrics.set_mode(Mode::Disabled);
                info!("shard closed");
            }
        }

        self.gc.stop();
        first_err.map_or(Ok(()), Err)
    }

    /// Apply a new metabase configuration and return to `ReadWrite`
    ///
    /// A newly opened metabase instance is refilled or initialized
    /// depending on `refill_metabase`. Any metabase failure leaves the
    /// shard in `DegradedReadOnly`.
    pub fn reload(&self, config: ShardConfig) -> Result<()> {
        let inner = &self.inner;
        let mut mode = inner.mode.write();
        if *mode == Mode::Disabled {
            return Err(Error::ShardDisabled);
        }
        let refill = config.refill_metabase;
        {
            let mut current = inner.config.write();
            current.metabase = config.metabase.clone();
            current.refill_metabase = refill;
        }

        let reopened = match inner.metabase.reload(config.metabase) {
            Ok(reopened) => reopened,
            Err(e) => {
                error!(error = %e, "can't open metabase, move to a degraded mode");
                *mode = inner.force_degraded();
                return Err(e);
            }
        };
        if reopened {
            let initialized = if refill {
                inner.refill_metabase()
            } else {
                inner.metabase.init()
            };
            if let Err(e) = initialized {
                error!(error = %e, "can't initialize metabase, move to a degraded-read-only mode");
                *mode = inner.force_degraded();
                return Err(e);
            }
        }

        info!("trying to restore read-write mode");
        inner.apply_mode(Mode::ReadWrite)?;
        *mode = Mode::ReadWrite;
        if reopened {
            inner.index_cached();
        }
        inner.update_metrics();
        Ok(())
    }
}

impl ShardInner {
    /// Walk the fallback chain for a metabase failure at `stage`
    ///
    /// Returns the mode that was entered; the caller holds the shard lock.
    fn degrade(&self, stage: &str, cause: Error) -> Result<Mode> {
        for &target in fallback_chain(&cause) {
            error!(stage, mode = %target, error = %cause, "metabase failure, switching mode");
            match self.apply_mode(target) {
                Ok(()) => return Ok(target),
                Err(e) => warn!(stage, mode = %target, error = %e, "can't switch shard mode"),
            }
        }
        Err(cause)
    }

    fn force_degraded(&self) -> Mode {
        if let Err(e) = self.apply_mode(Mode::DegradedReadOnly) {
            error!(error = %e, "could not switch to degraded mode");
        }
        Mode::DegradedReadOnly
    }

    /// Rebuild the metabase from blob store contents
    ///
    /// Objects are indexed in a first pass; tombstone and lock relations
    /// are replayed in a second one so that they find their members.
    fn refill_metabase(&self) -> Result<()> {
        self.metabase.reset()?;

        let indexed = self.blobstor.iterate(true, |entry| {
            let object = match Object::unmarshal(&entry.data) {
                Ok(object) => object,
                Err(e) => {
                    warn!(addr = %entry.address, error = %e, "could not unmarshal object");
                    return Ok(());
                }
            };
            match self.metabase.put(&object.header, Some(entry.storage_id)) {
                Ok(_) | Err(Error::AlreadyRemoved(_) | Error::Expired(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })?;

        let mut relations = 0u64;
        self.blobstor.iterate(true, |entry| {
            let Ok(object) = Object::unmarshal(&entry.data) else {
                return Ok(());
            };
            let addr = object.address();
            match object.header.object_type {
                ObjectType::Tombstone => {
                    let tombstone = Tombstone::decode(&object.payload)?;
                    let members = tombstone
                        .members
                        .iter()
                        .map(|id| Address::new(addr.container, *id))
                        .collect();
                    self.metabase.inhume(&InhumePrm::tombstone(
                        addr,
                        tombstone.expiration,
                        members,
                    ))?;
                    relations += 1;
                }
                ObjectType::Lock => {
                    let lock = Lock::decode(&object.payload)?;
                    self.metabase.lock(addr.container, addr.object, &lock.members)?;
                    relations += 1;
                }
                _ => {}
            }
            Ok(())
        })?;

        let counters = self.metabase.sync_counters(true)?;
        info!(
            visited = indexed.visited,
            failed = indexed.failed,
            relations,
            phy = counters.phy,
            logic = counters.logic,
            "metabase refilled"
        );
        Ok(())
    }
}
