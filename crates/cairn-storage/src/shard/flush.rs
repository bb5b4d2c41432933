//! Write-cache flush target

use super::ShardInner;
use crate::writecache::FlushTarget;
use cairn_common::{Error, Mode, Object, Result};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Flushes cached objects through the shard
///
/// Holds a weak handle so the flush loop never keeps a closed shard alive.
pub(super) struct ShardFlusher {
    shard: Weak<ShardInner>,
}

impl ShardFlusher {
    pub(super) fn new(shard: &Arc<ShardInner>) -> Self {
        Self {
            shard: Arc::downgrade(shard),
        }
    }
}

impl FlushTarget for ShardFlusher {
    fn can_flush(&self) -> bool {
        self.shard
            .upgrade()
            .is_some_and(|shard| shard.mode() == Mode::ReadWrite)
    }

    fn flush(&self, object: &Object) -> Result<()> {
        let shard = self.shard.upgrade().ok_or(Error::ShardDisabled)?;
        let mode = shard.mode.read();
        if *mode != Mode::ReadWrite {
            return Err(Error::ReadOnly);
        }
        shard.store_flushed(object)
    }

    fn on_persistent_failure(&self) {
        let Some(shard) = self.shard.upgrade() else {
            return;
        };
        error!("write-cache failed persistently, switching shard to read-only");
        shard.metrics.inc_errors();
        if let Err(e) = shard.set_mode(Mode::ReadOnly) {
            error!(error = %e, "could not switch shard to read-only");
        }
    }
}

impl ShardInner {
    /// Move a cached object into the blob store and record its location
    ///
    /// Only an existing index entry is updated. Without one the blob copy
    /// is dropped again and `NotFound` keeps the object cached: either the
    /// object was deleted meanwhile or its put has not indexed it yet.
    fn store_flushed(&self, object: &Object) -> Result<()> {
        let addr = object.address();
        let storage_id = self.blobstor.put(object)?;
        match self.metabase.update_storage_id(&addr, storage_id.clone()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(%addr, "flushed object is not indexed, dropping payload");
                if let Err(e) = self.blobstor.delete(&addr, Some(&storage_id)) {
                    warn!(%addr, error = %e, "can't remove object from blob store");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Index every cached object that has no metabase entry
    ///
    /// Called by init and reload under the exclusive shard lock, so no put
    /// or delete interleaves. Entries of removed or expired objects are
    /// dropped.
    pub(super) fn index_cached(&self) {
        let Some(wc) = &self.writecache else {
            return;
        };
        let mut indexed = 0u64;
        let mut stale = Vec::new();
        let res = wc.iterate(true, |addr, data| {
            let object = match Object::unmarshal(&data) {
                Ok(object) => object,
                Err(e) => {
                    warn!(%addr, error = %e, "undecodable write-cache entry");
                    return Ok(());
                }
            };
            match self.metabase.put(&object.header, None) {
                Ok(res) if res.inserted => {
                    self.metrics.add_payload_size(payload_delta(&object));
                    indexed += 1;
                }
                Ok(_) => {}
                Err(Error::AlreadyRemoved(_) | Error::Expired(_)) => stale.push(addr),
                Err(e) => return Err(e),
            }
            Ok(())
        });
        if let Err(e) = res {
            error!(error = %e, "can't index write-cache contents");
        }
        for addr in &stale {
            if let Err(e) = wc.delete(addr) {
                warn!(%addr, error = %e, "can't drop stale write-cache entry");
            }
        }
        if indexed > 0 {
            self.update_metrics();
        }
        if indexed > 0 || !stale.is_empty() {
            info!(indexed, dropped = stale.len(), "write-cache contents indexed");
        }
    }
}

pub(super) fn payload_delta(object: &Object) -> i64 {
    i64::try_from(object.header.payload_size).unwrap_or(i64::MAX)
}
