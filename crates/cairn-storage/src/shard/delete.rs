use super::{Shard, ShardInner, writable};
use crate::metabase::DeleteRes;
use cairn_common::{Address, Result};
use tracing::{debug, warn};

impl Shard {
    /// Physically remove objects
    ///
    /// The metabase removal is authoritative; write-cache and blob store
    /// cleanup is best effort.
    pub fn delete(&self, addrs: &[Address]) -> Result<DeleteRes> {
        let mode = self.inner.mode.read();
        writable(*mode)?;
        self.inner.delete_objects(addrs, false)
    }
}

impl ShardInner {
    /// Shared by client deletes and the garbage collector
    ///
    /// With `skip_locked` protected objects stay untouched everywhere, so
    /// the cache entries are only dropped for what the metabase removed.
    pub(super) fn delete_objects(&self, addrs: &[Address], skip_locked: bool) -> Result<DeleteRes> {
        if !skip_locked {
            for addr in addrs {
                self.drop_cached(addr);
            }
        }

        let res = self
            .metabase
            .delete(addrs, skip_locked)
            .map_err(|e| self.report(e))?;

        for (addr, storage_id) in &res.removed {
            if skip_locked {
                self.drop_cached(addr);
            }
            if let Err(e) = self.blobstor.delete(addr, storage_id.as_deref()) {
                debug!(%addr, error = %e, "can't remove object from blob store");
            }
        }

        let removed_payload: u64 = res.sizes.iter().sum();
        if removed_payload > 0 {
            self.metrics
                .add_payload_size(-i64::try_from(removed_payload).unwrap_or(i64::MAX));
        }
        if res.raw_removed > 0 {
            self.update_metrics();
        }
        Ok(res)
    }

    fn drop_cached(&self, addr: &Address) {
        let Some(wc) = &self.writecache else {
            return;
        };
        if let Err(e) = wc.delete(addr)
            && !e.is_not_found()
        {
            warn!(%addr, error = %e, "can't delete object from write cache");
        }
    }
}
