//! Index-only operations: inhume, lock and select

use super::{Shard, index_available, writable};
use crate::metabase::{InhumePrm, InhumeRes, SelectFilter};
use cairn_common::{Address, ContainerId, ObjectId, Result};

impl Shard {
    /// Logically remove objects
    ///
    /// Payloads stay in place until the garbage collector removes them.
    pub fn inhume(&self, prm: &InhumePrm) -> Result<InhumeRes> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        writable(*mode)?;
        let res = inner.metabase.inhume(prm).map_err(|e| inner.report(e))?;
        if res.available_removed > 0 {
            inner.update_metrics();
        }
        Ok(res)
    }

    /// Protect `members` of `cid` with the lock object `locker`
    pub fn lock(&self, cid: ContainerId, locker: ObjectId, members: &[ObjectId]) -> Result<()> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        writable(*mode)?;
        inner
            .metabase
            .lock(cid, locker, members)
            .map_err(|e| inner.report(e))
    }

    pub fn is_locked(&self, addr: &Address) -> Result<bool> {
        let mode = self.inner.mode.read();
        index_available(*mode)?;
        self.inner.metabase.is_locked(addr)
    }

    /// Available objects of `cid` matching every filter
    pub fn select(&self, cid: ContainerId, filters: &[SelectFilter]) -> Result<Vec<Address>> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        index_available(*mode)?;
        inner
            .metabase
            .select(cid, filters)
            .map_err(|e| inner.report(e))
    }
}
