use super::{Shard, ShardInner};
use bytes::Bytes;
use cairn_common::{Address, Error, Mode, Object, ObjectHeader, Result};
use tracing::{debug, warn};

impl Shard {
    /// Read an object
    ///
    /// The metabase decides existence: removed objects are `NotFound` and
    /// expired ones `Expired` even when their bytes are still on disk.
    /// Without a metabase the write-cache and every sub-storage are searched.
    pub fn get(&self, addr: &Address) -> Result<Object> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        match *mode {
            Mode::Disabled => Err(Error::ShardDisabled),
            m if m.no_metabase() => inner.fetch(addr, None),
            _ => {
                let rec = inner.metabase.get(addr).map_err(|e| inner.report(e))?;
                inner.fetch(addr, rec.storage_id.as_deref())
            }
        }
    }

    /// Read an object header
    pub fn head(&self, addr: &Address) -> Result<ObjectHeader> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        match *mode {
            Mode::Disabled => Err(Error::ShardDisabled),
            m if m.no_metabase() => inner.fetch(addr, None).map(|o| o.header),
            _ => inner
                .metabase
                .get(addr)
                .map(|rec| rec.header)
                .map_err(|e| inner.report(e)),
        }
    }

    /// Read `len` payload bytes starting at `offset`
    pub fn get_range(&self, addr: &Address, offset: u64, len: u64) -> Result<Bytes> {
        let object = self.get(addr)?;
        let size = object.payload.len() as u64;
        let end = offset.checked_add(len).filter(|&end| end <= size).ok_or_else(|| {
            Error::validation(format!(
                "range {offset}+{len} out of bounds for {addr} of {size} bytes"
            ))
        })?;
        // both bounds fit the payload length
        Ok(object.payload.slice(offset as usize..end as usize))
    }

    /// Whether an object is available
    ///
    /// Follows [`Metabase::exists`](crate::metabase::Metabase::exists);
    /// without a metabase backends are searched directly.
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        match *mode {
            Mode::Disabled => Err(Error::ShardDisabled),
            m if m.no_metabase() => {
                if inner.writecache.as_ref().is_some_and(|wc| wc.contains(addr)) {
                    return Ok(true);
                }
                inner.blobstor.exists(addr, None)
            }
            _ => inner.metabase.exists(addr).map_err(|e| inner.report(e)),
        }
    }
}

impl ShardInner {
    /// Payload lookup: write-cache first, then the blob store
    fn fetch(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<Object> {
        if let Some(wc) = &self.writecache {
            match wc.get(addr) {
                Ok(object) => return Ok(object),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(%addr, error = %e, "can't read object from the write-cache"),
            }
        }
        self.blobstor.get(addr, storage_id).map_err(|e| {
            if e.is_not_found() {
                debug!(%addr, "indexed object has no payload");
            }
            self.report(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::metabase::InhumePrm;
    use cairn_common::ContainerId;
    use tempfile::tempdir;

    #[test]
    fn test_get_head_range() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), true);
        let obj = object(ContainerId::random());
        shard.put(&obj).unwrap();

        assert_eq!(shard.get(&obj.address()).unwrap(), obj);
        assert_eq!(shard.head(&obj.address()).unwrap(), obj.header);
        assert_eq!(&shard.get_range(&obj.address(), 2, 3).unwrap()[..], b"234");
        assert_eq!(shard.get_range(&obj.address(), 10, 0).unwrap().len(), 0);
        assert!(matches!(
            shard.get_range(&obj.address(), 8, 5),
            Err(Error::Validation(_))
        ));
        assert!(shard.exists(&obj.address()).unwrap());
    }

    #[test]
    fn test_index_is_authoritative() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), false);
        let stray = object(ContainerId::random());
        shard.inner.blobstor.put(&stray).unwrap();

        assert!(shard.get(&stray.address()).unwrap_err().is_not_found());
        assert!(shard.head(&stray.address()).unwrap_err().is_not_found());
        assert!(!shard.exists(&stray.address()).unwrap());
    }

    #[test]
    fn test_inhumed_object_hidden_before_gc() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), false);
        let cid = ContainerId::random();
        let obj = object(cid);
        shard.put(&obj).unwrap();

        shard
            .inhume(&InhumePrm::tombstone(object(cid).address(), 20, vec![obj.address()]))
            .unwrap();
        assert!(shard.get(&obj.address()).unwrap_err().is_not_found());
        assert!(shard.head(&obj.address()).unwrap_err().is_not_found());
        assert!(matches!(
            shard.exists(&obj.address()),
            Err(Error::AlreadyRemoved(_))
        ));
    }

    #[test]
    fn test_expired_object() {
        let dir = tempdir().unwrap();
        let (shard, epoch) = open(dir.path(), false);
        let obj = object(ContainerId::random()).with_expiration(11);
        shard.put(&obj).unwrap();
        epoch.set(12);
        assert!(matches!(shard.get(&obj.address()), Err(Error::Expired(_))));
    }

    #[test]
    fn test_degraded_reads_search_backends() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), true);
        config.writecache.flush_interval_ms = 3_600_000;
        let (shard, _) = start(config);
        let cached = object(ContainerId::random());
        shard.put(&cached).unwrap();
        // never indexed
        let stored = object(ContainerId::random());
        shard.inner.blobstor.put(&stored).unwrap();

        shard.set_mode(Mode::DegradedReadOnly).unwrap();
        assert_eq!(shard.get(&stored.address()).unwrap(), stored);
        assert_eq!(shard.head(&stored.address()).unwrap(), stored.header);
        assert!(shard.exists(&stored.address()).unwrap());
        assert_eq!(shard.get(&cached.address()).unwrap(), cached);
        assert!(shard.exists(&cached.address()).unwrap());
        assert!(!shard.exists(&object(ContainerId::random()).address()).unwrap());
    }
}
