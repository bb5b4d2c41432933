//! Write-cache
//!
//! Write-behind buffer in front of the blob store. Accepted objects are
//! durably stored in a private [`FsTree`] under the cache directory and
//! moved into main storage by a background flush loop. Rejected writes
//! (read-only cache, oversized object, exhausted capacity) are not errors
//! for the caller, who writes directly to the blob store instead.

mod flush;

pub use flush::{FlushRes, FlushTarget};

use crate::blobstor::{FsTree, IterateRes, SubStorage};
use cairn_common::config::WriteCacheConfig;
use cairn_common::{Address, Error, Object, ObjectHeader, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use tracing::{debug, info};

/// Cached entries and the bytes they occupy
#[derive(Default)]
struct Pending {
    sizes: HashMap<Address, u64>,
    used: u64,
}

impl Pending {
    fn insert(&mut self, addr: Address, size: u64) {
        if let Some(old) = self.sizes.insert(addr, size) {
            self.used = self.used.saturating_sub(old);
        }
        self.used += size;
    }

    fn remove(&mut self, addr: &Address) -> Option<u64> {
        let size = self.sizes.remove(addr)?;
        self.used = self.used.saturating_sub(size);
        Some(size)
    }
}

struct Shared {
    config: WriteCacheConfig,
    tree: FsTree,
    pending: Mutex<Pending>,
    read_only: AtomicBool,
    /// Consecutive storage write failures seen by the flusher
    failures: AtomicU32,
    /// Held for the duration of a flush pass
    flush_lock: Mutex<()>,
}

/// Write-cache statistics
#[derive(Clone, Debug, Default)]
pub struct WriteCacheInfo {
    pub path: PathBuf,
    pub objects: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub read_only: bool,
}

pub struct WriteCache {
    shared: Arc<Shared>,
    stop: Mutex<Option<Sender<()>>>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WriteCache {
    pub fn new(config: WriteCacheConfig) -> Self {
        let tree = FsTree::new(&config.path, 1, 2, true);
        Self {
            shared: Arc::new(Shared {
                config,
                tree,
                pending: Mutex::new(Pending::default()),
                read_only: AtomicBool::new(false),
                failures: AtomicU32::new(0),
                flush_lock: Mutex::new(()),
            }),
            stop: Mutex::new(None),
            flusher: Mutex::new(None),
        }
    }

    pub fn open(&self, read_only: bool) -> Result<()> {
        self.shared.tree.open(read_only)?;
        self.shared.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    /// Recover the set of entries still waiting for a flush
    pub fn init(&self) -> Result<()> {
        self.shared.tree.init()?;
        let mut recovered = Pending::default();
        self.shared.tree.iterate(&mut |item| {
            match item {
                Ok(entry) => recovered.insert(entry.address, entry.data.len() as u64),
                Err(e) => debug!(error = %e, "unreadable write-cache entry left in place"),
            }
            Ok(true)
        })?;
        let (objects, used) = (recovered.sizes.len(), recovered.used);
        *self.shared.pending.lock() = recovered;
        info!(path = %self.shared.config.path.display(), objects, used, "write-cache initialized");
        Ok(())
    }

    /// Stop the flusher; entries stay on disk for the next start
    pub fn close(&self) -> Result<()> {
        self.stop_flusher();
        *self.shared.pending.lock() = Pending::default();
        self.shared.tree.close()
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.shared.tree.set_read_only(read_only)?;
        self.shared.read_only.store(read_only, Ordering::Release);
        if !read_only {
            self.shared.failures.store(0, Ordering::Release);
        }
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    /// Accept an object
    ///
    /// Returns once the object is durably stored in the cache. Fails with
    /// `CacheReadOnly`, `CacheObjectTooBig` or `CacheFull` when the caller
    /// has to write to the blob store directly.
    pub fn put(&self, object: &Object) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::CacheReadOnly);
        }
        let data = object.marshal()?;
        let size = data.len() as u64;
        let max = self.shared.config.max_object_size;
        if size > max {
            return Err(Error::CacheObjectTooBig { size, max });
        }

        let addr = object.address();
        let mut pending = self.shared.pending.lock();
        let replaced = pending.sizes.get(&addr).copied().unwrap_or_default();
        if pending.used - replaced + size > self.shared.config.capacity_bytes {
            return Err(Error::CacheFull);
        }
        self.shared.tree.put(&addr, &data)?;
        pending.insert(addr, size);
        debug!(%addr, size, "object cached");
        Ok(())
    }

    /// Cached object, `NotFound` on a miss
    pub fn get(&self, addr: &Address) -> Result<Object> {
        let data = self.shared.tree.get(addr, &[])?;
        Object::unmarshal(&data)
            .map_err(|e| Error::corruption(format!("cached object {addr}: {e}")))
    }

    pub fn head(&self, addr: &Address) -> Result<ObjectHeader> {
        self.get(addr).map(|o| o.header)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.shared.pending.lock().sizes.contains_key(addr)
    }

    /// Drop a cached object, `NotFound` when it is not cached
    pub fn delete(&self, addr: &Address) -> Result<()> {
        let mut pending = self.shared.pending.lock();
        if !self.shared.tree.delete(addr, &[])? {
            return Err(Error::NotFound(*addr));
        }
        pending.remove(addr);
        Ok(())
    }

    /// Visit every cached object as serialized bytes
    pub fn iterate(
        &self,
        ignore_errors: bool,
        mut f: impl FnMut(Address, Vec<u8>) -> Result<()>,
    ) -> Result<IterateRes> {
        let mut res = IterateRes::default();
        self.shared.tree.iterate(&mut |item| {
            match item {
                Ok(entry) => {
                    res.visited += 1;
                    f(entry.address, entry.data)?;
                }
                Err(e) if ignore_errors => {
                    tracing::warn!(error = %e, "skipping unreadable write-cache entry");
                    res.failed += 1;
                }
                Err(e) => return Err(e),
            }
            Ok(true)
        })?;
        Ok(res)
    }

    pub fn len(&self) -> usize {
        self.shared.pending.lock().sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self) -> WriteCacheInfo {
        let pending = self.shared.pending.lock();
        WriteCacheInfo {
            path: self.shared.config.path.clone(),
            objects: pending.sizes.len(),
            used_bytes: pending.used,
            capacity_bytes: self.shared.config.capacity_bytes,
            read_only: self.is_read_only(),
        }
    }
}

impl Drop for WriteCache {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::{ContainerId, ObjectType, OwnerId};
    use std::path::Path;
    use tempfile::tempdir;

    pub(super) fn config(dir: &Path) -> WriteCacheConfig {
        WriteCacheConfig {
            enabled: true,
            path: dir.join("wc"),
            max_object_size: 4096,
            capacity_bytes: 16 * 1024,
            flush_interval_ms: 10,
            max_backoff_ms: 40,
            error_threshold: 3,
        }
    }

    pub(super) fn open(dir: &Path) -> WriteCache {
        let wc = WriteCache::new(config(dir));
        wc.open(false).unwrap();
        wc.init().unwrap();
        wc
    }

    pub(super) fn object(size: usize) -> Object {
        Object::new(
            ContainerId::random(),
            OwnerId::random(),
            ObjectType::Regular,
            vec![5u8; size],
        )
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let wc = open(dir.path());
        let obj = object(100);

        wc.put(&obj).unwrap();
        assert_eq!(wc.get(&obj.address()).unwrap(), obj);
        assert_eq!(wc.head(&obj.address()).unwrap(), obj.header);
        assert_eq!(wc.len(), 1);

        wc.delete(&obj.address()).unwrap();
        assert!(wc.delete(&obj.address()).unwrap_err().is_not_found());
        assert!(wc.get(&obj.address()).unwrap_err().is_not_found());
        assert_eq!(wc.info().used_bytes, 0);
    }

    #[test]
    fn test_rejections() {
        let dir = tempdir().unwrap();
        let wc = open(dir.path());

        let err = wc.put(&object(8192)).unwrap_err();
        assert!(matches!(err, Error::CacheObjectTooBig { max: 4096, .. }));
        assert!(err.is_cache_rejection());

        let mut accepted = 0;
        let err = loop {
            match wc.put(&object(3000)) {
                Ok(()) => accepted += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::CacheFull));
        assert!(accepted >= 4);

        wc.set_read_only(true).unwrap();
        assert!(matches!(wc.put(&object(10)), Err(Error::CacheReadOnly)));
    }

    #[test]
    fn test_pending_recovered_on_init() {
        let dir = tempdir().unwrap();
        let objs: Vec<_> = (0..3).map(|_| object(50)).collect();
        {
            let wc = open(dir.path());
            for o in &objs {
                wc.put(o).unwrap();
            }
            wc.close().unwrap();
        }

        let wc = open(dir.path());
        assert_eq!(wc.len(), 3);
        for o in &objs {
            assert!(wc.contains(&o.address()));
        }
        let res = wc.iterate(false, |_, data| {
            Object::unmarshal(&data).unwrap();
            Ok(())
        });
        assert_eq!(res.unwrap().visited, 3);
    }
}
