//! Blob store
//!
//! Raw object bytes across an ordered list of sub-storages. Placement is a
//! pure function of the object header and serialized size: the first
//! sub-storage whose policy admits the object wins, the last one is the
//! catch-all. Stored blobs carry a leading encoding byte, see
//! [`Compressor`].
//!
//! Storage ID format: one byte with the sub-storage index followed by the
//! sub-storage's own location bytes. The blob store never tracks liveness;
//! the metabase owns storage IDs.

mod compression;
mod fstree;
mod packtree;

pub use compression::{Compressor, ENCODING_PLAIN, ENCODING_ZSTD, is_compressed};
pub use fstree::FsTree;
pub use packtree::PackTree;

use cairn_common::config::{BlobStorConfig, SubStorageKind};
use cairn_common::{Address, Error, Object, ObjectHeader, ObjectType, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Entry produced by sub-storage iteration, still encoded
#[derive(Clone, Debug)]
pub struct RawEntry {
    pub address: Address,
    pub data: Vec<u8>,
    /// Sub-storage specific location
    pub location: Vec<u8>,
}

/// Backend holding object bytes
pub trait SubStorage: Send + Sync {
    fn kind(&self) -> SubStorageKind;
    fn path(&self) -> &Path;
    fn open(&self, read_only: bool) -> Result<()>;
    fn init(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn set_read_only(&self, read_only: bool) -> Result<()>;
    /// Store `data`, returning its location
    fn put(&self, addr: &Address, data: &[u8]) -> Result<Vec<u8>>;
    /// `NotFound` when absent; an empty `location` means unknown
    fn get(&self, addr: &Address, location: &[u8]) -> Result<Vec<u8>>;
    fn exists(&self, addr: &Address, location: &[u8]) -> Result<bool>;
    /// Returns whether something was removed
    fn delete(&self, addr: &Address, location: &[u8]) -> Result<bool>;
    /// Visit every stored entry; per-entry read failures are handed to the
    /// visitor, which returns `false` to stop
    fn iterate(&self, visitor: &mut dyn FnMut(Result<RawEntry>) -> Result<bool>) -> Result<()>;
}

struct Slot {
    storage: Box<dyn SubStorage>,
    max_object_size: Option<u64>,
    object_types: Vec<ObjectType>,
}

/// Object visited by [`BlobStor::iterate`]
#[derive(Clone, Debug)]
pub struct BlobEntry {
    pub address: Address,
    /// Decompressed object bytes
    pub data: Vec<u8>,
    pub storage_id: Vec<u8>,
}

/// Outcome of a full iteration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterateRes {
    pub visited: u64,
    /// Entries skipped because they could not be read
    pub failed: u64,
}

#[derive(Clone, Debug)]
pub struct SubStorageInfo {
    pub kind: SubStorageKind,
    pub path: PathBuf,
    pub max_object_size: Option<u64>,
}

pub struct BlobStor {
    storages: Vec<Slot>,
    compressor: Compressor,
    read_only: AtomicBool,
}

impl BlobStor {
    /// Build the sub-storages described by `config`
    pub fn new(config: &BlobStorConfig) -> Result<Self> {
        if config.storages.is_empty() {
            return Err(Error::Configuration(
                "blob store needs at least one sub-storage".into(),
            ));
        }
        if config.storages.len() > usize::from(u8::MAX) + 1 {
            return Err(Error::Configuration("too many blob sub-storages".into()));
        }
        let storages = config
            .storages
            .iter()
            .map(|sc| {
                let storage: Box<dyn SubStorage> = match sc.kind {
                    SubStorageKind::FsTree => Box::new(FsTree::from_config(sc)),
                    SubStorageKind::PackTree => Box::new(PackTree::from_config(sc)),
                };
                Slot {
                    storage,
                    max_object_size: sc.max_object_size,
                    object_types: sc.object_types.clone(),
                }
            })
            .collect();
        Ok(Self {
            storages,
            compressor: Compressor::new(config.compress, config.compression_level),
            read_only: AtomicBool::new(false),
        })
    }

    pub fn open(&self, read_only: bool) -> Result<()> {
        self.read_only.store(read_only, Ordering::Release);
        for slot in &self.storages {
            slot.storage.open(read_only)?;
        }
        debug!(storages = self.storages.len(), read_only, "blob store opened");
        Ok(())
    }

    pub fn init(&self) -> Result<()> {
        for slot in &self.storages {
            slot.storage.init()?;
        }
        info!(storages = self.storages.len(), "blob store initialized");
        Ok(())
    }

    /// Close every sub-storage, reporting the first failure
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for slot in &self.storages {
            if let Err(e) = slot.storage.close() {
                warn!(path = %slot.storage.path().display(), error = %e, "sub-storage close failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        for slot in &self.storages {
            slot.storage.set_read_only(read_only)?;
        }
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Index of the sub-storage for `header` serialized into `size` bytes
    #[must_use]
    pub fn select(&self, header: &ObjectHeader, size: u64) -> usize {
        let last = self.storages.len() - 1;
        self.storages
            .iter()
            .position(|s| admits(s, header, size))
            .unwrap_or(last)
    }

    /// Serialize and store an object
    pub fn put(&self, object: &Object) -> Result<Vec<u8>> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let data = object.marshal()?;
        let idx = self.select(&object.header, data.len() as u64);
        let stored = self.compressor.encode(&data)?;
        let location = self.storages[idx].storage.put(&object.address(), &stored)?;

        let mut sid = Vec::with_capacity(1 + location.len());
        sid.push(idx as u8);
        sid.extend_from_slice(&location);
        Ok(sid)
    }

    fn resolve<'a>(&self, storage_id: &'a [u8]) -> Result<(&dyn SubStorage, &'a [u8])> {
        let (&idx, location) = storage_id
            .split_first()
            .ok_or_else(|| Error::corruption("empty storage ID"))?;
        let slot = self
            .storages
            .get(usize::from(idx))
            .ok_or_else(|| Error::corruption(format!("unknown sub-storage {idx}")))?;
        Ok((slot.storage.as_ref(), location))
    }

    /// Read and decode object bytes
    ///
    /// With a storage ID only that sub-storage is consulted; otherwise every
    /// sub-storage is tried in order.
    pub fn get_raw(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<Vec<u8>> {
        if let Some(sid) = storage_id {
            let (storage, location) = self.resolve(sid)?;
            return Compressor::decode(storage.get(addr, location)?);
        }

        let mut last_err = None;
        for slot in &self.storages {
            match slot.storage.get(addr, &[]) {
                Ok(data) => return Compressor::decode(data),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(%addr, path = %slot.storage.path().display(), error = %e, "sub-storage read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(Error::NotFound(*addr)))
    }

    /// Read and decode an object
    ///
    /// Undecodable bytes are reported as corruption.
    pub fn get(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<Object> {
        let data = self.get_raw(addr, storage_id)?;
        let object = Object::unmarshal(&data)
            .map_err(|e| Error::corruption(format!("stored object {addr}: {e}")))?;
        if object.address() != *addr {
            return Err(Error::corruption(format!(
                "stored object {addr} holds {}",
                object.address()
            )));
        }
        Ok(object)
    }

    pub fn exists(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<bool> {
        if let Some(sid) = storage_id {
            let (storage, location) = self.resolve(sid)?;
            return storage.exists(addr, location);
        }
        for slot in &self.storages {
            if slot.storage.exists(addr, &[])? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove object bytes; absent objects are a no-op
    pub fn delete(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if let Some(sid) = storage_id {
            let (storage, location) = self.resolve(sid)?;
            storage.delete(addr, location)?;
            return Ok(());
        }
        for slot in &self.storages {
            slot.storage.delete(addr, &[])?;
        }
        Ok(())
    }

    /// Visit every stored object across all sub-storages
    ///
    /// The sequence is finite and starts over on every call. With
    /// `ignore_errors` unreadable entries are logged, counted and skipped;
    /// otherwise the first one aborts the iteration.
    pub fn iterate(
        &self,
        ignore_errors: bool,
        mut f: impl FnMut(BlobEntry) -> Result<()>,
    ) -> Result<IterateRes> {
        let mut res = IterateRes::default();
        for (idx, slot) in self.storages.iter().enumerate() {
            slot.storage.iterate(&mut |item| {
                let entry = item.and_then(|raw| {
                    let data = Compressor::decode(raw.data)?;
                    let mut storage_id = Vec::with_capacity(1 + raw.location.len());
                    storage_id.push(idx as u8);
                    storage_id.extend_from_slice(&raw.location);
                    Ok(BlobEntry {
                        address: raw.address,
                        data,
                        storage_id,
                    })
                });
                match entry {
                    Ok(entry) => {
                        res.visited += 1;
                        f(entry)?;
                    }
                    Err(e) if ignore_errors => {
                        warn!(path = %slot.storage.path().display(), error = %e, "skipping unreadable blob");
                        res.failed += 1;
                    }
                    Err(e) => return Err(e),
                }
                Ok(true)
            })?;
        }
        Ok(res)
    }

    pub fn info(&self) -> Vec<SubStorageInfo> {
        self.storages
            .iter()
            .map(|s| SubStorageInfo {
                kind: s.storage.kind(),
                path: s.storage.path().to_path_buf(),
                max_object_size: s.max_object_size,
            })
            .collect()
    }
}

/// Placement policy of one sub-storage
fn admits(slot: &Slot, header: &ObjectHeader, size: u64) -> bool {
    slot.max_object_size.is_none_or(|max| size <= max)
        && (slot.object_types.is_empty() || slot.object_types.contains(&header.object_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::config::SubStorageConfig;
    use cairn_common::{ContainerId, ObjectType, OwnerId};
    use std::path::Path;
    use tempfile::tempdir;

    fn config(dir: &Path, compress: bool) -> BlobStorConfig {
        BlobStorConfig {
            compress,
            compression_level: 3,
            storages: vec![
                SubStorageConfig {
                    kind: SubStorageKind::PackTree,
                    path: dir.join("small"),
                    width: 2,
                    max_object_size: Some(1024),
                    ..Default::default()
                },
                SubStorageConfig {
                    kind: SubStorageKind::FsTree,
                    path: dir.join("large"),
                    ..Default::default()
                },
            ],
        }
    }

    fn open(dir: &Path, compress: bool) -> BlobStor {
        let bs = BlobStor::new(&config(dir, compress)).unwrap();
        bs.open(false).unwrap();
        bs.init().unwrap();
        bs
    }

    fn object(size: usize) -> Object {
        let payload: Vec<u8> = (0..size).map(|_| rand::random::<u8>()).collect();
        Object::new(ContainerId::random(), OwnerId::random(), ObjectType::Regular, payload)
    }

    #[test]
    fn test_policy_routes_by_size() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), false);
        let small = object(100);
        let large = object(10_000);

        let small_sid = bs.put(&small).unwrap();
        let large_sid = bs.put(&large).unwrap();
        assert_eq!(small_sid[0], 0);
        assert_eq!(large_sid[0], 1);

        assert_eq!(bs.get(&small.address(), Some(&small_sid)).unwrap(), small);
        assert_eq!(bs.get(&large.address(), None).unwrap(), large);
        // A hint pointing at the wrong sub-storage does not fall back.
        assert!(
            bs.get(&small.address(), Some(&large_sid))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_policy_sees_object_type() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), false);
        config.storages[0].object_types = vec![ObjectType::Regular];
        let bs = BlobStor::new(&config).unwrap();
        bs.open(false).unwrap();
        bs.init().unwrap();

        let regular = object(10);
        let tombstone = Object::new(
            ContainerId::random(),
            OwnerId::random(),
            ObjectType::Tombstone,
            vec![0u8; 10],
        );
        assert_eq!(bs.select(&regular.header, 100), 0);
        assert_eq!(bs.select(&tombstone.header, 100), 1);
        assert_eq!(bs.select(&regular.header, 4096), 1);

        let sid = bs.put(&tombstone).unwrap();
        assert_eq!(sid[0], 1);
        assert_eq!(bs.get(&tombstone.address(), Some(&sid)).unwrap(), tombstone);
    }

    #[test]
    fn test_objects_resembling_zstd_frames() {
        let mut cid = [7u8; 32];
        cid[..4].copy_from_slice(&[0x28, 0xB5, 0x2F, 0xFD]);
        for compress in [false, true] {
            let dir = tempdir().unwrap();
            let bs = open(dir.path(), compress);
            let small = Object::new(
                ContainerId::from_bytes(cid),
                OwnerId::random(),
                ObjectType::Regular,
                b"0123456789".to_vec(),
            );
            let large = Object::new(
                ContainerId::from_bytes(cid),
                OwnerId::random(),
                ObjectType::Regular,
                vec![3u8; 4096],
            );
            for o in [&small, &large] {
                let sid = bs.put(o).unwrap();
                assert_eq!(&bs.get(&o.address(), Some(&sid)).unwrap(), o);
                assert_eq!(&bs.get(&o.address(), None).unwrap(), o);
            }
            let res = bs.iterate(false, |_| Ok(())).unwrap();
            assert_eq!(res, IterateRes { visited: 2, failed: 0 });
        }
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), false);
        let obj = object(10);
        let sid = bs.put(&obj).unwrap();

        bs.delete(&obj.address(), Some(&sid)).unwrap();
        bs.delete(&obj.address(), Some(&sid)).unwrap();
        bs.delete(&obj.address(), None).unwrap();
        assert!(!bs.exists(&obj.address(), None).unwrap());
        assert!(bs.get(&obj.address(), None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_compressed_roundtrip_and_iteration() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), true);
        let text = Object::new(
            ContainerId::random(),
            OwnerId::random(),
            ObjectType::Regular,
            vec![b'a'; 50_000],
        );
        let sid = bs.put(&text).unwrap();
        let stored = FsTree::new(dir.path().join("large"), 2, 2, false)
            .get(&text.address(), &[])
            .unwrap();
        assert!(is_compressed(&stored));
        assert_eq!(bs.get(&text.address(), Some(&sid)).unwrap(), text);

        let others: Vec<_> = (0..5).map(|_| object(64)).collect();
        for o in &others {
            bs.put(o).unwrap();
        }

        let mut seen = Vec::new();
        let res = bs
            .iterate(false, |entry| {
                let obj = Object::unmarshal(&entry.data).unwrap();
                assert_eq!(obj.address(), entry.address);
                assert!(bs.exists(&entry.address, Some(&entry.storage_id)).unwrap());
                seen.push(entry.address);
                Ok(())
            })
            .unwrap();
        assert_eq!(res, IterateRes { visited: 6, failed: 0 });
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_iterate_ignore_errors() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), true);
        let good = Object::new(
            ContainerId::random(),
            OwnerId::random(),
            ObjectType::Regular,
            vec![b'g'; 20_000],
        );
        bs.put(&good).unwrap();

        // A large entry whose zstd frame is cut short.
        let broken = object(10).address();
        let tree = FsTree::new(dir.path().join("large"), 2, 2, false);
        let mut frame = Compressor::new(true, 3).encode(&[b'b'; 20_000]).unwrap();
        frame.truncate(frame.len() / 2);
        tree.put(&broken, &frame).unwrap();

        assert!(bs.iterate(false, |_| Ok(())).unwrap_err().is_corruption());
        let res = bs.iterate(true, |_| Ok(())).unwrap();
        assert_eq!(res, IterateRes { visited: 1, failed: 1 });
        assert!(bs.get(&broken, None).unwrap_err().is_corruption());
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), false);
        let obj = object(10);
        let sid = bs.put(&obj).unwrap();

        bs.set_read_only(true).unwrap();
        assert!(matches!(bs.put(&object(10)), Err(Error::ReadOnly)));
        assert!(matches!(bs.delete(&obj.address(), Some(&sid)), Err(Error::ReadOnly)));
        assert_eq!(bs.get(&obj.address(), Some(&sid)).unwrap(), obj);

        bs.set_read_only(false).unwrap();
        bs.delete(&obj.address(), Some(&sid)).unwrap();
        assert!(!bs.exists(&obj.address(), Some(&sid)).unwrap());
    }

    #[test]
    fn test_reopen_read_only() {
        let dir = tempdir().unwrap();
        let obj = object(10);
        let sid = {
            let bs = open(dir.path(), false);
            let sid = bs.put(&obj).unwrap();
            bs.close().unwrap();
            sid
        };
        let bs = BlobStor::new(&config(dir.path(), false)).unwrap();
        bs.open(true).unwrap();
        bs.init().unwrap();
        assert_eq!(bs.get(&obj.address(), Some(&sid)).unwrap(), obj);
    }
}
