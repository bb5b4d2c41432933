//! Metabase
//!
//! Durable index over object addresses built on the [`IndexStore`]:
//! primary records with storage descriptors, graveyard and garbage marks,
//! lock relations, the expiration index and object counters. Counters are
//! updated in the same transaction as the mutation they account for.
//!
//! The metabase reports failures; choosing a shard mode in response is
//! left to the shard.

mod counters;
mod delete;
mod get;
mod inhume;
pub mod keys;
mod lock;
mod put;
mod select;
mod sweep;

pub use counters::ObjectCounters;
pub use delete::DeleteRes;
pub use inhume::{InhumePrm, InhumeRes, InhumeTarget};
pub use keys::{Grave, IndexRecord};
pub use put::PutRes;
pub use select::SelectFilter;
pub use sweep::ExpiredObject;

use crate::index::{IndexConfig, IndexStats, IndexStore, KvRead, Txn};
use cairn_common::config::MetabaseConfig;
use cairn_common::{Address, Epoch, EpochState, Error, Mode, Result};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Availability of an address as seen by the index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Absent,
    Available,
    /// Covered by a tombstone or a garbage mark
    Removed,
    Expired,
}

/// Metabase information for administrative reporting
#[derive(Clone, Debug)]
pub struct MetabaseInfo {
    pub path: PathBuf,
    pub mode: Mode,
    pub version: Option<u64>,
    pub index: IndexStats,
}

/// Persistent object index
pub struct Metabase {
    config: RwLock<MetabaseConfig>,
    store: RwLock<Option<IndexStore>>,
    mode: RwLock<Mode>,
    epoch: Arc<dyn EpochState>,
}

impl Metabase {
    pub fn new(config: MetabaseConfig, epoch: Arc<dyn EpochState>) -> Self {
        Self {
            config: RwLock::new(config),
            store: RwLock::new(None),
            mode: RwLock::new(Mode::ReadWrite),
            epoch,
        }
    }

    /// Open the index store
    ///
    /// In read-only mode background compaction is not started.
    pub fn open(&self, read_only: bool) -> Result<()> {
        let mut index_config = IndexConfig::from(&*self.config.read());
        if read_only {
            index_config.background_compaction = false;
        }
        let store = IndexStore::open_or_create(index_config)?;
        *self.store.write() = Some(store);
        *self.mode.write() = if read_only {
            Mode::ReadOnly
        } else {
            Mode::ReadWrite
        };
        Ok(())
    }

    /// Check the layout version and make sure counters are persisted
    ///
    /// A store that has never been initialized gets the current version
    /// stamped; a store written by another version fails with
    /// `OutdatedVersion`. Missing counters are recomputed.
    pub fn init(&self) -> Result<()> {
        let read_only = self.mode().read_only();
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(Error::Degraded)?;

        let (version, empty) = store.view(|r| {
            let version = r.get(&keys::shard_info(keys::VERSION));
            let mut empty = true;
            r.scan_prefix(&[keys::PRIMARY], &mut |_, _| {
                empty = false;
                false
            });
            Ok((version, empty))
        })?;

        match version.as_deref().map(keys::decode_u64) {
            Some(Some(keys::CURRENT_VERSION)) => {}
            Some(found) => {
                return Err(Error::OutdatedVersion {
                    found: found.unwrap_or_default(),
                    expected: keys::CURRENT_VERSION,
                });
            }
            None if !empty => {
                return Err(Error::OutdatedVersion {
                    found: 0,
                    expected: keys::CURRENT_VERSION,
                });
            }
            None if !read_only => {
                store.update(|txn| {
                    txn.put(
                        keys::shard_info(keys::VERSION),
                        keys::CURRENT_VERSION.to_le_bytes().to_vec(),
                    );
                    Ok(())
                })?;
            }
            None => {}
        }

        let counters_present = store.view(|r| {
            Ok(r.contains(&keys::shard_info(keys::PHY_COUNTER))
                && r.contains(&keys::shard_info(keys::LOGIC_COUNTER)))
        })?;
        drop(guard);

        if !counters_present && !read_only {
            let counters = self.sync_counters(true)?;
            info!(phy = counters.phy, logic = counters.logic, "object counters recomputed");
        }
        Ok(())
    }

    /// Close the index store
    pub fn close(&self) -> Result<()> {
        if let Some(store) = self.store.write().take() {
            store.close()?;
            debug!("metabase closed");
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    /// Switch the metabase mode
    ///
    /// Modes without a metabase close the store; others reopen it when
    /// it was closed.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        if mode.no_metabase() {
            self.close()?;
        } else if self.store.read().is_none() {
            self.open(mode.read_only())?;
            self.init()?;
        }
        *self.mode.write() = mode;
        Ok(())
    }

    /// Re-open the metabase with a new configuration
    ///
    /// Returns `true` when a different store was opened, either because the
    /// path changed or because no store was open before. The caller then
    /// decides whether to refill or init it.
    pub fn reload(&self, config: MetabaseConfig) -> Result<bool> {
        let same_path = self.config.read().path == config.path;
        let was_open = self.store.read().is_some();
        if same_path && was_open {
            *self.config.write() = config;
            return Ok(false);
        }

        self.close()?;
        *self.config.write() = config;
        self.open(false)?;
        Ok(true)
    }

    /// Drop every index entry and stamp the current version
    pub fn reset(&self) -> Result<()> {
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(Error::Degraded)?;
        store.reset()?;
        store.update(|txn| {
            txn.put(
                keys::shard_info(keys::VERSION),
                keys::CURRENT_VERSION.to_le_bytes().to_vec(),
            );
            Ok(())
        })
    }

    pub fn info(&self) -> Result<MetabaseInfo> {
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(Error::Degraded)?;
        let version = store.view(|r| {
            Ok(r.get(&keys::shard_info(keys::VERSION))
                .and_then(|v| keys::decode_u64(&v)))
        })?;
        Ok(MetabaseInfo {
            path: self.config.read().path.clone(),
            mode: self.mode(),
            version,
            index: store.stats(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.config.read().path.clone()
    }

    fn current_epoch(&self) -> Epoch {
        self.epoch.current_epoch()
    }

    /// Run a read view against the open store
    fn view<T>(&self, f: impl FnOnce(&dyn KvRead) -> Result<T>) -> Result<T> {
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(Error::Degraded)?;
        store.view(|r| f(r))
    }

    /// Run a mutation; refused unless the metabase is writable
    fn update<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let mode = self.mode();
        if mode.no_metabase() {
            return Err(Error::Degraded);
        }
        if mode.read_only() {
            return Err(Error::ReadOnly);
        }
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(Error::Degraded)?;
        store.update(f)
    }
}

/// Load the primary record of `addr`
pub(crate) fn record<R: KvRead + ?Sized>(r: &R, addr: &Address) -> Result<Option<IndexRecord>> {
    r.get(&keys::primary(addr))
        .map(|data| IndexRecord::decode(addr, &data))
        .transpose()
}

/// Whether `addr` carries a graveyard entry or a garbage mark
pub(crate) fn is_removed<R: KvRead + ?Sized>(r: &R, addr: &Address) -> bool {
    r.contains(&keys::graveyard(addr)) || r.contains(&keys::garbage(addr))
}

/// Whether any lock relation protects `addr`
pub(crate) fn is_locked<R: KvRead + ?Sized>(r: &R, addr: &Address) -> bool {
    let mut locked = false;
    r.scan_prefix(&keys::locked_prefix(addr), &mut |_, _| {
        locked = true;
        false
    });
    locked
}

/// Classify `addr` against the index at `epoch`
pub(crate) fn status<R: KvRead + ?Sized>(
    r: &R,
    addr: &Address,
    epoch: Epoch,
) -> Result<(Status, Option<IndexRecord>)> {
    if r.contains(&keys::graveyard(addr)) {
        return Ok((Status::Removed, record(r, addr)?));
    }
    let Some(rec) = record(r, addr)? else {
        return Ok((Status::Absent, None));
    };
    if r.contains(&keys::garbage(addr)) {
        return Ok((Status::Removed, Some(rec)));
    }
    if rec.header.expiration.is_some_and(|e| e < epoch) && !is_locked(r, addr) {
        return Ok((Status::Expired, Some(rec)));
    }
    Ok((Status::Available, Some(rec)))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use cairn_common::{ContainerId, EpochCounter, Object, ObjectType, OwnerId};
    use std::path::Path;

    pub fn config(dir: &Path) -> MetabaseConfig {
        MetabaseConfig {
            path: dir.join("meta"),
            sync_on_write: false,
            background_compaction: false,
            ..Default::default()
        }
    }

    pub fn open(dir: &Path) -> (Metabase, Arc<EpochCounter>) {
        let epoch = Arc::new(EpochCounter::new(10));
        let mb = Metabase::new(config(dir), epoch.clone());
        mb.open(false).unwrap();
        mb.init().unwrap();
        (mb, epoch)
    }

    pub fn object(cid: ContainerId) -> Object {
        Object::new(cid, OwnerId::random(), ObjectType::Regular, b"0123456789".to_vec())
    }

    pub fn put(mb: &Metabase, obj: &Object) {
        mb.put(&obj.header, Some(vec![0])).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use cairn_common::{ContainerId, EpochCounter};
    use tempfile::tempdir;

    #[test]
    fn test_read_only_refuses_mutations() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let obj = object(ContainerId::random());

        mb.set_mode(Mode::ReadOnly).unwrap();
        assert!(matches!(mb.put(&obj.header, None), Err(Error::ReadOnly)));
        assert!(mb.get(&obj.address()).unwrap_err().is_not_found());

        mb.set_mode(Mode::DegradedReadOnly).unwrap();
        assert!(matches!(mb.get(&obj.address()), Err(Error::Degraded)));

        mb.set_mode(Mode::ReadWrite).unwrap();
        put(&mb, &obj);
        assert!(mb.get(&obj.address()).is_ok());
    }

    #[test]
    fn test_reopen_keeps_state() {
        let dir = tempdir().unwrap();
        let obj = object(ContainerId::random());
        {
            let (mb, _) = open(dir.path());
            put(&mb, &obj);
            mb.close().unwrap();
        }
        let (mb, _) = open(dir.path());
        assert_eq!(mb.get(&obj.address()).unwrap().header, obj.header);
        assert_eq!(mb.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 1 });
        assert_eq!(mb.info().unwrap().version, Some(keys::CURRENT_VERSION));
    }

    #[test]
    fn test_outdated_version() {
        let dir = tempdir().unwrap();
        {
            let (mb, _) = open(dir.path());
            mb.update(|txn| {
                txn.put(keys::shard_info(keys::VERSION), 7u64.to_le_bytes().to_vec());
                Ok(())
            })
            .unwrap();
            mb.close().unwrap();
        }

        let mb = Metabase::new(config(dir.path()), Arc::new(EpochCounter::new(0)));
        mb.open(false).unwrap();
        assert!(matches!(
            mb.init(),
            Err(Error::OutdatedVersion { found: 7, expected: 1 })
        ));
    }

    #[test]
    fn test_reload_reports_new_instance() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        assert!(!mb.reload(config(dir.path())).unwrap());

        let mut other = config(dir.path());
        other.path = dir.path().join("meta2");
        assert!(mb.reload(other).unwrap());
        mb.init().unwrap();
        assert_eq!(mb.path(), dir.path().join("meta2"));
    }

    #[test]
    fn test_reset_clears_objects() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let obj = object(ContainerId::random());
        put(&mb, &obj);

        mb.reset().unwrap();
        assert!(mb.get(&obj.address()).unwrap_err().is_not_found());
        assert_eq!(mb.object_counters().unwrap(), ObjectCounters::default());
        mb.init().unwrap();
    }
}
