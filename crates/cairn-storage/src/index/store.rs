//! Transactional index store
//!
//! Combines the WAL and the B-tree into a key/value store with atomic
//! multi-key transactions and background compaction.

use super::btree::{BTreeIndex, Tree, list_snapshots};
use super::types::{IndexConfig, IndexOp, Key};
use super::wal::IndexWal;
use cairn_common::{Error, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLockReadGuard};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const WAL_FILE: &str = "index.wal";

/// Read access shared by [`Reader`] and [`Txn`]
pub trait KvRead {
    /// Point lookup
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Visit entries with `start <= key < end` in key order
    ///
    /// `end = None` scans to the end of the keyspace. Scanning stops when
    /// `f` returns `false`.
    fn scan_range(&self, start: &[u8], end: Option<&[u8]>, f: &mut dyn FnMut(&[u8], &[u8]) -> bool);

    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Visit entries whose key starts with `prefix`
    fn scan_prefix(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        let end = prefix_end(prefix);
        self.scan_range(prefix, end.as_deref(), f);
    }

    /// Collect entries whose key starts with `prefix`
    fn collect_prefix(&self, prefix: &[u8]) -> Vec<(Key, Vec<u8>)> {
        let mut out = Vec::new();
        self.scan_prefix(prefix, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            true
        });
        out
    }
}

/// Smallest key greater than every key starting with `prefix`
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn bounds<'a>(start: &'a [u8], end: Option<&'a [u8]>) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    (
        Bound::Included(start),
        end.map_or(Bound::Unbounded, Bound::Excluded),
    )
}

/// Consistent read view
pub struct Reader<'a> {
    tree: RwLockReadGuard<'a, Tree>,
}

impl KvRead for Reader<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tree.get(key).cloned()
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.tree.contains_key(key)
    }

    fn scan_range(&self, start: &[u8], end: Option<&[u8]>, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        for (k, v) in self.tree.range::<[u8], _>(bounds(start, end)) {
            if !f(k, v) {
                break;
            }
        }
    }
}

/// Read-modify-write transaction
///
/// Reads observe the transaction's own pending writes.
pub struct Txn<'a> {
    base: RwLockReadGuard<'a, Tree>,
    pending: BTreeMap<Key, Option<Vec<u8>>>,
}

impl Txn<'_> {
    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Vec<u8>>) {
        self.pending.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Key>) {
        self.pending.insert(key.into(), None);
    }

    /// Whether the transaction has buffered writes
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    fn into_ops(self) -> Vec<IndexOp> {
        self.pending
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => IndexOp::Put { key, value },
                None => IndexOp::Delete { key },
            })
            .collect()
    }
}

impl KvRead for Txn<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.get(key) {
            Some(pending) => pending.clone(),
            None => self.base.get(key).cloned(),
        }
    }

    fn scan_range(&self, start: &[u8], end: Option<&[u8]>, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        let mut base = self.base.range::<[u8], _>(bounds(start, end)).peekable();
        let mut pending = self.pending.range::<[u8], _>(bounds(start, end)).peekable();

        loop {
            let order = match (base.peek(), pending.peek()) {
                (None, None) => break,
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (Some((kb, _)), Some((kp, _))) => kb.cmp(kp),
            };
            let keep_going = match order {
                CmpOrdering::Less => match base.next() {
                    Some((k, v)) => f(k, v),
                    None => break,
                },
                CmpOrdering::Equal | CmpOrdering::Greater => {
                    if order == CmpOrdering::Equal {
                        base.next();
                    }
                    match pending.next() {
                        Some((k, Some(v))) => f(k, v),
                        Some((_, None)) => true,
                        None => break,
                    }
                }
            };
            if !keep_going {
                break;
            }
        }
    }
}

/// Index store statistics
#[derive(Clone, Debug, Default)]
pub struct IndexStats {
    pub entry_count: u64,
    pub wal_size: u64,
    pub lsn: u64,
    pub last_snapshot_lsn: u64,
}

struct Shared {
    wal: IndexWal,
    tree: BTreeIndex,
    /// Serializes transactions, compaction and reset
    writer: Mutex<()>,
    config: IndexConfig,
}

impl Shared {
    fn needs_compaction(&self) -> bool {
        self.tree.mutations_since_snapshot() >= self.config.snapshot_threshold
            || self.wal.size() > self.config.wal_max_size_bytes
    }

    fn compact(&self) -> Result<PathBuf> {
        let _writer = self.writer.lock();
        let path = self.tree.write_snapshot()?;
        let lsn = self.tree.last_snapshot_lsn();
        if let Err(e) = self.wal.truncate_before(lsn + 1) {
            warn!(lsn, error = %e, "failed to truncate WAL after snapshot");
        } else {
            debug!(lsn, "truncated WAL after snapshot");
        }
        Ok(path)
    }
}

/// Persistent transactional key/value store
pub struct IndexStore {
    shared: Arc<Shared>,
    stop: Mutex<Option<Sender<()>>>,
    compaction_handle: Mutex<Option<thread::JoinHandle<()>>>,
    fresh: bool,
}

impl IndexStore {
    /// Open the store in `config.dir`, creating it when absent
    ///
    /// Loads the newest snapshot and replays the WAL after it.
    pub fn open_or_create(config: IndexConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| Error::storage(format!("failed to create index dir: {e}")))?;

        let wal_path = config.dir.join(WAL_FILE);
        let fresh = !wal_path.exists() && list_snapshots(&config.dir)?.is_empty();

        let tree = BTreeIndex::load_snapshot(&config.dir, config.snapshot_retention)?;
        let snapshot_lsn = tree.last_snapshot_lsn();
        let wal = IndexWal::open(&wal_path, snapshot_lsn, config.sync_on_write)?;

        let mut replayed = 0u64;
        wal.replay(snapshot_lsn + 1, |lsn, ops| {
            tree.apply(ops, lsn);
            replayed += 1;
            Ok(())
        })?;

        info!(
            dir = %config.dir.display(),
            snapshot_lsn,
            replayed,
            entries = tree.len(),
            "opened index store"
        );

        let store = Self {
            shared: Arc::new(Shared {
                wal,
                tree,
                writer: Mutex::new(()),
                config,
            }),
            stop: Mutex::new(None),
            compaction_handle: Mutex::new(None),
            fresh,
        };
        if store.shared.config.background_compaction {
            store.start_background_compaction();
        }
        Ok(store)
    }

    /// Whether neither a WAL nor a snapshot existed when the store was opened
    pub const fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Run `f` against a consistent read view
    pub fn view<T>(&self, f: impl FnOnce(&Reader<'_>) -> Result<T>) -> Result<T> {
        let reader = Reader {
            tree: self.shared.tree.read(),
        };
        f(&reader)
    }

    /// Run `f` as an atomic transaction
    ///
    /// Writers are serialized. When `f` succeeds its writes are logged as
    /// one WAL record and applied together; when it fails nothing is written.
    pub fn update<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let _writer = self.shared.writer.lock();
        let mut txn = Txn {
            base: self.shared.tree.read(),
            pending: BTreeMap::new(),
        };
        let out = f(&mut txn)?;

        let ops = txn.into_ops();
        if !ops.is_empty() {
            let lsn = self.shared.wal.append_batch(&ops)?;
            self.shared.tree.apply(ops, lsn);
        }
        Ok(out)
    }

    /// Force a snapshot and truncate the WAL
    pub fn snapshot(&self) -> Result<PathBuf> {
        let path = self.shared.compact()?;
        info!(path = %path.display(), "wrote index snapshot");
        Ok(path)
    }

    /// Snapshot when the mutation count or the WAL size crossed its threshold
    pub fn maybe_compact(&self) -> Result<Option<PathBuf>> {
        if self.shared.needs_compaction() {
            self.snapshot().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Drop all state
    pub fn reset(&self) -> Result<()> {
        let _writer = self.shared.writer.lock();
        self.shared.tree.clear();
        self.shared.wal.clear()?;
        self.shared.tree.cleanup_old_snapshots(0)?;
        info!(dir = %self.shared.config.dir.display(), "index store reset");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.shared.wal.sync()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entry_count: self.shared.tree.len() as u64,
            wal_size: self.shared.wal.size(),
            lsn: self.shared.wal.current_lsn(),
            last_snapshot_lsn: self.shared.tree.last_snapshot_lsn(),
        }
    }

    fn start_background_compaction(&self) {
        let shared = Arc::clone(&self.shared);
        let interval = shared.config.compaction_interval;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::spawn(move || {
            debug!("index compaction thread started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if shared.needs_compaction() {
                    match shared.compact() {
                        Ok(path) => debug!(path = %path.display(), "background snapshot completed"),
                        Err(e) => error!(error = %e, "background snapshot failed"),
                    }
                }
            }
            debug!("index compaction thread stopped");
        });

        *self.stop.lock() = Some(stop_tx);
        *self.compaction_handle.lock() = Some(handle);
    }

    /// Stop background compaction and sync the WAL
    pub fn close(&self) -> Result<()> {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.compaction_handle.lock().take() {
            let _ = handle.join();
        }
        self.shared.wal.sync()
    }
}

impl Drop for IndexStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to sync index WAL on drop");
        }
    }
}
