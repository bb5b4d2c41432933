//! In-memory B-tree index with snapshot persistence
//!
//! Uses Rust's `BTreeMap` for the core index, with:
//! - Point lookups, prefix and range scans
//! - Batches applied under a single write lock
//! - Periodic checksummed snapshots to disk

use super::types::{IndexOp, Key, SnapshotHeader};
use cairn_common::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub(crate) type Tree = BTreeMap<Key, Vec<u8>>;

/// In-memory B-tree index
pub struct BTreeIndex {
    tree: RwLock<Tree>,
    /// LSN of the last applied batch
    lsn: AtomicU64,
    mutations_since_snapshot: AtomicU64,
    last_snapshot_lsn: AtomicU64,
    snapshot_dir: PathBuf,
    snapshot_retention: usize,
}

impl BTreeIndex {
    /// Create an empty index
    pub fn new(snapshot_dir: impl Into<PathBuf>, snapshot_retention: usize) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            lsn: AtomicU64::new(0),
            mutations_since_snapshot: AtomicU64::new(0),
            last_snapshot_lsn: AtomicU64::new(0),
            snapshot_dir: snapshot_dir.into(),
            snapshot_retention,
        }
    }

    /// Load the index from the latest snapshot, or start empty
    ///
    /// A snapshot that fails its header or checksum check is `Corruption`.
    pub fn load_snapshot(snapshot_dir: impl Into<PathBuf>, snapshot_retention: usize) -> Result<Self> {
        let index = Self::new(snapshot_dir, snapshot_retention);
        let Some((path, _)) = list_snapshots(&index.snapshot_dir)?.into_iter().next() else {
            return Ok(index);
        };

        let (tree, header) = read_snapshot(&path)?;
        debug!(path = %path.display(), lsn = header.lsn, entries = tree.len(), "loaded snapshot");
        *index.tree.write() = tree;
        index.lsn.store(header.lsn, Ordering::SeqCst);
        index.last_snapshot_lsn.store(header.lsn, Ordering::SeqCst);
        Ok(index)
    }

    /// Shared read access to the tree
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read()
    }

    /// Apply one committed batch
    pub fn apply(&self, ops: Vec<IndexOp>, lsn: u64) {
        let count = ops.len() as u64;
        let mut tree = self.tree.write();
        for op in ops {
            match op {
                IndexOp::Put { key, value } => {
                    tree.insert(key, value);
                }
                IndexOp::Delete { key } => {
                    tree.remove(&key);
                }
            }
        }
        drop(tree);

        self.lsn.fetch_max(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.tree.write().clear();
        self.mutations_since_snapshot.store(0, Ordering::Relaxed);
    }

    /// Write a snapshot to disk
    ///
    /// The caller must prevent concurrent `apply` so that the snapshot LSN
    /// matches its content.
    pub fn write_snapshot(&self) -> Result<PathBuf> {
        let lsn = self.lsn.load(Ordering::SeqCst);
        let tree = self.tree.read();
        let entry_count = tree.len() as u64;
        let data = bincode::serialize(&*tree)
            .map_err(|e| Error::storage(format!("failed to serialize snapshot: {e}")))?;
        drop(tree);

        let header = SnapshotHeader::new(lsn, entry_count, crc32c::crc32c(&data));

        std::fs::create_dir_all(&self.snapshot_dir)
            .map_err(|e| Error::storage(format!("failed to create snapshot dir: {e}")))?;
        let name = format!("meta_{lsn}.snapshot");
        let path = self.snapshot_dir.join(&name);
        let temp_path = self.snapshot_dir.join(format!("{name}.tmp"));

        {
            let mut writer = BufWriter::new(
                File::create(&temp_path)
                    .map_err(|e| Error::storage(format!("failed to create snapshot file: {e}")))?,
            );
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&data)?;
            writer.flush()?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::storage(format!("failed to sync snapshot: {e}")))?;
        }

        std::fs::rename(&temp_path, &path)
            .map_err(|e| Error::storage(format!("failed to rename snapshot: {e}")))?;

        self.last_snapshot_lsn.store(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot.store(0, Ordering::Relaxed);
        self.cleanup_old_snapshots(self.snapshot_retention)?;
        Ok(path)
    }

    /// Keep only the newest `keep` snapshots
    pub fn cleanup_old_snapshots(&self, keep: usize) -> Result<()> {
        for (path, _) in list_snapshots(&self.snapshot_dir)?.into_iter().skip(keep) {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    pub fn mutations_since_snapshot(&self) -> u64 {
        self.mutations_since_snapshot.load(Ordering::Relaxed)
    }

    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn last_snapshot_lsn(&self) -> u64 {
        self.last_snapshot_lsn.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot files in `dir`, newest first
pub(crate) fn list_snapshots(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut snapshots: Vec<(PathBuf, u64)> = std::fs::read_dir(dir)
        .map_err(|e| Error::storage(format!("failed to read snapshot dir: {e}")))?
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let lsn = name
                .to_str()?
                .strip_prefix("meta_")?
                .strip_suffix(".snapshot")?
                .parse::<u64>()
                .ok()?;
            Some((entry.path(), lsn))
        })
        .collect();
    snapshots.sort_by_key(|(_, lsn)| std::cmp::Reverse(*lsn));
    Ok(snapshots)
}

fn read_snapshot(path: &Path) -> Result<(Tree, SnapshotHeader)> {
    let data = std::fs::read(path)
        .map_err(|e| Error::storage(format!("failed to read snapshot: {e}")))?;

    let header = SnapshotHeader::from_bytes(&data)
        .ok_or_else(|| Error::corruption(format!("invalid snapshot header in {}", path.display())))?;
    let body = &data[SnapshotHeader::SIZE..];
    if crc32c::crc32c(body) != header.checksum {
        return Err(Error::corruption(format!(
            "snapshot checksum mismatch in {}",
            path.display()
        )));
    }

    let tree: Tree = bincode::deserialize(body)
        .map_err(|e| Error::corruption(format!("failed to decode snapshot: {e}")))?;
    Ok((tree, header))
}
