//! Configuration types for Cairn
//!
//! This module defines the already-built configuration values consumed by
//! a shard and its components. Every struct has a `Default` and uses
//! `#[serde(default)]`, so partial TOML files are accepted.

use crate::mode::Mode;
use crate::types::ObjectType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration of a single shard
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Mode the shard enters after a successful `init`
    pub mode: Mode,
    /// Rebuild the metabase from blob store contents on `init`
    pub refill_metabase: bool,
    /// Metabase configuration
    pub metabase: MetabaseConfig,
    /// Blob store configuration
    pub blobstor: BlobStorConfig,
    /// Write-cache configuration
    pub writecache: WriteCacheConfig,
    /// Garbage collector configuration
    pub gc: GcConfig,
}

impl ShardConfig {
    /// Lay every component out under `root`
    ///
    /// Produces `<root>/meta`, `<root>/blob/small` (packtree for objects up
    /// to 128 KiB), `<root>/blob/large` (fstree catch-all) and
    /// `<root>/writecache`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            metabase: MetabaseConfig {
                path: root.join("meta"),
                ..Default::default()
            },
            blobstor: BlobStorConfig {
                storages: vec![
                    SubStorageConfig {
                        kind: SubStorageKind::PackTree,
                        path: root.join("blob").join("small"),
                        max_object_size: Some(128 * 1024),
                        ..Default::default()
                    },
                    SubStorageConfig {
                        kind: SubStorageKind::FsTree,
                        path: root.join("blob").join("large"),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            writecache: WriteCacheConfig {
                path: root.join("writecache"),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Metabase (index store) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetabaseConfig {
    /// Directory holding the WAL and snapshots
    pub path: PathBuf,
    /// Sync the WAL after every transaction
    pub sync_on_write: bool,
    /// WAL size that triggers a snapshot
    pub wal_max_size_bytes: u64,
    /// Mutations between snapshots
    pub snapshot_threshold: u64,
    /// Snapshots kept on disk
    pub snapshot_retention: usize,
    /// Run snapshotting on a background thread
    pub background_compaction: bool,
    /// Background compaction check interval
    pub compaction_interval_secs: u64,
}

impl Default for MetabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/cairn/meta"),
            sync_on_write: true,
            wal_max_size_bytes: 64 * 1024 * 1024, // 64MB
            snapshot_threshold: 10_000,
            snapshot_retention: 2,
            background_compaction: true,
            compaction_interval_secs: 60,
        }
    }
}

/// Blob store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStorConfig {
    /// Compress objects with zstd before writing
    pub compress: bool,
    /// zstd compression level
    pub compression_level: i32,
    /// Sub-storages in policy evaluation order
    pub storages: Vec<SubStorageConfig>,
}

impl Default for BlobStorConfig {
    fn default() -> Self {
        Self {
            compress: false,
            compression_level: 3,
            storages: vec![SubStorageConfig::default()],
        }
    }
}

/// Sub-storage backend kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStorageKind {
    /// One file per object in a fan-out directory tree
    #[default]
    FsTree,
    /// Small objects appended into a fixed set of pack files
    PackTree,
}

/// Configuration of one blob store sub-storage
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubStorageConfig {
    pub kind: SubStorageKind,
    /// Root directory
    pub path: PathBuf,
    /// Directory nesting depth (fstree)
    pub depth: usize,
    /// Hex characters per directory level (fstree) or pack count (packtree)
    pub width: usize,
    /// Largest serialized object this storage accepts; `None` accepts any
    pub max_object_size: Option<u64>,
    /// Object types this storage accepts; empty accepts every type
    pub object_types: Vec<ObjectType>,
    /// Sync files after writing
    pub sync: bool,
}

impl Default for SubStorageConfig {
    fn default() -> Self {
        Self {
            kind: SubStorageKind::FsTree,
            path: PathBuf::from("/var/lib/cairn/blob"),
            depth: 2,
            width: 2,
            max_object_size: None,
            object_types: Vec::new(),
            sync: false,
        }
    }
}

/// Write-cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteCacheConfig {
    pub enabled: bool,
    /// Cache directory
    pub path: PathBuf,
    /// Largest serialized object accepted
    pub max_object_size: u64,
    /// Total bytes held before new writes are rejected
    pub capacity_bytes: u64,
    /// Flush loop tick
    pub flush_interval_ms: u64,
    /// Upper bound of the flush retry backoff
    pub max_backoff_ms: u64,
    /// Consecutive storage write failures before the cache turns read-only
    pub error_threshold: u32,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("/var/lib/cairn/writecache"),
            max_object_size: 64 * 1024,          // 64KB
            capacity_bytes: 1024 * 1024 * 1024, // 1GB
            flush_interval_ms: 1000,
            max_backoff_ms: 30_000,
            error_threshold: 16,
        }
    }
}

/// Garbage collector configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Garbage remover period
    pub remover_interval_ms: u64,
    /// Objects deleted per remover batch
    pub remover_batch_size: usize,
    /// Objects deleted per batch by the epoch handlers
    pub expired_batch_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            remover_interval_ms: 60_000,
            remover_batch_size: 100,
            expired_batch_size: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_toml() {
        let config: ShardConfig = toml::from_str(
            r#"
            mode = "read_only"
            refill_metabase = true

            [metabase]
            path = "/data/shard0/meta"

            [[blobstor.storages]]
            kind = "pack_tree"
            path = "/data/shard0/small"
            width = 8
            max_object_size = 65536
            object_types = ["Regular"]

            [[blobstor.storages]]
            path = "/data/shard0/large"

            [writecache]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::ReadOnly);
        assert!(config.refill_metabase);
        assert!(config.metabase.sync_on_write);
        assert_eq!(config.blobstor.storages.len(), 2);
        assert_eq!(config.blobstor.storages[0].kind, SubStorageKind::PackTree);
        assert_eq!(config.blobstor.storages[0].width, 8);
        assert_eq!(config.blobstor.storages[0].object_types, vec![ObjectType::Regular]);
        assert_eq!(config.blobstor.storages[1].kind, SubStorageKind::FsTree);
        assert_eq!(config.blobstor.storages[1].max_object_size, None);
        assert!(config.blobstor.storages[1].object_types.is_empty());
        assert!(config.writecache.enabled);
        assert_eq!(config.gc.remover_batch_size, 100);
    }

    #[test]
    fn test_with_root_layout() {
        let config = ShardConfig::with_root("/srv/shard");
        assert_eq!(config.metabase.path, PathBuf::from("/srv/shard/meta"));
        assert_eq!(config.blobstor.storages.len(), 2);
        assert_eq!(
            config.writecache.path,
            PathBuf::from("/srv/shard/writecache")
        );
        assert_eq!(config.mode, Mode::ReadWrite);
    }
}
