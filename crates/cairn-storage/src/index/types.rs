//! Index store types

use cairn_common::config::MetabaseConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Raw index key; components build their own prefixed layouts
pub type Key = Vec<u8>;

/// Index store configuration
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Directory holding `index.wal` and the snapshots
    pub dir: PathBuf,
    /// Sync after every committed transaction
    pub sync_on_write: bool,
    /// WAL size that triggers compaction
    pub wal_max_size_bytes: u64,
    /// Mutations between snapshots
    pub snapshot_threshold: u64,
    /// Keep this many old snapshots
    pub snapshot_retention: usize,
    /// Enable background compaction
    pub background_compaction: bool,
    /// Compaction check interval
    pub compaction_interval: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::from(&MetabaseConfig::default())
    }
}

impl From<&MetabaseConfig> for IndexConfig {
    fn from(c: &MetabaseConfig) -> Self {
        Self {
            dir: c.path.clone(),
            sync_on_write: c.sync_on_write,
            wal_max_size_bytes: c.wal_max_size_bytes,
            snapshot_threshold: c.snapshot_threshold,
            snapshot_retention: c.snapshot_retention.max(1),
            background_compaction: c.background_compaction,
            compaction_interval: Duration::from_secs(c.compaction_interval_secs.max(1)),
        }
    }
}

/// Logged index operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOp {
    /// Insert or update an entry
    Put { key: Key, value: Vec<u8> },
    /// Delete an entry
    Delete { key: Key },
}

/// One committed transaction as stored in a WAL record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexBatch {
    pub ops: Vec<IndexOp>,
}

impl IndexBatch {
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

/// Snapshot file header
#[derive(Clone, Debug)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// LSN of the last transaction included in the snapshot
    pub lsn: u64,
    pub entry_count: u64,
    /// CRC32C of the snapshot body
    pub checksum: u32,
}

impl SnapshotHeader {
    pub const MAGIC: u32 = 0x5844_4943; // "CIDX"
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 28;

    #[must_use]
    pub const fn new(lsn: u64, entry_count: u64, checksum: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            lsn,
            entry_count,
            checksum,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse a header; `None` on short input, wrong magic or unknown version
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let version = u32::from_le_bytes(data[4..8].try_into().ok()?);
        if magic != Self::MAGIC || version != Self::VERSION {
            return None;
        }
        Some(Self {
            magic,
            version,
            lsn: u64::from_le_bytes(data[8..16].try_into().ok()?),
            entry_count: u64::from_le_bytes(data[16..24].try_into().ok()?),
            checksum: u32::from_le_bytes(data[24..28].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_header_rejects_bad_magic() {
        let header = SnapshotHeader::new(1000, 500, 0xDEAD_BEEF);
        let mut bytes = header.to_bytes();
        let parsed = SnapshotHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.lsn, 1000);
        assert_eq!(parsed.entry_count, 500);
        assert_eq!(parsed.checksum, 0xDEAD_BEEF);

        bytes[0] ^= 0xFF;
        assert!(SnapshotHeader::from_bytes(&bytes).is_none());
        assert!(SnapshotHeader::from_bytes(&bytes[..10]).is_none());
    }

    #[test]
    fn test_config_from_metabase() {
        let mb = MetabaseConfig {
            snapshot_retention: 0,
            compaction_interval_secs: 0,
            ..Default::default()
        };
        let cfg = IndexConfig::from(&mb);
        assert_eq!(cfg.snapshot_retention, 1);
        assert_eq!(cfg.compaction_interval, Duration::from_secs(1));
    }
}
