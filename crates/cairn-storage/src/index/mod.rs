//! Index store
//!
//! Persistence layer under the metabase:
//! - Write-ahead log of committed transactions (CRC32C per record)
//! - In-memory B-tree with checksummed snapshots
//! - Atomic multi-key read-modify-write transactions

mod btree;
mod store;
mod types;
mod wal;

pub use btree::BTreeIndex;
pub use store::{IndexStats, IndexStore, KvRead, Reader, Txn, prefix_end};
pub use types::{IndexBatch, IndexConfig, IndexOp, Key, SnapshotHeader};
pub use wal::{IndexWal, WalRecord};
