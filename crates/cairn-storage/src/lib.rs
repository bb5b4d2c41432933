//! Cairn Storage Engine - Local object shard
//!
//! This crate implements the per-disk storage engine of Cairn:
//! - Transactional key-value index (WAL + B-tree + snapshots)
//! - Metabase: object index, graveyard, locks and counters
//! - Blob store: size-routed sub-storages with optional compression
//! - Write-cache with background flushing
//! - Shard: mode machine, garbage collector, dump and restore

pub mod blobstor;
pub mod index;
pub mod metabase;
pub mod shard;
pub mod writecache;

// Re-exports
pub use blobstor::{BlobEntry, BlobStor, FsTree, PackTree, SubStorage, SubStorageInfo};
pub use index::{IndexConfig, IndexStore};
pub use metabase::{
    DeleteRes, ExpiredObject, InhumePrm, InhumeRes, Metabase, MetabaseInfo, ObjectCounters,
    PutRes, SelectFilter,
};
pub use shard::{
    AtomicMetrics, DUMP_MAGIC, DumpRes, MetricsSnapshot, MetricsWriter, NoopMetrics, RestoreRes,
    Shard, ShardInfo,
};
pub use writecache::{FlushRes, FlushTarget, WriteCache, WriteCacheInfo};
