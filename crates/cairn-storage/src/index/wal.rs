//! Index Write-Ahead Log
//!
//! Append-only log of committed index transactions. Every record carries
//! one whole transaction, so a transaction is either replayed completely
//! or not at all.
//!
//! Record format:
//! ```text
//! +--------+------+--------+-------+--------+
//! | Magic  | LSN  | Length | Batch | CRC32C |
//! | 4B     | 8B   | 4B     | var   | 4B     |
//! +--------+------+--------+-------+--------+
//! ```
//!
//! Replay stops at the first record that is truncated or fails its CRC.
//! Such a torn tail is cut off when the log is reopened.

use super::types::{IndexBatch, IndexOp};
use cairn_common::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// WAL record magic number
const WAL_MAGIC: u32 = 0x4C41_5743; // "CWAL"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// Smallest possible record
const MIN_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 4;

/// A single WAL record
#[derive(Debug, PartialEq, Eq)]
pub struct WalRecord {
    /// Log Sequence Number
    pub lsn: u64,
    /// Serialized batch
    pub data: Vec<u8>,
}

impl WalRecord {
    /// Serialize record to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.data.len())
            .map_err(|_| Error::storage("index transaction exceeds 4GiB"))?;
        let mut buf = Vec::with_capacity(MIN_RECORD_SIZE + self.data.len());
        buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.data);

        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse the record at the start of `data`, returning it and its size
    ///
    /// Returns `None` for a truncated, foreign or damaged record.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < MIN_RECORD_SIZE {
            return None;
        }
        if u32::from_le_bytes(data[0..4].try_into().ok()?) != WAL_MAGIC {
            return None;
        }
        let lsn = u64::from_le_bytes(data[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(data[12..16].try_into().ok()?) as usize;

        let body_end = RECORD_HEADER_SIZE + len;
        let total = body_end + 4;
        if data.len() < total {
            return None;
        }
        let stored = u32::from_le_bytes(data[body_end..total].try_into().ok()?);
        if crc32c::crc32c(&data[..body_end]) != stored {
            return None;
        }
        Some((
            Self {
                lsn,
                data: data[RECORD_HEADER_SIZE..body_end].to_vec(),
            },
            total,
        ))
    }
}

/// Read every valid record of a log file
///
/// Returns the records and the byte length of the valid prefix.
fn read_records(path: &Path) -> Result<(Vec<WalRecord>, u64)> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(Error::storage(format!("failed to read WAL: {e}"))),
    };

    let mut records = Vec::new();
    let mut offset = 0;
    while let Some((record, size)) = WalRecord::parse(&data[offset..]) {
        records.push(record);
        offset += size;
    }
    if offset < data.len() {
        warn!(
            path = %path.display(),
            valid = offset,
            total = data.len(),
            "WAL has a torn tail, ignoring the rest"
        );
    }
    Ok((records, offset as u64))
}

/// Index Write-Ahead Log
pub struct IndexWal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    size: AtomicU64,
    next_lsn: AtomicU64,
    sync_on_write: bool,
}

impl IndexWal {
    /// Open a log, creating it when absent
    ///
    /// LSNs continue after `min_lsn` even when the log holds no records,
    /// so a log truncated after a snapshot never reuses sequence numbers.
    pub fn open(path: impl AsRef<Path>, min_lsn: u64, sync_on_write: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (records, valid_len) = read_records(&path)?;
        let last_lsn = records.last().map_or(0, |r| r.lsn).max(min_lsn);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open WAL: {e}")))?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            size: AtomicU64::new(valid_len),
            next_lsn: AtomicU64::new(last_lsn + 1),
            sync_on_write,
        })
    }

    /// Append one transaction, returning its LSN
    pub fn append_batch(&self, ops: &[IndexOp]) -> Result<u64> {
        let data = IndexBatch { ops: ops.to_vec() }
            .to_bytes()
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut writer = self.writer.lock();
        let lsn = self.next_lsn.load(Ordering::SeqCst);
        let bytes = WalRecord { lsn, data }.to_bytes()?;

        writer
            .write_all(&bytes)
            .and_then(|()| writer.flush())
            .map_err(|e| Error::storage(format!("WAL write failed: {e}")))?;
        if self.sync_on_write {
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| Error::storage(format!("WAL sync failed: {e}")))?;
        }

        self.next_lsn.store(lsn + 1, Ordering::SeqCst);
        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Sync WAL to disk
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| Error::storage(format!("WAL flush failed: {e}")))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::storage(format!("WAL sync failed: {e}")))
    }

    /// Replay transactions with `lsn >= from_lsn`
    ///
    /// Returns the last LSN seen.
    pub fn replay<F>(&self, from_lsn: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(u64, Vec<IndexOp>) -> Result<()>,
    {
        let (records, _) = read_records(&self.path)?;
        let mut last = from_lsn.saturating_sub(1);
        for record in records {
            if record.lsn >= from_lsn {
                let batch = IndexBatch::from_bytes(&record.data).ok_or_else(|| {
                    Error::corruption(format!("undecodable WAL batch at LSN {}", record.lsn))
                })?;
                callback(record.lsn, batch.ops)?;
            }
            last = last.max(record.lsn);
        }
        Ok(last)
    }

    /// Drop every record with `lsn < keep_from`
    ///
    /// Called after a successful snapshot. The caller must prevent
    /// concurrent appends.
    pub fn truncate_before(&self, keep_from: u64) -> Result<()> {
        let (records, _) = read_records(&self.path)?;
        let new_path = self.path.with_extension("wal.new");
        {
            let mut out = BufWriter::new(File::create(&new_path)?);
            for record in records.into_iter().filter(|r| r.lsn >= keep_from) {
                out.write_all(&record.to_bytes()?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&new_path, &self.path)
            .map_err(|e| Error::storage(format!("WAL rename failed: {e}")))?;
        self.reopen_writer()
    }

    /// Discard the whole log
    pub fn clear(&self) -> Result<()> {
        File::create(&self.path)?.sync_all()?;
        self.reopen_writer()
    }

    fn reopen_writer(&self) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::storage(format!("failed to reopen WAL: {e}")))?;
        let len = file.metadata()?.len();
        *self.writer.lock() = BufWriter::new(file);
        self.size.store(len, Ordering::Relaxed);
        Ok(())
    }

    /// Last assigned LSN
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// WAL size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
