//! Binary shard dump
//!
//! Stream layout:
//!
//! ```text
//! +-------+---------+------+---------+------+-----
//! | CRND  | len u32 | data | len u32 | data | ...
//! +-------+---------+------+---------+------+-----
//! ```
//!
//! `len` is little-endian, `data` is an object in its marshaled form.
//! End of stream terminates the record list.

use super::Shard;
use cairn_common::{Address, Error, Mode, Object, Result};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

pub const DUMP_MAGIC: [u8; 4] = *b"CRND";

/// Result of a dump
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpRes {
    /// Records written
    pub count: u64,
    /// Entries skipped as unreadable
    pub failed: u64,
}

fn dumpable(mode: Mode) -> Result<()> {
    match mode {
        Mode::ReadOnly | Mode::DegradedReadOnly => Ok(()),
        Mode::Disabled => Err(Error::ShardDisabled),
        Mode::ReadWrite => Err(Error::MustBeReadOnly),
    }
}

fn write_record(w: &mut impl Write, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::validation(format!("object of {} bytes is too big to dump", data.len())))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(data)?;
    Ok(())
}

impl Shard {
    /// Dump every stored object into a new file at `path`
    ///
    /// The file must not exist.
    pub fn dump(&self, path: impl AsRef<Path>, ignore_errors: bool) -> Result<DumpRes> {
        let path = path.as_ref();
        dumpable(self.mode())?;
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut w = BufWriter::new(file);
        let res = self.dump_to(&mut w, ignore_errors)?;
        w.into_inner()
            .map_err(|e| Error::Io(e.into_error()))?
            .sync_all()?;
        info!(path = %path.display(), count = res.count, failed = res.failed, "shard dumped");
        Ok(res)
    }

    /// Dump every stored object into `w`
    ///
    /// Write-cache entries come first; blob store copies of the same
    /// objects are skipped. Requires `ReadOnly` or `DegradedReadOnly`.
    pub fn dump_to<W: Write>(&self, w: &mut W, ignore_errors: bool) -> Result<DumpRes> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        dumpable(*mode)?;

        w.write_all(&DUMP_MAGIC)?;
        let mut res = DumpRes::default();
        let mut seen: HashSet<Address> = HashSet::new();

        let mut emit = |addr: Address, data: &[u8], res: &mut DumpRes| -> Result<()> {
            if let Err(e) = Object::unmarshal(data) {
                if !ignore_errors {
                    return Err(e);
                }
                warn!(%addr, error = %e, "skipping undecodable object");
                res.failed += 1;
                return Ok(());
            }
            write_record(&mut *w, data)?;
            res.count += 1;
            Ok(())
        };

        if let Some(wc) = &inner.writecache {
            let it = wc.iterate(ignore_errors, |addr, data| {
                seen.insert(addr);
                emit(addr, &data, &mut res)
            })?;
            res.failed += it.failed;
        }

        let it = inner.blobstor.iterate(ignore_errors, |entry| {
            if !seen.insert(entry.address) {
                return Ok(());
            }
            emit(entry.address, &entry.data, &mut res)
        })?;
        res.failed += it.failed;

        w.flush()?;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use cairn_common::ContainerId;
    use tempfile::tempdir;

    #[test]
    fn test_dump_requires_read_only() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), false);
        let mut out = Vec::new();
        assert!(matches!(shard.dump_to(&mut out, false), Err(Error::MustBeReadOnly)));
        assert!(out.is_empty());
        assert!(matches!(
            shard.dump(dir.path().join("dump"), false),
            Err(Error::MustBeReadOnly)
        ));
        assert!(!dir.path().join("dump").exists());
    }

    #[test]
    fn test_empty_dump_is_magic_only() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), false);
        shard.set_mode(Mode::ReadOnly).unwrap();
        let mut out = Vec::new();
        assert_eq!(shard.dump_to(&mut out, false).unwrap(), DumpRes::default());
        assert_eq!(out, DUMP_MAGIC);
    }

    #[test]
    fn test_dump_deduplicates_cached_objects() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), true);
        config.writecache.flush_interval_ms = 3_600_000;
        let (shard, _) = start(config);
        let cid = ContainerId::random();
        let stored = object(cid);
        shard.put(&stored).unwrap();
        let cached = object(cid);
        shard.inner.blobstor.put(&cached).unwrap();

        // leaving ReadWrite drains the cache, so refill it afterwards
        shard.set_mode(Mode::ReadOnly).unwrap();
        let wc = shard.inner.writecache.as_ref().unwrap();
        assert!(wc.is_empty());
        wc.set_read_only(false).unwrap();
        wc.put(&cached).unwrap();

        let mut out = Vec::new();
        let res = shard.dump_to(&mut out, false).unwrap();
        assert_eq!(res, DumpRes { count: 2, failed: 0 });
    }

    #[test]
    fn test_dump_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), false);
        shard.put(&object(ContainerId::random())).unwrap();
        shard.set_mode(Mode::ReadOnly).unwrap();

        let path = dir.path().join("dump");
        assert_eq!(shard.dump(&path, false).unwrap().count, 1);
        assert!(matches!(shard.dump(&path, false), Err(Error::Io(_))));
    }
}
