use super::dump::DUMP_MAGIC;
use super::{Shard, writable};
use cairn_common::{Error, Object, Result};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

/// Result of a restore
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreRes {
    /// Objects put into the shard
    pub count: u64,
    /// Records that could not be decoded or stored
    pub failed: u64,
}

/// Fill `buf` as far as the stream allows; returns the bytes read
fn fill(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

fn truncated(what: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("truncated {what}"),
    ))
}

/// Next record of the stream, `None` at a clean end
fn read_record(r: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match fill(r, &mut len)? {
        0 => return Ok(None),
        4 => {}
        _ => return Err(truncated("record length")),
    }
    let len = u64::from(u32::from_le_bytes(len));
    let mut data = Vec::new();
    r.take(len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(truncated("record"));
    }
    Ok(Some(data))
}

impl Shard {
    /// Put every object of the dump at `path` into the shard
    ///
    /// A missing file restores nothing.
    pub fn restore(&self, path: impl AsRef<Path>, ignore_errors: bool) -> Result<RestoreRes> {
        let path = path.as_ref();
        writable(self.mode())?;
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no dump to restore");
                return Ok(RestoreRes::default());
            }
            Err(e) => return Err(e.into()),
        };
        let res = self.restore_from(&mut BufReader::new(file), ignore_errors)?;
        info!(path = %path.display(), count = res.count, failed = res.failed, "shard restored");
        Ok(res)
    }

    /// Put every object of the dump stream `r` into the shard
    ///
    /// Each record goes through [`Shard::put`], so the shard lock is only
    /// held per object. With `ignore_errors` bad records are counted and
    /// skipped, and a truncated tail ends the restore.
    pub fn restore_from<R: Read>(&self, r: &mut R, ignore_errors: bool) -> Result<RestoreRes> {
        writable(self.mode())?;

        let mut magic = [0u8; 4];
        match fill(r, &mut magic)? {
            0 => return Ok(RestoreRes::default()),
            4 if magic == DUMP_MAGIC => {}
            _ => return Err(Error::InvalidMagic),
        }

        let mut res = RestoreRes::default();
        loop {
            let data = match read_record(r) {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) if ignore_errors && e.is_unexpected_eof() => {
                    warn!(restored = res.count, error = %e, "dump ends with a partial record");
                    res.failed += 1;
                    break;
                }
                Err(e) => return Err(e),
            };

            match Object::unmarshal(&data).and_then(|object| self.put(&object)) {
                Ok(_) => res.count += 1,
                Err(e) if ignore_errors => {
                    warn!(record = res.count + res.failed, error = %e, "skipping dump record");
                    res.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(res)
    }
}
