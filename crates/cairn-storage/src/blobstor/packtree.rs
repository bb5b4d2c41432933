//! Small objects appended into a fixed set of pack files
//!
//! An object always lands in pack `xxh64(address) % width`. Packs are
//! append-only logs of records:
//! ```text
//! +--------+------+---------+--------+------+--------+
//! | Magic  | Kind | Address | Length | Data | CRC32C |
//! | 4B     | 1B   | 64B     | 4B     | var  | 4B     |
//! +--------+------+---------+--------+------+--------+
//! ```
//! A delete appends a record without data. The in-memory index of each
//! pack is rebuilt by scanning it on open. A complete record failing its
//! checksum is skipped by its length and reported as corruption on access;
//! after unparseable bytes the scan resumes at the next valid record. Only
//! a torn tail left by a crash is cut off, unless the tree is opened
//! read-only.
//!
//! The storage location is the pack number (u32 LE).

use super::{RawEntry, SubStorage};
use cairn_common::config::{SubStorageConfig, SubStorageKind};
use cairn_common::{Address, Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

/// Pack record magic number
const PACK_RECORD_MAGIC: u32 = 0x4B41_5043; // "CPAK"

/// Record header size (magic + kind + address + length)
const RECORD_HEADER_SIZE: usize = 4 + 1 + Address::SIZE + 4;

const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;

/// Location of a live record body inside a pack
#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u64,
    len: u32,
}

struct Pack {
    /// `None` for a pack missing from a read-only tree
    file: Option<File>,
    /// Append position
    end: u64,
    index: HashMap<Address, Slot>,
    /// Objects whose latest record failed its checksum
    damaged: HashSet<Address>,
}

/// Outcome of parsing the bytes at one pack position
enum Parsed<'a> {
    Record {
        kind: u8,
        addr: Address,
        body: &'a [u8],
        consumed: usize,
    },
    /// Complete record with a checksum mismatch
    Damaged {
        kind: u8,
        addr: Option<Address>,
        consumed: usize,
    },
    /// Not a record, or one running past the end of the pack
    Invalid,
}

impl Pack {
    fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut file = if read_only {
            if !path.exists() {
                return Ok(Self {
                    file: None,
                    end: 0,
                    index: HashMap::new(),
                    damaged: HashSet::new(),
                });
            }
            File::open(path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut index = HashMap::new();
        let mut damaged = HashSet::new();
        let mut skipped = 0u64;
        let mut pos = 0usize;
        while pos < data.len() {
            match parse_record(&data[pos..]) {
                Parsed::Record {
                    kind,
                    addr,
                    body,
                    consumed,
                } => {
                    damaged.remove(&addr);
                    if kind == KIND_PUT {
                        let offset = (pos + RECORD_HEADER_SIZE) as u64;
                        index.insert(addr, Slot {
                            offset,
                            len: body.len() as u32,
                        });
                    } else {
                        index.remove(&addr);
                    }
                    pos += consumed;
                }
                Parsed::Damaged {
                    kind,
                    addr,
                    consumed,
                } => {
                    warn!(pack = %path.display(), offset = pos, "pack record fails its checksum");
                    if let Some(addr) = addr {
                        index.remove(&addr);
                        if kind == KIND_PUT {
                            damaged.insert(addr);
                        } else {
                            damaged.remove(&addr);
                        }
                    }
                    skipped += 1;
                    pos += consumed;
                }
                Parsed::Invalid => match next_record(&data, pos + 1) {
                    Some(next) => {
                        warn!(
                            pack = %path.display(),
                            offset = pos,
                            len = next - pos,
                            "skipping unparseable pack bytes"
                        );
                        skipped += 1;
                        pos = next;
                    }
                    None => break,
                },
            }
        }

        if pos < data.len() {
            warn!(
                pack = %path.display(),
                valid = pos,
                total = data.len(),
                "pack has a torn tail"
            );
            if !read_only {
                file.set_len(pos as u64)?;
            }
        }
        if skipped > 0 {
            warn!(pack = %path.display(), skipped, damaged = damaged.len(), "pack has damaged records");
        }

        Ok(Self {
            file: Some(file),
            end: pos as u64,
            index,
            damaged,
        })
    }

    fn append(&mut self, kind: u8, addr: &Address, data: &[u8], sync: bool) -> Result<Slot> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::storage(format!("object {addr} too large for a pack")))?;
        let mut rec = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + 4);
        rec.extend_from_slice(&PACK_RECORD_MAGIC.to_le_bytes());
        rec.push(kind);
        rec.extend_from_slice(&addr.to_bytes());
        rec.extend_from_slice(&len.to_le_bytes());
        rec.extend_from_slice(data);
        let crc = crc32c::crc32c(&rec[4..]);
        rec.extend_from_slice(&crc.to_le_bytes());

        let end = self.end;
        let file = self.file()?;
        file.seek(SeekFrom::Start(end))?;
        if let Err(e) = file.write_all(&rec) {
            // Drop whatever part of the record made it to disk
            let _ = file.set_len(end);
            return Err(e.into());
        }
        if sync {
            file.sync_data()?;
        }

        let slot = Slot {
            offset: end + RECORD_HEADER_SIZE as u64,
            len,
        };
        self.end += rec.len() as u64;
        Ok(slot)
    }

    fn read(&mut self, slot: Slot) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; slot.len as usize];
        let file = self.file()?;
        file.seek(SeekFrom::Start(slot.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::storage("pack file is missing"))
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// Parse the record at the start of `buf`
fn parse_record(buf: &[u8]) -> Parsed<'_> {
    if buf.len() < RECORD_HEADER_SIZE + 4 || read_u32(buf, 0) != PACK_RECORD_MAGIC {
        return Parsed::Invalid;
    }
    let kind = buf[4];
    if kind != KIND_PUT && kind != KIND_DELETE {
        return Parsed::Invalid;
    }
    let len = read_u32(buf, 5 + Address::SIZE) as usize;
    let total = RECORD_HEADER_SIZE + len + 4;
    if buf.len() < total {
        return Parsed::Invalid;
    }
    let addr = Address::from_bytes(&buf[5..5 + Address::SIZE]);
    if crc32c::crc32c(&buf[4..total - 4]) != read_u32(buf, total - 4) {
        return Parsed::Damaged {
            kind,
            addr,
            consumed: total,
        };
    }
    match addr {
        Some(addr) => Parsed::Record {
            kind,
            addr,
            body: &buf[RECORD_HEADER_SIZE..total - 4],
            consumed: total,
        },
        None => Parsed::Invalid,
    }
}

/// Position of the first valid record at or after `from`
fn next_record(data: &[u8], from: usize) -> Option<usize> {
    let magic = PACK_RECORD_MAGIC.to_le_bytes();
    (from..data.len().saturating_sub(RECORD_HEADER_SIZE + 3)).find(|&pos| {
        data[pos..].starts_with(&magic) && matches!(parse_record(&data[pos..]), Parsed::Record { .. })
    })
}

pub struct PackTree {
    root: PathBuf,
    width: usize,
    sync: bool,
    read_only: AtomicBool,
    /// Pack files were opened without write access
    opened_read_only: AtomicBool,
    packs: RwLock<Vec<Mutex<Pack>>>,
}

impl PackTree {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, width: usize, sync: bool) -> Self {
        Self {
            root: root.into(),
            width: width.max(1),
            sync,
            read_only: AtomicBool::new(false),
            opened_read_only: AtomicBool::new(false),
            packs: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &SubStorageConfig) -> Self {
        Self::new(&config.path, config.width, config.sync)
    }

    fn pack_path(&self, n: usize) -> PathBuf {
        self.root.join(format!("pack_{n:04}.dat"))
    }

    fn pack_of(&self, addr: &Address) -> usize {
        (xxh64(&addr.to_bytes(), 0) % self.width as u64) as usize
    }

    fn parse_location(&self, addr: &Address, location: &[u8]) -> Result<usize> {
        if location.is_empty() {
            return Ok(self.pack_of(addr));
        }
        let n = location
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| Error::corruption(format!("bad pack location for {addr}")))?;
        Ok(n as usize)
    }

    fn with_pack<T>(&self, n: usize, f: impl FnOnce(&mut Pack) -> Result<T>) -> Result<T> {
        let packs = self.packs.read();
        if packs.is_empty() {
            return Err(Error::storage(format!(
                "packtree {} is not open",
                self.root.display()
            )));
        }
        let pack = packs
            .get(n)
            .ok_or_else(|| Error::corruption(format!("pack {n} out of range")))?;
        f(&mut pack.lock())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Live objects across all packs
    pub fn len(&self) -> usize {
        self.packs.read().iter().map(|p| p.lock().index.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubStorage for PackTree {
    fn kind(&self) -> SubStorageKind {
        SubStorageKind::PackTree
    }

    fn path(&self) -> &Path {
        &self.root
    }

    fn open(&self, read_only: bool) -> Result<()> {
        self.read_only.store(read_only, Ordering::Release);
        self.opened_read_only.store(read_only, Ordering::Release);
        if !read_only {
            fs::create_dir_all(&self.root)?;
        }

        let mut packs = Vec::with_capacity(self.width);
        for n in 0..self.width {
            packs.push(Mutex::new(Pack::open(&self.pack_path(n), read_only)?));
        }
        let objects: usize = packs.iter().map(|p| p.lock().index.len()).sum();
        *self.packs.write() = packs;
        info!(root = %self.root.display(), packs = self.width, objects, "packtree opened");
        Ok(())
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let packs = std::mem::take(&mut *self.packs.write());
        if !self.read_only.load(Ordering::Acquire) {
            for pack in &packs {
                if let Some(file) = &pack.lock().file {
                    file.sync_all()?;
                }
            }
        }
        debug!(root = %self.root.display(), "packtree closed");
        Ok(())
    }

    /// Packs opened read-only are reopened for writing when leaving read-only
    fn set_read_only(&self, read_only: bool) -> Result<()> {
        let reopen = !read_only && self.opened_read_only.load(Ordering::Acquire);
        if reopen && !self.packs.read().is_empty() {
            return self.open(false);
        }
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    fn put(&self, addr: &Address, data: &[u8]) -> Result<Vec<u8>> {
        self.check_writable()?;
        let n = self.pack_of(addr);
        self.with_pack(n, |pack| {
            let slot = pack.append(KIND_PUT, addr, data, self.sync)?;
            pack.index.insert(*addr, slot);
            pack.damaged.remove(addr);
            Ok(())
        })?;
        Ok((n as u32).to_le_bytes().to_vec())
    }

    fn get(&self, addr: &Address, location: &[u8]) -> Result<Vec<u8>> {
        let n = self.parse_location(addr, location)?;
        self.with_pack(n, |pack| match pack.index.get(addr) {
            Some(&slot) => pack.read(slot),
            None if pack.damaged.contains(addr) => Err(damaged_record(addr)),
            None => Err(Error::NotFound(*addr)),
        })
    }

    fn exists(&self, addr: &Address, location: &[u8]) -> Result<bool> {
        let n = self.parse_location(addr, location)?;
        self.with_pack(n, |pack| Ok(pack.index.contains_key(addr) || pack.damaged.contains(addr)))
    }

    fn delete(&self, addr: &Address, location: &[u8]) -> Result<bool> {
        self.check_writable()?;
        let n = self.parse_location(addr, location)?;
        // TODO: rewrite packs once dead records dominate them
        self.with_pack(n, |pack| {
            if !pack.index.contains_key(addr) && !pack.damaged.contains(addr) {
                return Ok(false);
            }
            pack.append(KIND_DELETE, addr, &[], self.sync)?;
            pack.index.remove(addr);
            pack.damaged.remove(addr);
            Ok(true)
        })
    }

    fn iterate(&self, visitor: &mut dyn FnMut(Result<RawEntry>) -> Result<bool>) -> Result<()> {
        let count = self.packs.read().len();
        for n in 0..count {
            let (mut slots, mut damaged): (Vec<(Address, Slot)>, Vec<Address>) =
                self.with_pack(n, |pack| {
                    Ok((
                        pack.index.iter().map(|(a, s)| (*a, *s)).collect(),
                        pack.damaged.iter().copied().collect(),
                    ))
                })?;
            slots.sort_by_key(|(_, s)| s.offset);
            damaged.sort();
            for addr in &damaged {
                if !visitor(Err(damaged_record(addr)))? {
                    return Ok(());
                }
            }

            let location = (n as u32).to_le_bytes().to_vec();
            for (address, slot) in slots {
                let item = self
                    .with_pack(n, |pack| pack.read(slot))
                    .map(|data| RawEntry {
                        address,
                        data,
                        location: location.clone(),
                    });
                if !visitor(item)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn damaged_record(addr: &Address) -> Error {
    Error::corruption(format!("pack record of {addr} fails its checksum"))
}
