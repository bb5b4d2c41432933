//! One file per object in a fan-out directory tree
//!
//! Layout:
//! ```text
//! <root>/<oid[0..w]>/<oid[w..2w]>/.../<cid>.<oid>
//! ```
//! Directory levels are taken from the hex object ID, `depth` levels of
//! `width` characters each. Writes go to a temporary file that is renamed
//! into place.

use super::{RawEntry, SubStorage};
use cairn_common::config::{SubStorageConfig, SubStorageKind};
use cairn_common::{Address, Error, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use walkdir::WalkDir;

const TEMP_MARKER: &str = ".tmp-";

pub struct FsTree {
    root: PathBuf,
    depth: usize,
    width: usize,
    sync: bool,
    read_only: AtomicBool,
}

impl FsTree {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, depth: usize, width: usize, sync: bool) -> Self {
        let width = width.max(1);
        // 64 hex characters in an object ID
        let depth = depth.min(64 / width);
        Self {
            root: root.into(),
            depth,
            width,
            sync,
            read_only: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn from_config(config: &SubStorageConfig) -> Self {
        Self::new(&config.path, config.depth, config.width, config.sync)
    }

    fn object_path(&self, addr: &Address) -> PathBuf {
        let oid = addr.object.to_string();
        let mut path = self.root.clone();
        for level in 0..self.depth {
            path.push(&oid[level * self.width..(level + 1) * self.width]);
        }
        path.push(format!("{}.{oid}", addr.container));
        path
    }

    fn parse_name(name: &str) -> Option<Address> {
        let (cid, oid) = name.split_once('.')?;
        Some(Address::new(cid.parse().ok()?, oid.parse().ok()?))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Total size of stored files
    pub fn size_bytes(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Sibling of `path` used while a write is in flight
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!("{TEMP_MARKER}{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

impl SubStorage for FsTree {
    fn kind(&self) -> SubStorageKind {
        SubStorageKind::FsTree
    }

    fn path(&self) -> &Path {
        &self.root
    }

    fn open(&self, read_only: bool) -> Result<()> {
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    /// Create the root and remove temporary files left by interrupted writes
    fn init(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Ok(());
        }
        fs::create_dir_all(&self.root)?;
        let mut removed = 0usize;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(std::result::Result::ok) {
            let stale = entry.file_type().is_file()
                && entry.file_name().to_string_lossy().contains(TEMP_MARKER);
            if stale && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(root = %self.root.display(), removed, "removed stale temporary files");
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    fn put(&self, addr: &Address, data: &[u8]) -> Result<Vec<u8>> {
        self.check_writable()?;
        let path = self.object_path(addr);
        let dir = path
            .parent()
            .ok_or_else(|| Error::internal("object path without parent"))?;
        fs::create_dir_all(dir)?;

        let tmp = temp_path(&path);
        let written = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            if self.sync {
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(Vec::new())
    }

    fn get(&self, addr: &Address, _location: &[u8]) -> Result<Vec<u8>> {
        match fs::read(self.object_path(addr)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(*addr)),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, addr: &Address, _location: &[u8]) -> Result<bool> {
        Ok(self.object_path(addr).try_exists()?)
    }

    fn delete(&self, addr: &Address, _location: &[u8]) -> Result<bool> {
        self.check_writable()?;
        match fs::remove_file(self.object_path(addr)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn iterate(&self, visitor: &mut dyn FnMut(Result<RawEntry>) -> Result<bool>) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let walker = WalkDir::new(&self.root)
            .min_depth(self.depth + 1)
            .max_depth(self.depth + 1)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let at = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    let err = Error::storage(format!("walk {at}: {e}"));
                    if !visitor(Err(err))? {
                        break;
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.contains(TEMP_MARKER) {
                continue;
            }
            let Some(address) = Self::parse_name(&name) else {
                debug!(path = %entry.path().display(), "skipping foreign file");
                continue;
            };
            let item = fs::read(entry.path())
                .map(|data| RawEntry {
                    address,
                    data,
                    location: Vec::new(),
                })
                .map_err(|e| Error::storage(format!("read {address}: {e}")));
            if !visitor(item)? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::{ContainerId, ObjectId};
    use tempfile::tempdir;

    fn addr() -> Address {
        Address::new(ContainerId::random(), ObjectId::random())
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let tree = FsTree::new(dir.path(), 2, 2, false);
        tree.init().unwrap();
        let a = addr();

        tree.put(&a, b"payload").unwrap();
        assert_eq!(tree.get(&a, &[]).unwrap(), b"payload");
        assert!(tree.exists(&a, &[]).unwrap());

        let oid = a.object.to_string();
        let expected = dir
            .path()
            .join(&oid[0..2])
            .join(&oid[2..4])
            .join(format!("{}.{oid}", a.container));
        assert!(expected.is_file());

        assert!(tree.delete(&a, &[]).unwrap());
        assert!(!tree.delete(&a, &[]).unwrap());
        assert!(tree.get(&a, &[]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_iterate_skips_temporary_files() {
        let dir = tempdir().unwrap();
        let tree = FsTree::new(dir.path(), 1, 2, false);
        tree.init().unwrap();
        let stored: Vec<_> = (0..4).map(|_| addr()).collect();
        for a in &stored {
            tree.put(a, a.object.as_bytes()).unwrap();
        }
        let stale = temp_path(&tree.object_path(&stored[0]));
        fs::write(&stale, b"partial").unwrap();

        let mut seen = Vec::new();
        tree.iterate(&mut |item| {
            let item = item.unwrap();
            assert_eq!(item.data, item.address.object.as_bytes());
            seen.push(item.address);
            Ok(true)
        })
        .unwrap();
        seen.sort();
        let mut expected = stored.clone();
        expected.sort();
        assert_eq!(seen, expected);

        tree.init().unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = tempdir().unwrap();
        let tree = FsTree::new(dir.path(), 2, 2, false);
        tree.init().unwrap();
        let a = addr();
        tree.put(&a, b"x").unwrap();

        tree.open(true).unwrap();
        assert!(matches!(tree.put(&addr(), b"y"), Err(Error::ReadOnly)));
        assert!(matches!(tree.delete(&a, &[]), Err(Error::ReadOnly)));
        assert_eq!(tree.get(&a, &[]).unwrap(), b"x");
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let tree = FsTree::new(dir.path(), 1, 2, false);
        tree.init().unwrap();
        let stored: Vec<_> = (0..6).map(|_| addr()).collect();
        for a in &stored {
            tree.put(a, b"payload").unwrap();
        }
        let hidden = tree.object_path(&stored[0]).parent().unwrap().to_path_buf();
        let readable = stored
            .iter()
            .filter(|a| tree.object_path(a).parent().unwrap() != hidden)
            .count();

        fs::set_permissions(&hidden, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&hidden).is_ok() {
            // permissions are not enforced for this user
            fs::set_permissions(&hidden, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let (mut ok, mut failed) = (0, 0);
        let walked = tree.iterate(&mut |item| {
            match item {
                Ok(_) => ok += 1,
                Err(_) => failed += 1,
            }
            Ok(true)
        });
        let strict = tree.iterate(&mut |item| item.map(|_| true));
        fs::set_permissions(&hidden, fs::Permissions::from_mode(0o755)).unwrap();

        walked.unwrap();
        assert!(failed >= 1);
        assert_eq!(ok, readable);
        assert!(strict.is_err());
    }
}
