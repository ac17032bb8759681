//! Content-addressed backing store
//!
//! Maps file records onto sharded physical files under the content root
//! and decides when a version can share bytes with another record.

pub mod checksum;
pub mod dedup;
mod layout;

pub use checksum::RunningChecksum;
pub use dedup::DedupScope;
pub use layout::{shard_dir, shard_path};

use crate::error::Result;
use crate::metadata::FileRecord;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Flags that never reach the physical open
const STRIPPED_FLAGS: i32 =
    libc::O_ACCMODE | libc::O_CREAT | libc::O_APPEND | libc::O_TRUNC | libc::O_EXCL;

/// Physical file layout rooted at one directory
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ContentStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard directory for the record's canonical bytes
    pub fn dir_for(&self, file: &FileRecord) -> Result<PathBuf> {
        shard_dir(&self.root, file.canonical_uuid())
    }

    /// Physical file for the record's canonical bytes
    pub fn path_for(&self, file: &FileRecord) -> Result<PathBuf> {
        shard_path(&self.root, file.canonical_uuid())
    }

    /// Physical file named by the record's own uuid. Writers always use
    /// this path, never the bytes of a dedup owner.
    pub fn own_path_for(&self, file: &FileRecord) -> Result<PathBuf> {
        shard_path(&self.root, &file.uuid)
    }

    /// Create the shard directory if missing
    pub fn ensure_dir(&self, file: &FileRecord) -> Result<PathBuf> {
        let dir = self.dir_for(file)?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Create, or truncate, the physical file for a new version and open it
    /// read-write.
    pub fn create_version(&self, file: &FileRecord, flags: i32) -> Result<File> {
        std::fs::create_dir_all(shard_dir(&self.root, &file.uuid)?)?;
        let path = self.own_path_for(file)?;
        debug!("create_version(id={}, path={:?})", file.id, path);
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(flags & !STRIPPED_FLAGS)
            .open(&path)?;
        Ok(handle)
    }

    /// Open the physical file of an existing version. Readers follow the
    /// dedup pointer, writers get the record's own file.
    pub fn open(&self, file: &FileRecord, flags: i32) -> Result<File> {
        let writable = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let path = if writable {
            self.own_path_for(file)?
        } else {
            self.path_for(file)?
        };
        let handle = OpenOptions::new()
            .read(true)
            .write(writable)
            .custom_flags(flags & !STRIPPED_FLAGS)
            .open(&path)?;
        Ok(handle)
    }

    /// Size of the physical bytes backing the record
    pub fn size_of(&self, file: &FileRecord) -> Result<u64> {
        Ok(std::fs::metadata(self.path_for(file)?)?.len())
    }

    pub fn metadata(&self, file: &FileRecord) -> Result<std::fs::Metadata> {
        Ok(std::fs::metadata(self.path_for(file)?)?)
    }

    /// Size of the record's own physical file
    pub fn own_size_of(&self, file: &FileRecord) -> Result<u64> {
        Ok(std::fs::metadata(self.own_path_for(file)?)?.len())
    }

    /// Truncate the record's own physical file without an open handle
    pub fn truncate(&self, file: &FileRecord, size: u64) -> Result<()> {
        let handle = OpenOptions::new().write(true).open(self.own_path_for(file)?)?;
        handle.set_len(size)?;
        Ok(())
    }

    /// Delete the record's own physical file; a missing file is not an error
    pub fn remove_version(&self, file: &FileRecord) -> Result<()> {
        let path = self.own_path_for(file)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed physical file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Filesystem statistics for the content root
    pub fn statvfs(&self) -> Result<nix::sys::statvfs::Statvfs> {
        Ok(nix::sys::statvfs::statvfs(&self.root)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let file = FileRecord::new_file(1, 1, 1, 1, "a.txt");

        let mut f = store.create_version(&file, libc::O_WRONLY | libc::O_CREAT).unwrap();
        f.write_all(b"test data").unwrap();
        drop(f);

        assert!(store.path_for(&file).unwrap().starts_with(dir.path()));
        assert_eq!(store.size_of(&file).unwrap(), 9);

        let mut buf = String::new();
        store
            .open(&file, libc::O_RDONLY)
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "test data");
    }

    #[test]
    fn test_remove_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let file = FileRecord::new_file(1, 1, 1, 1, "a.txt");

        drop(store.create_version(&file, libc::O_WRONLY | libc::O_CREAT).unwrap());
        store.remove_version(&file).unwrap();
        assert!(!store.own_path_for(&file).unwrap().exists());
        store.remove_version(&file).unwrap();
    }

    #[test]
    fn test_ensure_dir_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let file = FileRecord::new_file(1, 1, 1, 1, "a.txt");

        let first = store.ensure_dir(&file).unwrap();
        let second = store.ensure_dir(&file).unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[test]
    fn test_deduplicated_record_reads_owner_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let owner = FileRecord::new_file(1, 1, 1, 1, "a.txt");
        let mut copy = FileRecord::new_file(2, 1, 1, 1, "b.txt");
        copy.point_at(&owner);

        assert_eq!(store.path_for(&copy).unwrap(), store.path_for(&owner).unwrap());
    }
}
