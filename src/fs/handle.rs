//! Open file handles
//!
//! One [`FileHandle`] per open or create. Calls on the same handle are
//! serialized by its mutex; release holds it across the metadata commit so
//! no other call on the handle can interleave with finalization.

use super::attr::{inode_for, NodeAttr};
use super::services::BridgeServices;
use crate::error::{Error, Result};
use crate::metadata::{FileRecord, Release};
use crate::path::VirtualPath;
use crate::state::{ActivityCounter, KnownFile};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{close, lseek, Whence};
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A byte-range lock request or answer, `end` inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    pub end: u64,
    pub typ: i32,
    pub pid: u32,
}

impl LockRange {
    /// Whether the range covers the whole file
    pub fn is_whole_file(&self) -> bool {
        self.start == 0 && self.end >= i64::MAX as u64
    }

    fn to_flock(self) -> libc::flock {
        // SAFETY: flock is a plain C struct, all-zero is a valid value
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = self.typ as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = self.start.min(i64::MAX as u64) as libc::off_t;
        fl.l_len = if self.end >= i64::MAX as u64 {
            0
        } else {
            (self.end - self.start + 1) as libc::off_t
        };
        // OFD locks require a zero pid
        fl.l_pid = 0;
        fl
    }

    fn from_flock(fl: &libc::flock) -> Self {
        let start = fl.l_start.max(0) as u64;
        let end = if fl.l_len <= 0 {
            u64::MAX
        } else {
            start + fl.l_len as u64 - 1
        };
        LockRange {
            start,
            end,
            typ: fl.l_type as i32,
            pid: fl.l_pid.max(0) as u32,
        }
    }
}

/// Represents an open file
pub struct FileHandle {
    path: VirtualPath,
    /// Open flags as requested by the caller
    flags: i32,
    /// Version opened
    file: FileRecord,
    activity: Arc<ActivityCounter>,
    services: Arc<BridgeServices>,
    /// Descriptor, `None` once released
    descriptor: Mutex<Option<File>>,
}

impl FileHandle {
    pub(crate) fn new(
        services: Arc<BridgeServices>,
        path: VirtualPath,
        file: FileRecord,
        descriptor: File,
        flags: i32,
    ) -> Self {
        let activity = services.activity.get_or_create(path.transfer_base());
        FileHandle {
            path,
            flags,
            file,
            activity,
            services,
            descriptor: Mutex::new(Some(descriptor)),
        }
    }

    pub fn path(&self) -> &VirtualPath {
        &self.path
    }

    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Check if opened for append
    pub fn is_append(&self) -> bool {
        (self.flags & libc::O_APPEND) != 0
    }

    fn bad_handle(&self) -> Error {
        Error::BadHandle(self.path.full().to_string())
    }

    fn known(&self) -> Option<Arc<KnownFile>> {
        self.services.known_files.get(self.path.full())
    }

    /// Write `data` at `offset`, or at the end of the file in append mode.
    /// A write landing anywhere but the end of the bytes hashed so far
    /// invalidates the upload's checksum.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<u32> {
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        self.activity.increment();

        if !self.is_writable() {
            return Err(Error::Sys(Errno::EBADF));
        }

        match self.known() {
            Some(known) => {
                // writers sharing the upload see one end of file under this lock
                let mut state = known.lock();
                let at = self.write_offset(fd, offset)?;
                if let Err(e) = fd.write_all_at(data, at) {
                    state.checksum.invalidate();
                    return Err(e.into());
                }
                state.checksum.update(at, data);
            }
            None => {
                warn!(path = %self.path, "write on an untracked upload, checksum not kept");
                let at = self.write_offset(fd, offset)?;
                fd.write_all_at(data, at)?;
            }
        }

        Ok(data.len() as u32)
    }

    fn write_offset(&self, fd: &File, offset: u64) -> Result<u64> {
        if self.is_append() {
            Ok(fd.metadata()?.len())
        } else {
            Ok(offset)
        }
    }

    /// Read up to `size` bytes at `offset`
    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        self.activity.increment();

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match fd.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Nothing is buffered in the bridge
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    pub fn fsync(&self, datasync: bool) -> Result<()> {
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        if datasync {
            fd.sync_data()?;
        } else {
            fd.sync_all()?;
        }
        Ok(())
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        let whence = match whence {
            libc::SEEK_SET => Whence::SeekSet,
            libc::SEEK_CUR => Whence::SeekCur,
            libc::SEEK_END => Whence::SeekEnd,
            libc::SEEK_DATA => Whence::SeekData,
            libc::SEEK_HOLE => Whence::SeekHole,
            other => return Err(Error::InvalidArgument(format!("whence {}", other))),
        };
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        Ok(lseek(fd.as_raw_fd(), offset, whence)?)
    }

    /// Attributes from the open descriptor
    pub fn getattr(&self) -> Result<NodeAttr> {
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        let meta = fd.metadata()?;
        Ok(NodeAttr::from_metadata(
            inode_for(self.path.full()),
            self.services.file_mode,
            &meta,
        ))
    }

    /// Truncate through the descriptor
    pub fn truncate(&self, size: u64) -> Result<NodeAttr> {
        {
            let guard = self.descriptor.lock();
            let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
            if !self.is_writable() {
                return Err(Error::Sys(Errno::EBADF));
            }
            match self.known() {
                Some(known) => {
                    let mut state = known.lock();
                    fd.set_len(size)?;
                    state.checksum.truncate(size);
                }
                None => fd.set_len(size)?,
            }
        }
        self.getattr()
    }

    /// First lock conflicting with `lock`, or an `F_UNLCK` range
    pub fn getlk(&self, lock: LockRange) -> Result<LockRange> {
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        let mut fl = lock.to_flock();
        fcntl(fd.as_raw_fd(), FcntlArg::F_OFD_GETLK(&mut fl))?;
        Ok(LockRange::from_flock(&fl))
    }

    /// Byte-range lock owned by this open file description
    pub fn setlk(&self, lock: LockRange, sleep: bool) -> Result<()> {
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        let fl = lock.to_flock();
        let arg = if sleep {
            FcntlArg::F_OFD_SETLKW(&fl)
        } else {
            FcntlArg::F_OFD_SETLK(&fl)
        };
        fcntl(fd.as_raw_fd(), arg)?;
        Ok(())
    }

    /// Whole-file BSD lock; `typ` is F_RDLCK, F_WRLCK or F_UNLCK
    pub fn flock(&self, typ: i32, sleep: bool) -> Result<()> {
        let mut op = match typ {
            libc::F_RDLCK => libc::LOCK_SH,
            libc::F_WRLCK => libc::LOCK_EX,
            libc::F_UNLCK => libc::LOCK_UN,
            other => return Err(Error::InvalidArgument(format!("lock type {}", other))),
        };
        if !sleep {
            op |= libc::LOCK_NB;
        }
        let guard = self.descriptor.lock();
        let fd = guard.as_ref().ok_or_else(|| self.bad_handle())?;
        // SAFETY: fd is a live descriptor owned by this handle
        Errno::result(unsafe { libc::flock(fd.as_raw_fd(), op) })?;
        Ok(())
    }

    /// Close the handle. For the last writable handle on an upload this
    /// commits the version: final size, checksum (empty if invalidated),
    /// current flag, dedup and, for convertible types, a queued conversion.
    /// Returns the committed record, or `None` when nothing was committed.
    pub fn release(&self) -> Result<Option<FileRecord>> {
        let mut guard = self.descriptor.lock();
        let fd = guard.take().ok_or_else(|| self.bad_handle())?;
        let closed = close(fd.into_raw_fd());

        if !self.is_writable() {
            return closed.map(|_| None).map_err(Error::from);
        }
        if let Err(e) = closed {
            // the final size comes from the content store, not this descriptor
            warn!(path = %self.path, error = %e, "close failed, committing anyway");
        }

        let (known, remaining) = match self.services.known_files.detach(self.path.full()) {
            Some(found) => found,
            None => {
                error!(
                    path = %self.path,
                    file_id = self.file.id,
                    "writable handle released without a tracked upload"
                );
                return Err(Error::NotTracked(self.path.full().to_string()));
            }
        };

        if remaining > 0 {
            debug!(path = %self.path, remaining, "release with other writers still open");
            return Ok(None);
        }

        let result = self.commit(&known);
        if !self.services.known_files.remove_if_idle(&known) {
            debug!(path = %self.path, "upload re-opened during release, keeping it tracked");
        }
        result.map(Some)
    }

    fn commit(&self, known: &KnownFile) -> Result<FileRecord> {
        let file = known.file();
        let size = self.services.content.own_size_of(&file)?;
        let checksum = {
            let mut state = known.lock();
            if size != state.checksum.expected_offset() {
                state.checksum.invalidate();
            }
            state.checksum.hex_digest()
        };

        let release = Release {
            file_id: file.id,
            size,
            checksum,
            dedup: self.services.dedup,
        };
        let released = self
            .services
            .gateway
            .mark_file_released(&release)
            .map_err(|e| {
                error!(
                    path = %self.path,
                    project_id = ?self.path.project_id(),
                    user_id = ?self.path.user_id(),
                    op = "mark_file_released",
                    error = %e,
                    "failed to commit upload"
                );
                e
            })?;
        known.set_file(released.clone());

        debug!(
            path = %self.path,
            id = released.id,
            size = released.size,
            checksum = %released.checksum,
            "upload committed"
        );

        if released.is_convertible() {
            if let Err(e) = self.services.conversions.add_file_to_convert(&released) {
                warn!(
                    path = %self.path,
                    file_id = released.id,
                    error = %e,
                    "failed to queue conversion"
                );
            }
        }

        Ok(released)
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path.full())
            .field("flags", &self.flags)
            .field("file_id", &self.file.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_range_conversion() {
        let whole = LockRange {
            start: 0,
            end: u64::MAX,
            typ: libc::F_WRLCK,
            pid: 0,
        };
        assert!(whole.is_whole_file());
        let fl = whole.to_flock();
        assert_eq!(fl.l_len, 0);
        assert_eq!(LockRange::from_flock(&fl).end, u64::MAX);

        let part = LockRange {
            start: 10,
            end: 19,
            typ: libc::F_RDLCK,
            pid: 0,
        };
        assert!(!part.is_whole_file());
        let fl = part.to_flock();
        assert_eq!(fl.l_start, 10);
        assert_eq!(fl.l_len, 10);
        let back = LockRange::from_flock(&fl);
        assert_eq!((back.start, back.end, back.typ), (10, 19, libc::F_RDLCK));
    }
}
