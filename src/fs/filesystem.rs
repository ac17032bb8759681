//! FUSE adapter
//!
//! Translates kernel requests into node and handle operations. Inodes are
//! hashes of full virtual paths, remembered here so later requests can be
//! mapped back to a path; open handles live in a table keyed by fh.
//! Requests that block on the store or the disk run on a worker pool.

use super::attr::{inode_for, NodeAttr, ROOT_INO};
use super::handle::{FileHandle, LockRange};
use super::node::{FsNode, NodeFactory};
use super::services::BridgeServices;
use super::workers::WorkerPool;
use crate::path::parent_of;
use dashmap::DashMap;
use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLock, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

const TTL: Duration = Duration::from_secs(1);

/// FUSE filesystem bridging onto the project store
pub struct BridgeFs {
    state: Arc<FsState>,
    workers: WorkerPool,
}

/// Tables shared between the session thread and the workers
struct FsState {
    factory: NodeFactory,
    /// inode -> full virtual path
    inodes: DashMap<u64, String>,
    /// fh -> open handle
    handles: DashMap<u64, Arc<FileHandle>>,
    next_fh: AtomicU64,
}

impl BridgeFs {
    pub fn new(services: Arc<BridgeServices>, workers: usize) -> std::io::Result<Self> {
        let inodes = DashMap::new();
        inodes.insert(ROOT_INO, "/".to_string());
        let state = FsState {
            factory: NodeFactory::new(services),
            inodes,
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        };
        Ok(BridgeFs {
            state: Arc::new(state),
            workers: WorkerPool::new(workers)?,
        })
    }

    pub fn services(&self) -> &Arc<BridgeServices> {
        self.state.factory.services()
    }

    /// Run `f` against the shared tables on a worker thread
    fn spawn<F>(&self, f: F)
    where
        F: FnOnce(&FsState) + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        self.workers.execute(move || f(&state));
    }
}

impl FsState {
    fn services(&self) -> &Arc<BridgeServices> {
        self.factory.services()
    }

    fn node(&self, ino: u64) -> Option<FsNode> {
        self.inodes.get(&ino).map(|path| self.factory.node(path.value()))
    }

    fn remember(&self, node: &FsNode) {
        self.inodes
            .insert(node.ino(), node.path().full().to_string());
    }

    fn handle(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.get(&fh).map(|h| Arc::clone(h.value()))
    }

    fn register_handle(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(fh, Arc::new(handle));
        fh
    }

    fn attr(&self, attr: &NodeAttr) -> FileAttr {
        let services = self.services();
        attr.to_fuser(services.uid, services.gid)
    }

    /// Parent node and UTF-8 child name, or the errno to reply with
    fn parent_and_name(&self, parent: u64, name: &OsStr) -> Result<(FsNode, String), i32> {
        let node = self.node(parent).ok_or(ENOENT)?;
        let name = name.to_str().ok_or(EINVAL)?;
        Ok((node, name.to_string()))
    }
}

impl Filesystem for BridgeFs {
    fn destroy(&mut self) {
        info!(open_handles = self.state.handles.len(), "unmounting");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let state = &self.state;
        let (node, name) = match state.parent_and_name(parent, name) {
            Ok(found) => found,
            Err(errno) => return reply.error(errno),
        };

        match node.lookup(&name) {
            Ok((child, attr)) => {
                state.remember(&child);
                reply.entry(&TTL, &state.attr(&attr), 0);
            }
            Err(_) => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.state.node(ino).map(|n| n.getattr()) {
            Some(Ok(attr)) => reply.attr(&TTL, &self.state.attr(&attr)),
            _ => reply.error(ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, size={:?}, fh={:?})", ino, size, fh);

        self.spawn(move |state| {
            let node = match state.node(ino) {
                Some(n) => n,
                None => return reply.error(ENOENT),
            };
            let handle = fh.and_then(|fh| state.handle(fh));

            match node.setattr(size, handle.as_deref()) {
                Ok(attr) => reply.attr(&TTL, &state.attr(&attr)),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);

        let (node, name) = match self.state.parent_and_name(parent, name) {
            Ok(found) => found,
            Err(errno) => return reply.error(errno),
        };

        self.spawn(move |state| match node.mkdir(&name) {
            Ok((child, attr)) => {
                state.remember(&child);
                reply.entry(&TTL, &state.attr(&attr), 0);
            }
            Err(e) => {
                error!(parent = %node.path(), name = %name, error = %e, "mkdir failed");
                reply.error(e.errno());
            }
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        match self.state.parent_and_name(parent, name) {
            Ok((node, name)) => match node.unlink(&name) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        match self.state.parent_and_name(parent, name) {
            Ok((node, name)) => match node.rmdir(&name) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let (node, name) = match self.state.parent_and_name(parent, name) {
            Ok(found) => found,
            Err(errno) => return reply.error(errno),
        };
        let (new_parent, new_name) = match self.state.parent_and_name(newparent, newname) {
            Ok(found) => found,
            Err(errno) => return reply.error(errno),
        };
        match node.rename(&name, &new_parent, &new_name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);

        let node = match self.state.node(ino) {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };

        self.spawn(move |state| match node.open(flags) {
            Ok(handle) => {
                let fh = state.register_handle(handle);
                reply.opened(fh, 0);
            }
            Err(e) => {
                debug!(path = %node.path(), error = %e, "open failed");
                reply.error(e.errno());
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, flags={:#o})", parent, name, flags);

        let (node, name) = match self.state.parent_and_name(parent, name) {
            Ok(found) => found,
            Err(errno) => return reply.error(errno),
        };

        self.spawn(move |state| {
            let (child, handle) = match node.create(&name, flags) {
                Ok(created) => created,
                Err(e) => {
                    debug!(parent = %node.path(), name = %name, error = %e, "create failed");
                    return reply.error(e.errno());
                }
            };

            let attr = match handle.getattr() {
                Ok(attr) => attr,
                Err(e) => return reply.error(e.errno()),
            };
            state.remember(&child);
            let fh = state.register_handle(handle);
            reply.created(&TTL, &state.attr(&attr), 0, fh, 0);
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let handle = match self.state.handle(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        if offset < 0 {
            return reply.error(EINVAL);
        }

        self.workers.execute(move || match handle.read(offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let handle = match self.state.handle(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        if offset < 0 {
            return reply.error(EINVAL);
        }

        let data = data.to_vec();
        self.workers.execute(move || match handle.write(&data, offset as u64) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        match self.state.handle(fh).map(|h| h.flush()) {
            Some(Ok(())) => reply.ok(),
            Some(Err(e)) => reply.error(e.errno()),
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        let handle = match self.state.handles.remove(&fh) {
            Some((_, h)) => h,
            None => return reply.error(libc::EBADF),
        };

        self.workers.execute(move || match handle.release() {
            Ok(_) => reply.ok(),
            Err(e) => {
                error!(path = %handle.path(), error = %e, "release failed");
                reply.error(e.errno());
            }
        });
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        let handle = match self.state.handle(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        self.workers.execute(move || match handle.fsync(datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let node = match self.state.node(ino) {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };

        self.spawn(move |state| {
            let listing = match node.readdir() {
                Ok(listing) => listing,
                Err(e) => return reply.error(e.errno()),
            };

            let parent_ino = inode_for(&parent_of(node.path().full()));
            let mut entries: Vec<(u64, fuser::FileType, String)> = vec![
                (ino, fuser::FileType::Directory, ".".to_string()),
                (parent_ino, fuser::FileType::Directory, "..".to_string()),
            ];
            for entry in listing {
                state
                    .inodes
                    .insert(entry.ino, node.path().join(&entry.name).full().to_string());
                entries.push((entry.ino, entry.kind.to_fuser(), entry.name));
            }

            for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
                let buffer_full = reply.add(*child_ino, (i + 1) as i64, *kind, name);
                if buffer_full {
                    break;
                }
            }

            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.services().content.statvfs() {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        debug!("getlk(ino={}, fh={}, start={}, end={}, typ={})", ino, fh, start, end, typ);
        let handle = match self.state.handle(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        match handle.getlk(LockRange { start, end, typ, pid }) {
            Ok(lock) => reply.locked(lock.start, lock.end, lock.typ, lock.pid),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        debug!("setlk(ino={}, fh={}, start={}, end={}, typ={}, sleep={})", ino, fh, start, end, typ, sleep);
        let handle = match self.state.handle(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };

        // a sleeping lock can wait indefinitely, keep it off the session thread
        self.workers.execute(move || {
            let lock = LockRange { start, end, typ, pid };
            // whole-file requests map onto flock, byte ranges onto OFD locks
            let result = if lock.is_whole_file() {
                handle.flock(typ, sleep)
            } else {
                handle.setlk(lock, sleep)
            };
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn lseek(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        debug!("lseek(ino={}, fh={}, offset={}, whence={})", ino, fh, offset, whence);
        match self.state.handle(fh).map(|h| h.lseek(offset, whence)) {
            Some(Ok(pos)) => reply.offset(pos),
            Some(Err(e)) => reply.error(e.errno()),
            None => reply.error(libc::EBADF),
        }
    }
}
