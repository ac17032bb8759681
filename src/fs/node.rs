//! Filesystem nodes
//!
//! An [`FsNode`] is a virtual path plus the shared services. Nodes are
//! cheap and built on demand by a [`NodeFactory`]; all state lives in the
//! services, the metadata store and the content store.

use super::attr::{inode_for, NodeAttr, NodeKind};
use super::handle::FileHandle;
use super::services::BridgeServices;
use crate::error::{Error, Result};
use crate::metadata::{FileRecord, NewFileVersion, TransferRequest};
use crate::path::{join_path, PathKind, VirtualPath};
use crate::state::KnownFile;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: NodeKind,
}

/// Builds nodes sharing one set of services
#[derive(Clone)]
pub struct NodeFactory {
    services: Arc<BridgeServices>,
}

impl NodeFactory {
    pub fn new(services: Arc<BridgeServices>) -> Self {
        NodeFactory { services }
    }

    pub fn services(&self) -> &Arc<BridgeServices> {
        &self.services
    }

    pub fn root(&self) -> FsNode {
        self.node("/")
    }

    pub fn node(&self, path: &str) -> FsNode {
        FsNode {
            path: VirtualPath::parse(path),
            services: Arc::clone(&self.services),
        }
    }
}

/// A node of the virtual tree
pub struct FsNode {
    path: VirtualPath,
    services: Arc<BridgeServices>,
}

impl FsNode {
    pub fn path(&self) -> &VirtualPath {
        &self.path
    }

    pub fn ino(&self) -> u64 {
        inode_for(self.path.full())
    }

    pub fn child(&self, name: &str) -> FsNode {
        FsNode {
            path: self.path.join(name),
            services: Arc::clone(&self.services),
        }
    }

    fn dir_attr(&self, mtime: SystemTime) -> NodeAttr {
        NodeAttr::directory(self.ino(), self.services.dir_mode, mtime)
    }

    /// (project, user) for paths at or below the user base
    fn ids(&self) -> Result<(i64, i64)> {
        match self.path.kind() {
            PathKind::BadId(token) => Err(Error::BadId(token.clone())),
            _ => self
                .path
                .ids()
                .ok_or_else(|| Error::PermissionDenied(self.path.full().to_string())),
        }
    }

    fn transfer(&self) -> Result<TransferRequest> {
        let (project_id, user_id) = self.ids()?;
        self.services.gateway.find_transfer_request(project_id, user_id)
    }

    /// Lookup failures all surface as ENOENT; the cause is only logged
    fn not_found(&self, op: &'static str, e: Error) -> Error {
        match e {
            Error::NotFound(_) => e,
            other => {
                warn!(
                    path = %self.path,
                    project_id = ?self.path.project_id(),
                    user_id = ?self.path.user_id(),
                    op,
                    error = %other,
                    "lookup failed"
                );
                Error::NotFound(self.path.full().to_string())
            }
        }
    }

    /// Attributes of this node
    pub fn getattr(&self) -> Result<NodeAttr> {
        self.resolve_attr().map_err(|e| self.not_found("getattr", e))
    }

    fn resolve_attr(&self) -> Result<NodeAttr> {
        let now = SystemTime::now();
        match self.path.kind() {
            PathKind::Root => Ok(self.dir_attr(now)),
            PathKind::BadId(token) => Err(Error::NotFound(format!("bad id {}", token))),
            PathKind::ProjectBase => {
                let project_id = self.path.project_id();
                let active = self
                    .services
                    .gateway
                    .list_transfer_requests()?
                    .iter()
                    .any(|t| Some(t.project_id) == project_id);
                if active {
                    Ok(self.dir_attr(now))
                } else {
                    Err(Error::NotFound(self.path.full().to_string()))
                }
            }
            PathKind::UserBase => {
                self.transfer()?;
                Ok(self.dir_attr(now))
            }
            PathKind::Complete => {
                if let Some(known) = self.services.known_files.get(self.path.full()) {
                    let meta = std::fs::metadata(self.services.content.own_path_for(&known.file())?)?;
                    return Ok(NodeAttr::from_metadata(self.ino(), self.services.file_mode, &meta));
                }

                let (project_id, _) = self.ids()?;
                let record = self
                    .services
                    .gateway
                    .find_file(project_id, self.path.relative())?;
                Ok(self.record_attr(&record))
            }
        }
    }

    fn record_attr(&self, record: &FileRecord) -> NodeAttr {
        let mtime: SystemTime = record.updated_at.into();
        if record.is_dir() {
            return self.dir_attr(mtime);
        }
        match self.services.content.metadata(record) {
            Ok(meta) => NodeAttr::from_metadata(self.ino(), self.services.file_mode, &meta),
            Err(_) => NodeAttr::file(self.ino(), self.services.file_mode, record.size, mtime),
        }
    }

    /// Child node and its attributes
    pub fn lookup(&self, name: &str) -> Result<(FsNode, NodeAttr)> {
        debug!("lookup(parent={}, name={:?})", self.path, name);
        let child = self.child(name);
        let attr = child.getattr()?;
        Ok((child, attr))
    }

    /// Directory listing. Below the user base, in-flight uploads are merged
    /// into the persisted listing and win on a name collision.
    pub fn readdir(&self) -> Result<Vec<DirEntry>> {
        match self.path.kind() {
            PathKind::BadId(token) => Err(Error::NotFound(format!("bad id {}", token))),
            PathKind::Root => {
                let projects: BTreeSet<i64> = self
                    .services
                    .gateway
                    .list_transfer_requests()?
                    .into_iter()
                    .map(|t| t.project_id)
                    .collect();
                Ok(projects
                    .into_iter()
                    .map(|p| self.dir_entry(p.to_string(), NodeKind::Directory))
                    .collect())
            }
            PathKind::ProjectBase => {
                let project_id = self.path.project_id();
                let users: BTreeSet<i64> = self
                    .services
                    .gateway
                    .list_transfer_requests()?
                    .into_iter()
                    .filter(|t| Some(t.project_id) == project_id)
                    .map(|t| t.owner_id)
                    .collect();
                Ok(users
                    .into_iter()
                    .map(|u| self.dir_entry(u.to_string(), NodeKind::Directory))
                    .collect())
            }
            PathKind::UserBase | PathKind::Complete => self.list_project_directory(),
        }
    }

    fn list_project_directory(&self) -> Result<Vec<DirEntry>> {
        let (project_id, _) = self.ids()?;
        let transfer = self.transfer()?;
        let dir = self
            .services
            .gateway
            .find_directory(project_id, self.path.relative())
            .map_err(|e| match e {
                Error::NotFound(_) if self.is_file() => {
                    Error::NotADirectory(self.path.full().to_string())
                }
                other => other,
            })?;

        let mut merged: BTreeMap<String, DirEntry> = BTreeMap::new();
        for record in self.services.gateway.list_directory(&dir, &transfer)? {
            let kind = if record.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            };
            let entry = self.dir_entry(record.name, kind);
            merged.insert(entry.name.clone(), entry);
        }

        for known in self.services.known_files.in_directory(self.path.full()) {
            if let Some(name) = known.path().file_name() {
                let entry = self.dir_entry(name.to_string(), NodeKind::File);
                merged.insert(entry.name.clone(), entry);
            }
        }

        Ok(merged.into_values().collect())
    }

    fn is_file(&self) -> bool {
        self.path
            .project_id()
            .and_then(|p| self.services.gateway.find_file(p, self.path.relative()).ok())
            .map(|f| !f.is_dir())
            .unwrap_or(false)
    }

    fn dir_entry(&self, name: String, kind: NodeKind) -> DirEntry {
        DirEntry {
            ino: inode_for(&join_path(self.path.full(), &name)),
            name,
            kind,
        }
    }

    /// Create `name` in this directory and open it for writing
    pub fn create(&self, name: &str, flags: i32) -> Result<(FsNode, FileHandle)> {
        debug!("create(parent={}, name={:?}, flags={:#o})", self.path, name, flags);
        let child = self.child(name);
        if *child.path.kind() != PathKind::Complete {
            return Err(child.ids().err().unwrap_or_else(|| {
                Error::PermissionDenied(child.path.full().to_string())
            }));
        }
        if self.services.known_files.contains(child.path.full()) {
            return Err(Error::AlreadyExists(child.path.full().to_string()));
        }

        let (known, descriptor) = child.new_version(flags)?;
        let known = match self.services.known_files.insert_new(Arc::clone(&known)) {
            Ok(known) => known,
            Err(e) => {
                debug!(path = %child.path, "lost create race");
                drop(descriptor);
                child.discard_version(&known.file());
                return Err(e);
            }
        };

        let handle = FileHandle::new(
            Arc::clone(&self.services),
            child.path.clone(),
            known.file(),
            descriptor,
            flags,
        );
        Ok((child, handle))
    }

    /// Record a fresh version of this path and create its physical file
    fn new_version(&self, flags: i32) -> Result<(Arc<KnownFile>, std::fs::File)> {
        let (project_id, user_id) = self.ids()?;
        let transfer = self.transfer()?;
        let name = self
            .path
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(self.path.full().to_string()))?
            .to_string();
        let dir = self
            .services
            .gateway
            .find_directory(project_id, &self.path.parent_relative())?;

        let file = self.services.gateway.create_file_version(&NewFileVersion {
            project_id,
            owner_id: user_id,
            directory_id: dir.id,
            name,
            transfer_request_id: transfer.id,
        })?;
        let descriptor = match self
            .services
            .content
            .create_version(&file, flags & !libc::O_APPEND)
        {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.discard_version(&file);
                return Err(e);
            }
        };

        let known = Arc::new(KnownFile::new(self.path.clone(), file, transfer));
        Ok((known, descriptor))
    }

    /// Open this file. Read-only opens need an existing version; writable
    /// opens join the in-flight upload or start a new version.
    pub fn open(&self, flags: i32) -> Result<FileHandle> {
        debug!("open(path={}, flags={:#o})", self.path, flags);
        if *self.path.kind() != PathKind::Complete {
            return Err(Error::IsADirectory(self.path.full().to_string()));
        }

        let accmode = flags & libc::O_ACCMODE;
        if accmode == libc::O_RDONLY {
            return self.open_readonly(flags);
        }

        if let Some(known) = self.services.known_files.attach(self.path.full()) {
            return self.open_known(known, flags);
        }

        let (fresh, descriptor) = self.new_version(flags)?;
        let known = self.services.known_files.insert_or_attach(Arc::clone(&fresh));
        if Arc::ptr_eq(&known, &fresh) {
            return Ok(FileHandle::new(
                Arc::clone(&self.services),
                self.path.clone(),
                known.file(),
                descriptor,
                flags,
            ));
        }

        // another opener registered first, write to its version instead
        drop(descriptor);
        self.discard_version(&fresh.file());
        self.open_known(known, flags)
    }

    /// Drop a version nobody will write: its record, tracking row and bytes
    fn discard_version(&self, file: &FileRecord) {
        if let Err(e) = self.services.gateway.discard_file_version(file.id) {
            warn!(path = %self.path, file_id = file.id, error = %e, "failed to discard version");
            return;
        }
        if let Err(e) = self.services.content.remove_version(file) {
            warn!(path = %self.path, file_id = file.id, error = %e, "failed to remove physical file");
        }
    }

    fn open_readonly(&self, flags: i32) -> Result<FileHandle> {
        let record = match self.services.known_files.get(self.path.full()) {
            Some(known) => known.file(),
            None => {
                let (project_id, _) = self.ids()?;
                self.services
                    .gateway
                    .find_file(project_id, self.path.relative())?
            }
        };
        if record.is_dir() {
            return Err(Error::IsADirectory(self.path.full().to_string()));
        }

        let descriptor = self.services.content.open(&record, flags)?;
        Ok(FileHandle::new(
            Arc::clone(&self.services),
            self.path.clone(),
            record,
            descriptor,
            flags,
        ))
    }

    fn open_known(&self, known: Arc<KnownFile>, flags: i32) -> Result<FileHandle> {
        let file = known.file();
        match self.services.content.open(&file, flags) {
            Ok(descriptor) => Ok(FileHandle::new(
                Arc::clone(&self.services),
                self.path.clone(),
                file,
                descriptor,
                flags,
            )),
            Err(e) => {
                // undo the attach so the upload can still be finalized
                if let Some((known, 0)) = self.services.known_files.detach(self.path.full()) {
                    self.services.known_files.remove_if_idle(&known);
                }
                Err(e)
            }
        }
    }

    /// Create directory `name`; an existing directory is returned as is
    pub fn mkdir(&self, name: &str) -> Result<(FsNode, NodeAttr)> {
        debug!("mkdir(parent={}, name={:?})", self.path, name);
        let child = self.child(name);
        if *child.path.kind() != PathKind::Complete {
            return Err(child.ids().err().unwrap_or_else(|| {
                Error::PermissionDenied(child.path.full().to_string())
            }));
        }
        let (project_id, user_id) = child.ids()?;

        let parent = self
            .services
            .gateway
            .find_directory(project_id, self.path.relative())?;
        let dir = self.services.gateway.create_directory(
            project_id,
            user_id,
            &parent,
            child.path.relative(),
        )?;

        let attr = child.dir_attr(dir.updated_at.into());
        Ok((child, attr))
    }

    /// Only size changes are applied; everything else is accepted and ignored
    pub fn setattr(&self, size: Option<u64>, handle: Option<&FileHandle>) -> Result<NodeAttr> {
        if let Some(size) = size {
            match handle {
                Some(handle) if handle.is_writable() => {
                    return handle.truncate(size);
                }
                _ => {
                    let known = self
                        .services
                        .known_files
                        .get(self.path.full())
                        .ok_or_else(|| Error::NotFound(self.path.full().to_string()))?;
                    let mut state = known.lock();
                    self.services.content.truncate(&state.file, size)?;
                    state.checksum.truncate(size);
                }
            }
        }
        self.getattr()
    }

    pub fn rename(&self, _name: &str, _new_parent: &FsNode, _new_name: &str) -> Result<()> {
        Err(Error::PermissionDenied(format!("rename in {}", self.path)))
    }

    pub fn unlink(&self, _name: &str) -> Result<()> {
        Err(Error::PermissionDenied(format!("unlink in {}", self.path)))
    }

    pub fn rmdir(&self, _name: &str) -> Result<()> {
        Err(Error::PermissionDenied(format!("rmdir in {}", self.path)))
    }
}

impl std::fmt::Debug for FsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsNode")
            .field("path", &self.path.full())
            .finish()
    }
}
