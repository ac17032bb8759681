//! Registry of in-flight uploads
//!
//! A [`KnownFile`] exists from the create (or first writable open) of a path
//! until the last writable handle on it is released. The registry is keyed
//! by full virtual path and sharded, so a lookup never waits on another
//! path's I/O.

use crate::content::RunningChecksum;
use crate::error::{Error, Result};
use crate::metadata::{FileRecord, TransferRequest};
use crate::path::VirtualPath;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Mutable part of a known file
#[derive(Debug)]
pub struct KnownFileState {
    /// Version being written
    pub file: FileRecord,
    /// Digest of the bytes written so far
    pub checksum: RunningChecksum,
}

/// A version currently being uploaded
#[derive(Debug)]
pub struct KnownFile {
    path: VirtualPath,
    transfer: TransferRequest,
    open_handles: AtomicU32,
    state: Mutex<KnownFileState>,
}

impl KnownFile {
    /// New known file owned by one writable handle
    pub fn new(path: VirtualPath, file: FileRecord, transfer: TransferRequest) -> Self {
        KnownFile {
            path,
            transfer,
            open_handles: AtomicU32::new(1),
            state: Mutex::new(KnownFileState {
                file,
                checksum: RunningChecksum::new(),
            }),
        }
    }

    pub fn path(&self) -> &VirtualPath {
        &self.path
    }

    pub fn transfer(&self) -> &TransferRequest {
        &self.transfer
    }

    /// Snapshot of the version record
    pub fn file(&self) -> FileRecord {
        self.state.lock().file.clone()
    }

    pub fn set_file(&self, file: FileRecord) {
        self.state.lock().file = file;
    }

    pub fn lock(&self) -> MutexGuard<'_, KnownFileState> {
        self.state.lock()
    }

    pub fn open_handles(&self) -> u32 {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Count one more writable handle, unless the last one already left and
    /// the version is being committed
    fn join(&self) -> bool {
        self.open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    /// Still accepting writers
    pub fn is_live(&self) -> bool {
        self.open_handles() > 0
    }
}

/// Concurrent map of virtual path to in-flight upload
#[derive(Debug, Default)]
pub struct KnownFilesTracker {
    files: DashMap<String, Arc<KnownFile>>,
}

impl KnownFilesTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional upsert
    pub fn store(&self, known: Arc<KnownFile>) {
        self.files.insert(known.path().full().to_string(), known);
    }

    pub fn get(&self, path: &str) -> Option<Arc<KnownFile>> {
        self.files.get(path).map(|entry| Arc::clone(entry.value()))
    }

    pub fn delete(&self, path: &str) -> Option<Arc<KnownFile>> {
        self.files.remove(path).map(|(_, known)| known)
    }

    /// Whether an upload still accepting writers is tracked at `path`
    pub fn contains(&self, path: &str) -> bool {
        self.files
            .get(path)
            .map(|entry| entry.value().is_live())
            .unwrap_or(false)
    }

    /// Insert a fresh known file, failing if the path is already tracked.
    /// A file whose last writer left is being committed and gets replaced.
    pub fn insert_new(&self, known: Arc<KnownFile>) -> Result<Arc<KnownFile>> {
        match self.files.entry(known.path().full().to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => {
                Err(Error::AlreadyExists(entry.key().clone()))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Arc::clone(&known));
                Ok(known)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&known));
                Ok(known)
            }
        }
    }

    /// Insert `known`, or join the file another opener registered first
    pub fn insert_or_attach(&self, known: Arc<KnownFile>) -> Arc<KnownFile> {
        match self.files.entry(known.path().full().to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = Arc::clone(entry.get());
                if existing.join() {
                    existing
                } else {
                    entry.insert(Arc::clone(&known));
                    known
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&known));
                known
            }
        }
    }

    /// Register one more writable handle on a tracked path. Files being
    /// committed are not joined.
    pub fn attach(&self, path: &str) -> Option<Arc<KnownFile>> {
        let entry = self.files.get(path)?;
        if entry.value().join() {
            Some(Arc::clone(entry.value()))
        } else {
            None
        }
    }

    /// Drop one writable handle, returning the file and the handles left on it
    pub fn detach(&self, path: &str) -> Option<(Arc<KnownFile>, u32)> {
        let entry = self.files.get(path)?;
        let remaining = entry
            .open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0);
        Some((Arc::clone(entry.value()), remaining))
    }

    /// Remove `known` if it is still the tracked file for its path and no
    /// handle re-attached meanwhile
    pub fn remove_if_idle(&self, known: &Arc<KnownFile>) -> bool {
        self.files
            .remove_if(known.path().full(), |_, current| {
                Arc::ptr_eq(current, known) && current.open_handles() == 0
            })
            .is_some()
    }

    /// In-flight files whose parent is `dir` (a full virtual path)
    pub fn in_directory(&self, dir: &str) -> Vec<Arc<KnownFile>> {
        self.files
            .iter()
            .filter(|entry| entry.value().path().parent_full() == dir)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
