//! sled-backed metadata store
//!
//! Reference implementation of [`PersistenceGateway`] and
//! [`ConversionQueue`]. Every multi-row mutation runs in one sled
//! transaction over exact-key indexes:
//!
//! - `files`: record id -> [`FileRecord`]
//! - `dir_paths`: `{project}:{path}` -> directory id
//! - `entries`: directory id ++ name -> versions of that name
//! - `transfer_requests` / `transfer_keys`: id -> request, `{project}:{user}` -> id
//! - `transfer_files`: file id -> [`TransferRequestFile`]
//! - `projects`: project id -> [`ProjectStats`]
//! - `checksums`: scoped checksum key -> id of the record owning those bytes
//! - `conversions`: id -> [`Conversion`]

use super::gateway::{ConversionQueue, NewFileVersion, PersistenceGateway, Release};
use super::record::{
    Conversion, FileRecord, ProjectStats, TransferRequest, TransferRequestFile, TransferState,
};
use crate::content::dedup;
use crate::error::{Error, Result};
use crate::path::parent_of;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::transaction::{TransactionalTree, Transactional};
use sled::Tree;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

type TxResult<T> = ConflictableTransactionResult<T, Error>;

/// Every version ever created for one (directory, name)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EntryIndex {
    versions: Vec<u64>,
    current: Option<u64>,
}

/// Metadata database
#[derive(Clone)]
pub struct MetadataStore {
    db: sled::Db,
    files: Tree,
    dir_paths: Tree,
    entries: Tree,
    transfer_requests: Tree,
    transfer_keys: Tree,
    transfer_files: Tree,
    projects: Tree,
    checksums: Tree,
    conversions: Tree,
}

impl MetadataStore {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening metadata store at {:?}", path.as_ref());
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway database, removed on drop
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(MetadataStore {
            files: db.open_tree("files")?,
            dir_paths: db.open_tree("dir_paths")?,
            entries: db.open_tree("entries")?,
            transfer_requests: db.open_tree("transfer_requests")?,
            transfer_keys: db.open_tree("transfer_keys")?,
            transfer_files: db.open_tree("transfer_files")?,
            projects: db.open_tree("projects")?,
            checksums: db.open_tree("checksums")?,
            conversions: db.open_tree("conversions")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn next_id(&self) -> Result<u64> {
        // sled ids start at zero, which never names a record
        Ok(self.db.generate_id()? + 1)
    }

    /// Record by id
    pub fn get_file(&self, id: u64) -> Result<FileRecord> {
        load(&self.files, &id.to_be_bytes())?
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))
    }

    /// Root directory of `project_id`, created on first use
    pub fn ensure_project_root(&self, project_id: i64, owner_id: i64) -> Result<FileRecord> {
        match self.find_directory(project_id, "/") {
            Ok(root) => Ok(root),
            Err(Error::NotFound(_)) => self.insert_directory(project_id, owner_id, None, "/"),
            Err(e) => Err(e),
        }
    }

    /// Open a transfer request for (project, user), reusing an open one
    pub fn open_transfer_request(&self, project_id: i64, user_id: i64) -> Result<TransferRequest> {
        if let Ok(existing) = self.find_transfer_request(project_id, user_id) {
            return Ok(existing);
        }

        self.ensure_project_root(project_id, user_id)?;

        let request = TransferRequest::new(self.next_id()?, project_id, user_id);
        let key = transfer_key(project_id, user_id);
        (&self.transfer_requests, &self.transfer_keys).transaction(
            |(requests, keys)| -> TxResult<()> {
                tx_store(requests, &request.id.to_be_bytes(), &request)?;
                keys.insert(key.as_bytes(), &request.id.to_be_bytes()[..])?;
                Ok(())
            },
        )?;

        info!(
            project_id,
            user_id,
            transfer_request_id = request.id,
            "opened transfer request"
        );
        Ok(request)
    }

    /// Close the open transfer request for (project, user)
    pub fn close_transfer_request(&self, project_id: i64, user_id: i64) -> Result<TransferRequest> {
        let mut request = self.find_transfer_request(project_id, user_id)?;
        request.state = TransferState::Closed;
        request.updated_at = Utc::now();

        let key = transfer_key(project_id, user_id);
        (&self.transfer_requests, &self.transfer_keys).transaction(
            |(requests, keys)| -> TxResult<()> {
                tx_store(requests, &request.id.to_be_bytes(), &request)?;
                keys.remove(key.as_bytes())?;
                Ok(())
            },
        )?;

        info!(project_id, user_id, "closed transfer request");
        Ok(request)
    }

    /// Aggregate counters for a project
    pub fn project_stats(&self, project_id: i64) -> Result<ProjectStats> {
        Ok(load(&self.projects, &project_id.to_be_bytes())?.unwrap_or(ProjectStats {
            project_id,
            ..Default::default()
        }))
    }

    /// Queued conversions, oldest first
    pub fn list_conversions(&self) -> Result<Vec<Conversion>> {
        self.conversions
            .iter()
            .values()
            .map(|value| decode(&value?))
            .collect()
    }

    /// Tracking row of a file version
    pub fn transfer_file(&self, file_id: u64) -> Result<Option<TransferRequestFile>> {
        load(&self.transfer_files, &file_id.to_be_bytes())
    }

    /// Every version id of `name` in `dir_id`, oldest first
    pub fn versions(&self, dir_id: u64, name: &str) -> Result<Vec<u64>> {
        Ok(load::<EntryIndex>(&self.entries, &entry_key(dir_id, name))?
            .map(|index| index.versions)
            .unwrap_or_default())
    }

    fn insert_directory(
        &self,
        project_id: i64,
        owner_id: i64,
        parent: Option<&FileRecord>,
        path: &str,
    ) -> Result<FileRecord> {
        let candidate =
            FileRecord::new_directory(self.next_id()?, project_id, owner_id, parent.map(|p| p.id), path);
        let key = dir_path_key(project_id, path);

        let record = (&self.files, &self.dir_paths, &self.entries, &self.projects).transaction(
            |(files, dir_paths, entries, projects)| -> TxResult<FileRecord> {
                if let Some(existing) = dir_paths.get(key.as_bytes())? {
                    let id = abort(read_id(&existing))?;
                    return tx_load(files, &id.to_be_bytes())?.ok_or_else(|| {
                        ConflictableTransactionError::Abort(Error::Internal(format!(
                            "directory index points at missing record {}",
                            id
                        )))
                    });
                }

                if let Some(parent_id) = candidate.directory_id {
                    let ekey = entry_key(parent_id, &candidate.name);
                    let mut index: EntryIndex = tx_load(entries, &ekey)?.unwrap_or_default();
                    if index.current.is_some() {
                        return Err(ConflictableTransactionError::Abort(Error::AlreadyExists(
                            path.to_string(),
                        )));
                    }
                    index.versions.push(candidate.id);
                    index.current = Some(candidate.id);
                    tx_store(entries, &ekey, &index)?;
                }

                tx_store(files, &candidate.id.to_be_bytes(), &candidate)?;
                dir_paths.insert(key.as_bytes(), &candidate.id.to_be_bytes()[..])?;

                let mut stats: ProjectStats = tx_load(projects, &project_id.to_be_bytes())?
                    .unwrap_or(ProjectStats {
                        project_id,
                        ..Default::default()
                    });
                stats.directory_count += 1;
                tx_store(projects, &project_id.to_be_bytes(), &stats)?;

                Ok(candidate.clone())
            },
        )?;

        debug!(project_id, path, id = record.id, "directory ready");
        Ok(record)
    }
}

impl PersistenceGateway for MetadataStore {
    fn find_directory(&self, project_id: i64, path: &str) -> Result<FileRecord> {
        let id = self
            .dir_paths
            .get(dir_path_key(project_id, path).as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("directory {}:{}", project_id, path)))?;
        self.get_file(read_id(&id)?)
    }

    fn create_directory(
        &self,
        project_id: i64,
        owner_id: i64,
        parent: &FileRecord,
        path: &str,
    ) -> Result<FileRecord> {
        if !parent.is_dir() {
            return Err(Error::NotADirectory(parent.name.clone()));
        }
        self.insert_directory(project_id, owner_id, Some(parent), path)
    }

    fn find_file(&self, project_id: i64, path: &str) -> Result<FileRecord> {
        if path == "/" {
            return self.find_directory(project_id, path);
        }

        let name = path.rsplit('/').next().unwrap_or(path);
        let dir = self.find_directory(project_id, &parent_of(path))?;
        let index: EntryIndex = load(&self.entries, &entry_key(dir.id, name))?
            .ok_or_else(|| Error::NotFound(format!("{}:{}", project_id, path)))?;
        match index.current {
            Some(id) => self.get_file(id),
            None => Err(Error::NotFound(format!("{}:{}", project_id, path))),
        }
    }

    fn create_file_version(&self, version: &NewFileVersion) -> Result<FileRecord> {
        let record = FileRecord::new_file(
            self.next_id()?,
            version.project_id,
            version.owner_id,
            version.directory_id,
            &version.name,
        );
        let tracking = TransferRequestFile {
            id: self.next_id()?,
            uuid: Uuid::new_v4().to_string(),
            transfer_request_id: version.transfer_request_id,
            project_id: version.project_id,
            owner_id: version.owner_id,
            directory_id: version.directory_id,
            file_id: record.id,
            name: version.name.clone(),
            state: TransferState::Open,
        };

        (&self.files, &self.entries, &self.transfer_files).transaction(
            |(files, entries, transfer_files)| -> TxResult<()> {
                let dir: FileRecord = tx_load(files, &version.directory_id.to_be_bytes())?
                    .ok_or_else(|| {
                        ConflictableTransactionError::Abort(Error::NotFound(format!(
                            "directory {}",
                            version.directory_id
                        )))
                    })?;
                if !dir.is_dir() {
                    return Err(ConflictableTransactionError::Abort(Error::NotADirectory(
                        dir.name,
                    )));
                }

                let ekey = entry_key(version.directory_id, &version.name);
                let mut index: EntryIndex = tx_load(entries, &ekey)?.unwrap_or_default();
                if let Some(current) = index.current {
                    let existing: Option<FileRecord> = tx_load(files, &current.to_be_bytes())?;
                    if existing.map(|f| f.is_dir()).unwrap_or(false) {
                        return Err(ConflictableTransactionError::Abort(Error::IsADirectory(
                            version.name.clone(),
                        )));
                    }
                }
                index.versions.push(record.id);

                tx_store(files, &record.id.to_be_bytes(), &record)?;
                tx_store(entries, &ekey, &index)?;
                tx_store(transfer_files, &record.id.to_be_bytes(), &tracking)?;
                Ok(())
            },
        )?;

        debug!(
            id = record.id,
            uuid = %record.uuid,
            name = %record.name,
            "created file version"
        );
        Ok(record)
    }

    fn discard_file_version(&self, file_id: u64) -> Result<()> {
        let key = file_id.to_be_bytes();
        (&self.files, &self.entries, &self.transfer_files).transaction(
            |(files, entries, transfer_files)| -> TxResult<()> {
                let file: Option<FileRecord> = tx_load(files, &key)?;
                let Some(file) = file else {
                    return Ok(());
                };
                if file.current || file.is_dir() {
                    return Err(ConflictableTransactionError::Abort(Error::InvalidArgument(
                        format!("file {} is visible and cannot be discarded", file_id),
                    )));
                }

                if let Some(dir_id) = file.directory_id {
                    let ekey = entry_key(dir_id, &file.name);
                    let index: Option<EntryIndex> = tx_load(entries, &ekey)?;
                    if let Some(mut index) = index {
                        index.versions.retain(|v| *v != file_id);
                        if index.versions.is_empty() {
                            entries.remove(ekey.as_slice())?;
                        } else {
                            tx_store(entries, &ekey, &index)?;
                        }
                    }
                }

                files.remove(&key[..])?;
                transfer_files.remove(&key[..])?;
                Ok(())
            },
        )?;

        debug!(file_id, "discarded unreleased version");
        Ok(())
    }

    fn mark_file_released(&self, release: &Release) -> Result<FileRecord> {
        let released = (
            &self.files,
            &self.entries,
            &self.transfer_files,
            &self.projects,
            &self.checksums,
        )
            .transaction(
                |(files, entries, transfer_files, projects, checksums)| -> TxResult<FileRecord> {
                    let mut file: FileRecord = tx_load(files, &release.file_id.to_be_bytes())?
                        .ok_or_else(|| {
                            ConflictableTransactionError::Abort(Error::NotFound(format!(
                                "file {}",
                                release.file_id
                            )))
                        })?;
                    let dir_id = file.directory_id.ok_or_else(|| {
                        ConflictableTransactionError::Abort(Error::IsADirectory(file.name.clone()))
                    })?;
                    let now = Utc::now();

                    // demote every other version of this name
                    let ekey = entry_key(dir_id, &file.name);
                    let mut index: EntryIndex = tx_load(entries, &ekey)?.unwrap_or_default();
                    let first_release = index.current.is_none();
                    for version in index.versions.iter().filter(|v| **v != file.id) {
                        let other: Option<FileRecord> = tx_load(files, &version.to_be_bytes())?;
                        if let Some(mut other) = other.filter(|o| o.current) {
                            other.current = false;
                            other.updated_at = now;
                            tx_store(files, &version.to_be_bytes(), &other)?;
                        }
                    }
                    if !index.versions.contains(&file.id) {
                        index.versions.push(file.id);
                    }
                    index.current = Some(file.id);
                    tx_store(entries, &ekey, &index)?;

                    file.current = true;
                    file.size = release.size;
                    file.updated_at = now;
                    // bytes were rewritten, any earlier dedup pointer is stale
                    file.uses_uuid = None;
                    file.uses_id = None;
                    if !release.checksum.is_empty() {
                        file.checksum = release.checksum.clone();
                    }

                    if let Some(scope) = release.dedup {
                        if dedup::is_dedupable(&file.checksum) {
                            let key = dedup::index_key(scope, file.project_id, &file.checksum);
                            if let Some(owner_id) = checksums.get(key.as_bytes())? {
                                let owner_id = abort(read_id(&owner_id))?;
                                let owner: Option<FileRecord> =
                                    tx_load(files, &owner_id.to_be_bytes())?;
                                if let Some(owner) = owner {
                                    dedup::redirect(&mut file, &owner);
                                }
                            }
                        }
                    }

                    if dedup::is_dedupable(&file.checksum) && file.uses_id.is_none() {
                        for key in dedup::all_index_keys(file.project_id, &file.checksum) {
                            if checksums.get(key.as_bytes())?.is_none() {
                                checksums.insert(key.as_bytes(), &file.id.to_be_bytes()[..])?;
                            }
                        }
                    }

                    tx_store(files, &file.id.to_be_bytes(), &file)?;

                    let tracking: Option<TransferRequestFile> =
                        tx_load(transfer_files, &file.id.to_be_bytes())?;
                    if let Some(mut tracking) = tracking {
                        tracking.state = TransferState::Closed;
                        tx_store(transfer_files, &file.id.to_be_bytes(), &tracking)?;
                    }

                    let mut stats: ProjectStats =
                        tx_load(projects, &file.project_id.to_be_bytes())?.unwrap_or(
                            ProjectStats {
                                project_id: file.project_id,
                                ..Default::default()
                            },
                        );
                    if first_release {
                        stats.file_count += 1;
                    }
                    stats.size += release.size;
                    tx_store(projects, &file.project_id.to_be_bytes(), &stats)?;

                    Ok(file)
                },
            )?;

        debug!(
            id = released.id,
            size = released.size,
            checksum = %released.checksum,
            uses_id = ?released.uses_id,
            "released file version"
        );
        Ok(released)
    }

    fn list_directory(
        &self,
        dir: &FileRecord,
        transfer: &TransferRequest,
    ) -> Result<Vec<FileRecord>> {
        let mut listing = Vec::new();
        for item in self.entries.scan_prefix(dir.id.to_be_bytes()) {
            let (_, value) = item?;
            let index: EntryIndex = decode(&value)?;

            if let Some(current) = index.current {
                listing.push(self.get_file(current)?);
                continue;
            }

            // never released: visible only to the transfer writing it
            for id in index.versions.iter().rev() {
                let open_here = self
                    .transfer_file(*id)?
                    .map(|t| t.transfer_request_id == transfer.id && t.state == TransferState::Open)
                    .unwrap_or(false);
                if open_here {
                    listing.push(self.get_file(*id)?);
                    break;
                }
            }
        }
        Ok(listing)
    }

    fn find_transfer_request(&self, project_id: i64, user_id: i64) -> Result<TransferRequest> {
        let not_found = || Error::NotFound(format!("transfer request {}/{}", project_id, user_id));
        let id = self
            .transfer_keys
            .get(transfer_key(project_id, user_id).as_bytes())?
            .ok_or_else(not_found)?;
        let request: TransferRequest =
            load(&self.transfer_requests, &id)?.ok_or_else(not_found)?;
        if request.is_open() {
            Ok(request)
        } else {
            Err(not_found())
        }
    }

    fn list_transfer_requests(&self) -> Result<Vec<TransferRequest>> {
        let mut requests = Vec::new();
        for value in self.transfer_requests.iter().values() {
            let request: TransferRequest = decode(&value?)?;
            if request.is_open() {
                requests.push(request);
            }
        }
        Ok(requests)
    }
}

impl ConversionQueue for MetadataStore {
    fn add_file_to_convert(&self, file: &FileRecord) -> Result<Conversion> {
        let conversion = Conversion {
            id: self.next_id()?,
            uuid: Uuid::new_v4().to_string(),
            project_id: file.project_id,
            owner_id: file.owner_id,
            file_id: file.id,
            created_at: Utc::now(),
        };
        self.conversions
            .insert(conversion.id.to_be_bytes(), encode(&conversion)?)?;
        info!(file_id = file.id, mime_type = %file.mime_type, "queued conversion");
        Ok(conversion)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

fn read_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization(format!("bad id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn load<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn abort<T>(result: Result<T>) -> TxResult<T> {
    result.map_err(ConflictableTransactionError::Abort)
}

fn tx_load<T: DeserializeOwned>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(abort(decode(&bytes))?)),
        None => Ok(None),
    }
}

fn tx_store<T: Serialize>(tree: &TransactionalTree, key: &[u8], value: &T) -> TxResult<()> {
    tree.insert(key, abort(encode(value))?)?;
    Ok(())
}

fn dir_path_key(project_id: i64, path: &str) -> String {
    format!("{}:{}", project_id, path)
}

fn transfer_key(project_id: i64, user_id: i64) -> String {
    format!("{}:{}", project_id, user_id)
}

fn entry_key(dir_id: u64, name: &str) -> Vec<u8> {
    let mut key = dir_id.to_be_bytes().to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupScope;

    fn store_with_transfer() -> (MetadataStore, TransferRequest, FileRecord) {
        let store = MetadataStore::temporary().unwrap();
        let transfer = store.open_transfer_request(1, 1).unwrap();
        let root = store.find_directory(1, "/").unwrap();
        (store, transfer, root)
    }

    fn new_version(store: &MetadataStore, t: &TransferRequest, dir: &FileRecord, name: &str) -> FileRecord {
        store
            .create_file_version(&NewFileVersion {
                project_id: t.project_id,
                owner_id: t.owner_id,
                directory_id: dir.id,
                name: name.to_string(),
                transfer_request_id: t.id,
            })
            .unwrap()
    }

    fn release(file: &FileRecord, size: u64, checksum: &str) -> Release {
        Release {
            file_id: file.id,
            size,
            checksum: checksum.to_string(),
            dedup: Some(DedupScope::Global),
        }
    }

    #[test]
    fn test_transfer_request_lifecycle() {
        let store = MetadataStore::temporary().unwrap();
        let first = store.open_transfer_request(3, 4).unwrap();
        let again = store.open_transfer_request(3, 4).unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.list_transfer_requests().unwrap().len(), 1);
        assert!(store.find_directory(3, "/").unwrap().is_dir());

        store.close_transfer_request(3, 4).unwrap();
        assert!(matches!(store.find_transfer_request(3, 4), Err(Error::NotFound(_))));
        assert!(store.list_transfer_requests().unwrap().is_empty());
    }

    #[test]
    fn test_create_directory_idempotent() {
        let (store, _, root) = store_with_transfer();
        let a = store.create_directory(1, 1, &root, "/dir1").unwrap();
        let b = store.create_directory(1, 1, &root, "/dir1").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.find_file(1, "/dir1").unwrap().id, a.id);
        assert_eq!(store.project_stats(1).unwrap().directory_count, 2);
    }

    #[test]
    fn test_release_promotes_newest_version_only() {
        let (store, t, root) = store_with_transfer();
        let mut last = None;
        for i in 0..4u64 {
            let v = new_version(&store, &t, &root, "data.csv");
            store.mark_file_released(&release(&v, i, "")).unwrap();
            last = Some(v.id);
        }

        let versions = store.versions(root.id, "data.csv").unwrap();
        assert_eq!(versions.len(), 4);
        let current: Vec<u64> = versions
            .iter()
            .filter(|id| store.get_file(**id).unwrap().current)
            .copied()
            .collect();
        assert_eq!(current, vec![last.unwrap()]);
        assert_eq!(store.find_file(1, "/data.csv").unwrap().id, last.unwrap());
        assert_eq!(store.project_stats(1).unwrap().file_count, 1);
    }

    #[test]
    fn test_release_closes_tracking_row_and_counts_bytes() {
        let (store, t, root) = store_with_transfer();
        let v = new_version(&store, &t, &root, "a.txt");
        assert_eq!(store.transfer_file(v.id).unwrap().unwrap().state, TransferState::Open);

        let released = store.mark_file_released(&release(&v, 9, "abc")).unwrap();
        assert!(released.current);
        assert_eq!(released.size, 9);
        assert_eq!(released.checksum, "abc");
        assert_eq!(store.transfer_file(v.id).unwrap().unwrap().state, TransferState::Closed);
        assert_eq!(store.project_stats(1).unwrap().size, 9);

        // bytes count even when the digest was invalidated
        let v2 = new_version(&store, &t, &root, "b.txt");
        let released = store.mark_file_released(&release(&v2, 5, "")).unwrap();
        assert_eq!(released.checksum, "");
        assert_eq!(store.project_stats(1).unwrap().size, 14);
    }

    #[test]
    fn test_discard_unreleased_version() {
        let (store, t, root) = store_with_transfer();
        let kept = new_version(&store, &t, &root, "a.txt");
        let dropped = new_version(&store, &t, &root, "a.txt");

        store.discard_file_version(dropped.id).unwrap();
        assert!(matches!(store.get_file(dropped.id), Err(Error::NotFound(_))));
        assert!(store.transfer_file(dropped.id).unwrap().is_none());
        assert_eq!(store.versions(root.id, "a.txt").unwrap(), vec![kept.id]);

        // twice is fine
        store.discard_file_version(dropped.id).unwrap();

        let released = store.mark_file_released(&release(&kept, 1, "")).unwrap();
        assert!(store.discard_file_version(released.id).is_err());

        let lonely = new_version(&store, &t, &root, "b.txt");
        store.discard_file_version(lonely.id).unwrap();
        assert!(store.versions(root.id, "b.txt").unwrap().is_empty());
        let names: Vec<String> = store
            .list_directory(&root, &t)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[test]
    fn test_dedup_points_second_copy_at_first() {
        let (store, t, root) = store_with_transfer();
        let a = new_version(&store, &t, &root, "a.txt");
        let a = store.mark_file_released(&release(&a, 4, "same")).unwrap();
        let b = new_version(&store, &t, &root, "b.txt");
        let b = store.mark_file_released(&release(&b, 4, "same")).unwrap();
        let c = new_version(&store, &t, &root, "c.txt");
        let c = store.mark_file_released(&release(&c, 4, "same")).unwrap();

        assert!(a.uses_uuid.is_none());
        assert_eq!(b.uses_uuid.as_deref(), Some(a.uuid.as_str()));
        assert_eq!(c.uses_uuid.as_deref(), Some(a.uuid.as_str()));
        assert_eq!(c.uses_id, Some(a.id));
    }

    #[test]
    fn test_dedup_scope_project_keeps_projects_apart() {
        let store = MetadataStore::temporary().unwrap();
        let t1 = store.open_transfer_request(1, 1).unwrap();
        let t2 = store.open_transfer_request(2, 1).unwrap();
        let r1 = store.find_directory(1, "/").unwrap();
        let r2 = store.find_directory(2, "/").unwrap();

        let a = new_version(&store, &t1, &r1, "a.txt");
        store.mark_file_released(&release(&a, 1, "x")).unwrap();

        let b = new_version(&store, &t2, &r2, "b.txt");
        let mut scoped = release(&b, 1, "x");
        scoped.dedup = Some(DedupScope::Project);
        let b = store.mark_file_released(&scoped).unwrap();
        assert!(b.uses_uuid.is_none());

        let c = new_version(&store, &t2, &r2, "c.txt");
        let mut global = release(&c, 1, "x");
        global.dedup = Some(DedupScope::Global);
        let c = store.mark_file_released(&global).unwrap();
        assert_eq!(c.uses_id, Some(a.id));
    }

    #[test]
    fn test_list_directory_shows_open_versions_of_this_transfer() {
        let (store, t, root) = store_with_transfer();
        let done = new_version(&store, &t, &root, "done.txt");
        store.mark_file_released(&release(&done, 1, "")).unwrap();
        new_version(&store, &t, &root, "pending.txt");

        let mut names: Vec<String> = store
            .list_directory(&root, &t)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["done.txt", "pending.txt"]);

        let other = TransferRequest::new(999, 1, 2);
        let names: Vec<String> = store
            .list_directory(&root, &other)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["done.txt"]);
    }

    #[test]
    fn test_conversions_queued() {
        let (store, t, root) = store_with_transfer();
        let v = new_version(&store, &t, &root, "scan.tiff");
        store.add_file_to_convert(&v).unwrap();
        let queued = store.list_conversions().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].file_id, v.id);
    }

    #[test]
    fn test_find_missing() {
        let (store, _, _) = store_with_transfer();
        assert!(matches!(store.find_file(1, "/nope.txt"), Err(Error::NotFound(_))));
        assert!(matches!(store.find_directory(1, "/nope"), Err(Error::NotFound(_))));
        assert!(matches!(store.find_file(9, "/x"), Err(Error::NotFound(_))));
    }
}
