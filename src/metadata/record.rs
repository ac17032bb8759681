//! Persisted records
//!
//! Files and directories share one record type; directories carry the
//! `directory` mime type and a project-relative `path`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::mime;

/// Mime type stored on directory records
pub const DIRECTORY_MIME: &str = "directory";

/// A file version or a directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub uuid: String,
    /// Record that owns the bytes, when this one was deduplicated
    pub uses_uuid: Option<String>,
    pub uses_id: Option<u64>,
    pub project_id: i64,
    pub owner_id: i64,
    /// Parent directory; `None` only for a project root
    pub directory_id: Option<u64>,
    pub name: String,
    /// Project-relative path, directories only
    pub path: Option<String>,
    pub size: u64,
    /// Hex md5, empty when unknown
    pub checksum: String,
    pub mime_type: String,
    /// Visible version of its (directory, name)
    pub current: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// A new, not yet current, file version
    pub fn new_file(
        id: u64,
        project_id: i64,
        owner_id: i64,
        directory_id: u64,
        name: &str,
    ) -> Self {
        let now = Utc::now();
        FileRecord {
            id,
            uuid: Uuid::new_v4().to_string(),
            uses_uuid: None,
            uses_id: None,
            project_id,
            owner_id,
            directory_id: Some(directory_id),
            name: name.to_string(),
            path: None,
            size: 0,
            checksum: String::new(),
            mime_type: mime::mime_type_for(name),
            current: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// A directory record at `path`
    pub fn new_directory(
        id: u64,
        project_id: i64,
        owner_id: i64,
        directory_id: Option<u64>,
        path: &str,
    ) -> Self {
        let now = Utc::now();
        let name = match path.rsplit('/').next() {
            Some("") | None => "/".to_string(),
            Some(n) => n.to_string(),
        };
        FileRecord {
            id,
            uuid: Uuid::new_v4().to_string(),
            uses_uuid: None,
            uses_id: None,
            project_id,
            owner_id,
            directory_id,
            name,
            path: Some(path.to_string()),
            size: 0,
            checksum: String::new(),
            mime_type: DIRECTORY_MIME.to_string(),
            current: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mime_type == DIRECTORY_MIME
    }

    /// Uuid naming the physical bytes
    pub fn canonical_uuid(&self) -> &str {
        self.uses_uuid.as_deref().unwrap_or(&self.uuid)
    }

    /// Id of the record owning the physical bytes
    pub fn canonical_id(&self) -> u64 {
        self.uses_id.unwrap_or(self.id)
    }

    /// Whether a converted rendition should be produced after upload
    pub fn is_convertible(&self) -> bool {
        mime::is_convertible(&self.mime_type)
    }

    /// Point this record at another record's bytes, flattened to one hop
    pub fn point_at(&mut self, owner: &FileRecord) {
        self.uses_uuid = Some(owner.canonical_uuid().to_string());
        self.uses_id = Some(owner.canonical_id());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Open,
    Closed,
}

/// Upload session tying a project and user together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: u64,
    pub uuid: String,
    pub project_id: i64,
    pub owner_id: i64,
    pub state: TransferState,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRequest {
    pub fn new(id: u64, project_id: i64, owner_id: i64) -> Self {
        let now = Utc::now();
        TransferRequest {
            id,
            uuid: Uuid::new_v4().to_string(),
            project_id,
            owner_id,
            state: TransferState::Open,
            last_active_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TransferState::Open
    }
}

/// Per-version tracking row created with each upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequestFile {
    pub id: u64,
    pub uuid: String,
    pub transfer_request_id: u64,
    pub project_id: i64,
    pub owner_id: i64,
    pub directory_id: u64,
    pub file_id: u64,
    pub name: String,
    pub state: TransferState,
}

/// Pending conversion of an uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub id: u64,
    pub uuid: String,
    pub project_id: i64,
    pub owner_id: i64,
    pub file_id: u64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters for a project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: i64,
    pub size: u64,
    pub file_count: u64,
    pub directory_count: u64,
}
