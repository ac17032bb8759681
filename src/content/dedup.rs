//! Checksum dedup rule
//!
//! Once a version's checksum is known it may be pointed at an existing
//! record with the same bytes. The checksum index maps a scoped key to the
//! id of the first record released with that checksum.

pub use crate::config::DedupScope;
use crate::metadata::FileRecord;

/// Index key for a checksum under `scope`
pub fn index_key(scope: DedupScope, project_id: i64, checksum: &str) -> String {
    match scope {
        DedupScope::Global => format!("g:{}", checksum),
        DedupScope::Project => format!("p:{}:{}", project_id, checksum),
    }
}

/// Every key a released record is indexed under, so either scope can find it
pub fn all_index_keys(project_id: i64, checksum: &str) -> [String; 2] {
    [
        index_key(DedupScope::Global, project_id, checksum),
        index_key(DedupScope::Project, project_id, checksum),
    ]
}

/// Empty checksums mean the digest was invalidated and never dedup
pub fn is_dedupable(checksum: &str) -> bool {
    !checksum.is_empty()
}

/// Point `file` at `candidate`'s canonical bytes. Returns false when the
/// candidate is `file` itself or already shares its bytes.
pub fn redirect(file: &mut FileRecord, candidate: &FileRecord) -> bool {
    if candidate.id == file.id || candidate.canonical_id() == file.canonical_id() {
        return false;
    }
    if candidate.is_dir() || candidate.checksum != file.checksum {
        return false;
    }
    file.point_at(candidate);
    true
}
