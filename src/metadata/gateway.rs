//! Persistence gateway seams
//!
//! The bridge never talks to a database directly. Everything it needs from
//! the project store goes through [`PersistenceGateway`], and post-upload
//! work is handed to a [`ConversionQueue`]. [`Retrying`] wraps any gateway
//! so that every mutation gets the configured retry budget.

use super::record::{Conversion, FileRecord, TransferRequest};
use super::retry::RetryPolicy;
use crate::config::DedupScope;
use crate::error::Result;

/// A new, not yet current, version of `name` in `directory_id`
#[derive(Debug, Clone)]
pub struct NewFileVersion {
    pub project_id: i64,
    pub owner_id: i64,
    pub directory_id: u64,
    pub name: String,
    pub transfer_request_id: u64,
}

/// Final state of an uploaded version
#[derive(Debug, Clone)]
pub struct Release {
    pub file_id: u64,
    pub size: u64,
    /// Hex md5, empty when the digest was invalidated
    pub checksum: String,
    /// Dedup against existing records in this scope, `None` disables it
    pub dedup: Option<DedupScope>,
}

/// Directory, file and transfer-request storage
pub trait PersistenceGateway: Send + Sync {
    /// Directory at project-relative `path`
    fn find_directory(&self, project_id: i64, path: &str) -> Result<FileRecord>;

    /// Create the directory at `path` under `parent`, or return the existing one
    fn create_directory(
        &self,
        project_id: i64,
        owner_id: i64,
        parent: &FileRecord,
        path: &str,
    ) -> Result<FileRecord>;

    /// Current file, or directory, at project-relative `path`
    fn find_file(&self, project_id: i64, path: &str) -> Result<FileRecord>;

    fn create_file_version(&self, version: &NewFileVersion) -> Result<FileRecord>;

    /// Remove a version that was never released, with its tracking row.
    /// Missing versions are ignored.
    fn discard_file_version(&self, file_id: u64) -> Result<()>;

    /// Atomically make the released version current: demote every other
    /// version of its (directory, name), store size and checksum, close its
    /// tracking row, update project totals and apply dedup.
    fn mark_file_released(&self, release: &Release) -> Result<FileRecord>;

    /// Current entries of `dir` plus versions still open in `transfer`
    fn list_directory(&self, dir: &FileRecord, transfer: &TransferRequest)
        -> Result<Vec<FileRecord>>;

    /// Open transfer request for (project, user)
    fn find_transfer_request(&self, project_id: i64, user_id: i64) -> Result<TransferRequest>;

    /// Every open transfer request
    fn list_transfer_requests(&self) -> Result<Vec<TransferRequest>>;
}

/// Sink for files that need a converted rendition
pub trait ConversionQueue: Send + Sync {
    fn add_file_to_convert(&self, file: &FileRecord) -> Result<Conversion>;
}

/// Gateway decorator retrying every mutation under a [`RetryPolicy`]
pub struct Retrying<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G> Retrying<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Retrying { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

impl<G: PersistenceGateway> PersistenceGateway for Retrying<G> {
    fn find_directory(&self, project_id: i64, path: &str) -> Result<FileRecord> {
        self.inner.find_directory(project_id, path)
    }

    fn create_directory(
        &self,
        project_id: i64,
        owner_id: i64,
        parent: &FileRecord,
        path: &str,
    ) -> Result<FileRecord> {
        self.policy.run("create_directory", || {
            self.inner.create_directory(project_id, owner_id, parent, path)
        })
    }

    fn find_file(&self, project_id: i64, path: &str) -> Result<FileRecord> {
        self.inner.find_file(project_id, path)
    }

    fn create_file_version(&self, version: &NewFileVersion) -> Result<FileRecord> {
        self.policy
            .run("create_file_version", || self.inner.create_file_version(version))
    }

    fn discard_file_version(&self, file_id: u64) -> Result<()> {
        self.policy
            .run("discard_file_version", || self.inner.discard_file_version(file_id))
    }

    fn mark_file_released(&self, release: &Release) -> Result<FileRecord> {
        self.policy
            .run("mark_file_released", || self.inner.mark_file_released(release))
    }

    fn list_directory(
        &self,
        dir: &FileRecord,
        transfer: &TransferRequest,
    ) -> Result<Vec<FileRecord>> {
        self.inner.list_directory(dir, transfer)
    }

    fn find_transfer_request(&self, project_id: i64, user_id: i64) -> Result<TransferRequest> {
        self.inner.find_transfer_request(project_id, user_id)
    }

    fn list_transfer_requests(&self) -> Result<Vec<TransferRequest>> {
        self.inner.list_transfer_requests()
    }
}

impl<G: ConversionQueue> ConversionQueue for Retrying<G> {
    fn add_file_to_convert(&self, file: &FileRecord) -> Result<Conversion> {
        self.policy
            .run("add_file_to_convert", || self.inner.add_file_to_convert(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Gateway whose mutations fail with a conflict a fixed number of times
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn attempt(&self) -> Result<FileRecord> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(Error::Conflict("files".into()))
            } else {
                Ok(FileRecord::new_file(1, 1, 1, 1, "a.txt"))
            }
        }
    }

    impl PersistenceGateway for Flaky {
        fn find_directory(&self, _: i64, path: &str) -> Result<FileRecord> {
            Err(Error::NotFound(path.to_string()))
        }
        fn create_directory(&self, _: i64, _: i64, _: &FileRecord, _: &str) -> Result<FileRecord> {
            self.attempt()
        }
        fn find_file(&self, _: i64, path: &str) -> Result<FileRecord> {
            Err(Error::NotFound(path.to_string()))
        }
        fn create_file_version(&self, _: &NewFileVersion) -> Result<FileRecord> {
            self.attempt()
        }
        fn discard_file_version(&self, _: u64) -> Result<()> {
            self.attempt().map(|_| ())
        }
        fn mark_file_released(&self, _: &Release) -> Result<FileRecord> {
            self.attempt()
        }
        fn list_directory(&self, _: &FileRecord, _: &TransferRequest) -> Result<Vec<FileRecord>> {
            Ok(Vec::new())
        }
        fn find_transfer_request(&self, p: i64, u: i64) -> Result<TransferRequest> {
            Ok(TransferRequest::new(1, p, u))
        }
        fn list_transfer_requests(&self) -> Result<Vec<TransferRequest>> {
            Ok(Vec::new())
        }
    }

    fn release() -> Release {
        Release {
            file_id: 1,
            size: 0,
            checksum: String::new(),
            dedup: None,
        }
    }

    #[test]
    fn test_mutation_retried_through_transient_failures() {
        let gateway = Retrying::new(
            Flaky { failures: 2, calls: AtomicU32::new(0) },
            RetryPolicy::new(3, 1),
        );
        assert!(gateway.mark_file_released(&release()).is_ok());
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_mutation_is_an_error() {
        let gateway = Retrying::new(
            Flaky { failures: 10, calls: AtomicU32::new(0) },
            RetryPolicy::new(3, 1),
        );
        let err = gateway.mark_file_released(&release()).unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_discard_retried() {
        let gateway = Retrying::new(
            Flaky { failures: 1, calls: AtomicU32::new(0) },
            RetryPolicy::new(3, 1),
        );
        assert!(gateway.discard_file_version(1).is_ok());
        assert_eq!(gateway.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reads_not_retried() {
        let gateway = Retrying::new(
            Flaky { failures: 0, calls: AtomicU32::new(0) },
            RetryPolicy::new(3, 1),
        );
        assert!(matches!(
            gateway.find_file(1, "/nope"),
            Err(Error::NotFound(_))
        ));
    }
}
