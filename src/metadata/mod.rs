//! Metadata storage module
//!
//! Records for files, directories and transfer requests, the gateway
//! traits the bridge talks through, and a sled-backed implementation.

mod gateway;
pub mod mime;
mod record;
mod retry;
mod store;

pub use gateway::{ConversionQueue, NewFileVersion, PersistenceGateway, Release, Retrying};
pub use record::{
    Conversion, FileRecord, ProjectStats, TransferRequest, TransferRequestFile, TransferState,
    DIRECTORY_MIME,
};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use store::MetadataStore;
