//! BridgeFS - FUSE bridge onto a versioned, content-addressed file store
//!
//! Paths below the mount are `/project/user/...`. Every upload becomes a new
//! version of its logical file; bytes live in a sharded content store and
//! identical uploads are deduplicated on release.

pub mod config;
pub mod content;
pub mod error;
pub mod fs;
pub mod metadata;
pub mod path;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{BridgeFs, BridgeServices};
    pub use crate::metadata::{FileRecord, MetadataStore, PersistenceGateway};
    pub use crate::path::VirtualPath;
}
