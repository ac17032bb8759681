//! Process-local mount state

mod activity;
mod known_files;

pub use activity::{ActivityCounter, ActivityMonitor, ActivitySnapshot};
pub use known_files::{KnownFile, KnownFileState, KnownFilesTracker};
