//! Shared services every node and handle works against

use crate::config::Config;
use crate::content::{ContentStore, DedupScope};
use crate::metadata::{
    ConversionQueue, MetadataStore, PersistenceGateway, RetryPolicy, Retrying,
};
use crate::state::{ActivityMonitor, KnownFilesTracker};
use std::sync::Arc;

/// Everything a mount needs, built once and shared by `Arc`
pub struct BridgeServices {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub conversions: Arc<dyn ConversionQueue>,
    pub content: ContentStore,
    pub known_files: KnownFilesTracker,
    pub activity: ActivityMonitor,
    /// Dedup scope for released files, `None` when dedup is off
    pub dedup: Option<DedupScope>,
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u16,
    pub dir_mode: u16,
}

impl BridgeServices {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        conversions: Arc<dyn ConversionQueue>,
        content: ContentStore,
        config: &Config,
    ) -> Self {
        BridgeServices {
            gateway,
            conversions,
            content,
            known_files: KnownFilesTracker::new(),
            activity: ActivityMonitor::new(),
            dedup: config.dedup.enabled.then_some(config.dedup.scope),
            uid: config.mount.uid,
            gid: config.mount.gid,
            file_mode: (config.mount.default_file_mode & 0o7777) as u16,
            dir_mode: (config.mount.default_dir_mode & 0o7777) as u16,
        }
    }

    /// Services backed by a sled metadata store, with every mutation retried
    /// per the gateway config
    pub fn with_store(store: MetadataStore, config: &Config) -> Arc<Self> {
        let policy = RetryPolicy::from(&config.gateway);
        let gateway = Arc::new(Retrying::new(store, policy));
        let content = ContentStore::new(config.storage.content_root.clone());
        Arc::new(BridgeServices::new(
            gateway.clone(),
            gateway,
            content,
            config,
        ))
    }
}
