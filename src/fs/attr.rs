//! Inode numbering and attribute conversion

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode of `/`
pub const ROOT_INO: u64 = 1;

/// Stable inode for a full virtual path: 64 bits of its blake3 hash
pub fn inode_for(path: &str) -> u64 {
    if path == "/" {
        return ROOT_INO;
    }
    let hash = blake3::hash(path.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&hash.as_bytes()[..8]);
    match u64::from_le_bytes(raw) {
        // 0 is invalid and 1 belongs to the root
        n @ (0 | 1) => n + 2,
        n => n,
    }
}

/// Node type as shown through the mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

impl NodeKind {
    /// Convert to fuser file type
    pub fn to_fuser(self) -> fuser::FileType {
        match self {
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::File => fuser::FileType::RegularFile,
        }
    }
}

/// Attributes of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAttr {
    pub ino: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub perm: u16,
}

impl NodeAttr {
    pub fn directory(ino: u64, perm: u16, mtime: SystemTime) -> Self {
        NodeAttr {
            ino,
            kind: NodeKind::Directory,
            size: 4096,
            mtime,
            perm,
        }
    }

    pub fn file(ino: u64, perm: u16, size: u64, mtime: SystemTime) -> Self {
        NodeAttr {
            ino,
            kind: NodeKind::File,
            size,
            mtime,
            perm,
        }
    }

    /// File attributes from a stat of the physical file
    pub fn from_metadata(ino: u64, perm: u16, meta: &Metadata) -> Self {
        let mtime = UNIX_EPOCH + Duration::new(meta.mtime().max(0) as u64, meta.mtime_nsec().max(0) as u32);
        NodeAttr::file(ino, perm, meta.len(), mtime)
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser(&self, uid: u32, gid: u32) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: self.ino,
            size: self.size,
            blocks: self.size.div_ceil(512),
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            crtime: self.mtime,
            kind: self.kind.to_fuser(),
            perm: self.perm,
            nlink: match self.kind {
                NodeKind::Directory => 2,
                NodeKind::File => 1,
            },
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_stable_and_distinct() {
        assert_eq!(inode_for("/"), ROOT_INO);
        let a = inode_for("/1/1/dir1/file.txt");
        assert_eq!(a, inode_for("/1/1/dir1/file.txt"));
        assert_ne!(a, inode_for("/1/1/dir1/file2.txt"));
        assert!(a > ROOT_INO);
    }

    #[test]
    fn test_to_fuser() {
        let attr = NodeAttr::file(42, 0o644, 9, UNIX_EPOCH);
        let fa = attr.to_fuser(1000, 1000);
        assert_eq!(fa.ino, 42);
        assert_eq!(fa.size, 9);
        assert_eq!(fa.blocks, 1);
        assert_eq!(fa.kind, fuser::FileType::RegularFile);

        let dir = NodeAttr::directory(7, 0o755, UNIX_EPOCH).to_fuser(0, 0);
        assert_eq!(dir.kind, fuser::FileType::Directory);
        assert_eq!(dir.nlink, 2);
    }
}
