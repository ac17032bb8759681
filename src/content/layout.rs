//! Sharded physical layout
//!
//! Bytes for a record live at `root/AA/BB/<uuid>` where `AABB` are the
//! first four characters of the second dash-delimited group of the
//! canonical uuid.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Directory holding the bytes for `uuid`
pub fn shard_dir(root: &Path, uuid: &str) -> Result<PathBuf> {
    let group = uuid
        .split('-')
        .nth(1)
        .ok_or_else(|| Error::InvalidArgument(format!("malformed uuid '{}'", uuid)))?;

    match (group.get(0..2), group.get(2..4)) {
        (Some(first), Some(second)) => Ok(root.join(first).join(second)),
        _ => Err(Error::InvalidArgument(format!(
            "uuid group too short in '{}'",
            uuid
        ))),
    }
}

/// Physical file for `uuid`
pub fn shard_path(root: &Path, uuid: &str) -> Result<PathBuf> {
    Ok(shard_dir(root, uuid)?.join(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_path() {
        let root = Path::new("/data/objects");
        let uuid = "0d4a35e2-8c1f-4b7a-9a55-1f6b0c2d3e4f";
        assert_eq!(
            shard_dir(root, uuid).unwrap(),
            PathBuf::from("/data/objects/8c/1f")
        );
        assert_eq!(
            shard_path(root, uuid).unwrap(),
            PathBuf::from("/data/objects/8c/1f/0d4a35e2-8c1f-4b7a-9a55-1f6b0c2d3e4f")
        );
    }

    #[test]
    fn test_malformed_uuid() {
        let root = Path::new("/r");
        assert!(shard_dir(root, "nodashes").is_err());
        assert!(shard_dir(root, "abc-12-x").is_err());
        assert!(shard_dir(root, "").is_err());
    }
}
