//! Virtual path decomposition
//!
//! Paths seen through the mount look like `/{project}/{user}/rest/of/path`.
//! A [`VirtualPath`] splits such a path into its ids, the path relative to
//! the project root and the transfer base `/{project}/{user}` that groups
//! the activity of one upload session.

use std::fmt;

/// Which level of the virtual tree a path points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    /// `/`
    Root,
    /// `/{project}`
    ProjectBase,
    /// `/{project}/{user}`
    UserBase,
    /// `/{project}/{user}/...`
    Complete,
    /// A project or user segment that is not an integer
    BadId(String),
}

/// A parsed virtual path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath {
    kind: PathKind,
    project_id: Option<i64>,
    user_id: Option<i64>,
    relative: String,
    full: String,
    transfer_base: String,
}

impl VirtualPath {
    /// Parse an absolute virtual path. Never fails; bad ids are reported
    /// through [`PathKind::BadId`].
    pub fn parse(path: &str) -> Self {
        let segments = normalize(path);
        let full = if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", segments.join("/"))
        };

        let mut vpath = VirtualPath {
            kind: PathKind::Root,
            project_id: None,
            user_id: None,
            relative: "/".to_string(),
            full,
            transfer_base: "/".to_string(),
        };

        let Some(project) = segments.first() else {
            return vpath;
        };

        match project.parse::<i64>() {
            Ok(id) => vpath.project_id = Some(id),
            Err(_) => {
                vpath.kind = PathKind::BadId(project.to_string());
                return vpath;
            }
        }

        let Some(user) = segments.get(1) else {
            vpath.kind = PathKind::ProjectBase;
            return vpath;
        };

        match user.parse::<i64>() {
            Ok(id) => vpath.user_id = Some(id),
            Err(_) => {
                vpath.kind = PathKind::BadId(user.to_string());
                return vpath;
            }
        }

        vpath.transfer_base = format!("/{}/{}", segments[0], segments[1]);
        if segments.len() == 2 {
            vpath.kind = PathKind::UserBase;
        } else {
            vpath.kind = PathKind::Complete;
            vpath.relative = format!("/{}", segments[2..].join("/"));
        }

        vpath
    }

    pub fn kind(&self) -> &PathKind {
        &self.kind
    }

    pub fn project_id(&self) -> Option<i64> {
        self.project_id
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    /// Both ids, present for `UserBase` and `Complete` paths
    pub fn ids(&self) -> Option<(i64, i64)> {
        match self.kind {
            PathKind::UserBase | PathKind::Complete => {
                Some((self.project_id?, self.user_id?))
            }
            _ => None,
        }
    }

    /// Path inside the project, `/` for the user base
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Normalized full virtual path
    pub fn full(&self) -> &str {
        &self.full
    }

    /// `/{project}/{user}`, or `/` above the user level
    pub fn transfer_base(&self) -> &str {
        &self.transfer_base
    }

    pub fn is_bad(&self) -> bool {
        matches!(self.kind, PathKind::BadId(_))
    }

    /// Last segment of the full path
    pub fn file_name(&self) -> Option<&str> {
        if self.full == "/" {
            return None;
        }
        self.full.rsplit('/').next()
    }

    /// Parent of the relative path
    pub fn parent_relative(&self) -> String {
        parent_of(&self.relative)
    }

    /// Parent of the full virtual path
    pub fn parent_full(&self) -> String {
        parent_of(&self.full)
    }

    /// Child path
    pub fn join(&self, name: &str) -> VirtualPath {
        if self.full == "/" {
            VirtualPath::parse(&format!("/{}", name))
        } else {
            VirtualPath::parse(&format!("{}/{}", self.full, name))
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Lexically resolve `.`, `..` and repeated slashes. `..` never climbs
/// above the root.
fn normalize(path: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments
}

/// Parent of a normalized absolute path
pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Join a name onto a normalized absolute path
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root() {
        let p = VirtualPath::parse("/");
        assert_eq!(p.kind(), &PathKind::Root);
        assert_eq!(p.full(), "/");
        assert_eq!(p.relative(), "/");
        assert_eq!(p.transfer_base(), "/");
        assert_eq!(p.file_name(), None);
    }

    #[test]
    fn test_project_base() {
        for raw in ["/12", "/12/"] {
            let p = VirtualPath::parse(raw);
            assert_eq!(p.kind(), &PathKind::ProjectBase, "{}", raw);
            assert_eq!(p.project_id(), Some(12));
            assert_eq!(p.user_id(), None);
            assert!(p.ids().is_none());
        }
    }

    #[test]
    fn test_user_base() {
        let p = VirtualPath::parse("/25/301");
        assert_eq!(p.kind(), &PathKind::UserBase);
        assert_eq!(p.ids(), Some((25, 301)));
        assert_eq!(p.relative(), "/");
        assert_eq!(p.transfer_base(), "/25/301");
    }

    #[test]
    fn test_complete() {
        let p = VirtualPath::parse("/25/301/a/b");
        assert_eq!(p.kind(), &PathKind::Complete);
        assert_eq!(p.project_id(), Some(25));
        assert_eq!(p.user_id(), Some(301));
        assert_eq!(p.relative(), "/a/b");
        assert_eq!(p.transfer_base(), "/25/301");
        assert_eq!(p.file_name(), Some("b"));
        assert_eq!(p.parent_relative(), "/a");
        assert_eq!(p.parent_full(), "/25/301/a");
    }

    #[test]
    fn test_bad_ids() {
        let p = VirtualPath::parse("/abc");
        assert_eq!(p.kind(), &PathKind::BadId("abc".to_string()));

        let p = VirtualPath::parse("/1/bob/file.txt");
        assert_eq!(p.kind(), &PathKind::BadId("bob".to_string()));
        assert!(p.is_bad());
        assert!(p.ids().is_none());

        let p = VirtualPath::parse("/x1/2/file.txt");
        assert_eq!(p.kind(), &PathKind::BadId("x1".to_string()));
    }

    #[test]
    fn test_dot_segments_normalized() {
        let p = VirtualPath::parse("/1/2/./a/../b//c");
        assert_eq!(p.full(), "/1/2/b/c");
        assert_eq!(p.relative(), "/b/c");

        let p = VirtualPath::parse("/../../1");
        assert_eq!(p.kind(), &PathKind::ProjectBase);

        let p = VirtualPath::parse("/1/2/..");
        assert_eq!(p.kind(), &PathKind::ProjectBase);
    }

    #[test]
    fn test_join() {
        let root = VirtualPath::parse("/");
        assert_eq!(root.join("7").kind(), &PathKind::ProjectBase);

        let user = VirtualPath::parse("/7/8");
        let child = user.join("dir1");
        assert_eq!(child.relative(), "/dir1");
        assert_eq!(child.parent_relative(), "/");
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }
}
