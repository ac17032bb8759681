//! FUSE filesystem implementation
//!
//! Nodes and handles implement the bridge semantics against shared
//! [`BridgeServices`]; [`BridgeFs`] adapts them to the kernel interface.

mod attr;
mod filesystem;
mod handle;
mod node;
mod services;
mod workers;


pub use attr::{inode_for, NodeAttr, NodeKind, ROOT_INO};
pub use filesystem::BridgeFs;
pub use handle::{FileHandle, LockRange};
pub use node::{DirEntry, FsNode, NodeFactory};
pub use services::BridgeServices;
pub use workers::WorkerPool;
