//! etcdfs: an etcd key space exposed as a FUSE filesystem.
//!
//! - `store`: the tree-structured store abstraction and its backends
//! - `fs`: path-based filesystem operations over a store
//! - `handle`: open file handles
//! - `fuse`: `rfuse3` bridge and mount helpers
//! - `config`: store connection settings

pub mod config;
pub mod fs;
pub mod fuse;
pub mod handle;
pub mod store;

pub use fs::{Attr, DirEntry, FileKind, FsError, PathFs};
pub use handle::FileHandle;
pub use store::{EtcdTreeStore, InMemoryTreeStore, Node, StoreError, TreeStore};
