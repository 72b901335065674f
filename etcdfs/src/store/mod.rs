//! Tree store abstraction
//!
//! The filesystem talks to its backend through [`TreeStore`]: a key space whose
//! keys are slash-delimited paths, where every key is either a directory node
//! (has children) or a file node (has a value).
//!
//! Submodules:
//! - `etcd`: etcd v3 backend, directories emulated with marker keys
//! - `memory`: in-process backend used by tests and local experiments

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

pub use etcd::EtcdTreeStore;
pub use memory::InMemoryTreeStore;

/// A node returned by [`TreeStore::get`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    /// Store key, always starting with `/` (`"/"` for the root).
    pub key: String,
    pub dir: bool,
    /// File content; empty for directories.
    pub value: Bytes,
    /// Children of a directory. A non-recursive read lists immediate children
    /// by key and kind only, with file values left empty. A recursive read
    /// returns the whole subtree, values included.
    pub nodes: Vec<Node>,
}

impl Node {
    pub fn file(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            dir: false,
            value: value.into(),
            nodes: Vec::new(),
        }
    }

    pub fn dir(key: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            key: key.into(),
            dir: true,
            value: Bytes::new(),
            nodes,
        }
    }

    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        match self.key.rfind('/') {
            Some(i) => &self.key[i + 1..],
            None => &self.key,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("key already exists: {0}")]
    NodeExist(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADir(String),
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),
    #[error("root is read only")]
    RootReadOnly,
    #[error(transparent)]
    Etcd(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Etcd(Box::new(e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capabilities the filesystem needs from a hierarchical key-value store.
///
/// Implementations must be safe for concurrent use; the filesystem shares a
/// single instance across every in-flight request. `ttl` is in seconds and
/// `0` means the node never expires.
#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn get(&self, path: &str, recursive: bool, sorted: bool) -> StoreResult<Node>;

    async fn set(&self, path: &str, value: Bytes, ttl: u64) -> StoreResult<()>;

    async fn delete(&self, path: &str, recursive: bool, dir: bool) -> StoreResult<()>;

    async fn create_dir(&self, path: &str, ttl: u64) -> StoreResult<()>;
}

/// Canonical store key for a filesystem path: `""` and `"/"` map to `"/"`,
/// `"a/b"` and `"/a/b"` both map to `"/a/b"`. Repeated and trailing slashes
/// are collapsed.
pub fn key_of(path: &str) -> String {
    let mut key = String::with_capacity(path.len() + 1);
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        key.push('/');
        key.push_str(seg);
    }
    if key.is_empty() {
        key.push('/');
    }
    key
}

/// Keys of every proper ancestor of `key`, root excluded, outermost first.
/// `"/a/b/c"` yields `["/a", "/a/b"]`.
pub(crate) fn ancestors(key: &str) -> Vec<&str> {
    key.match_indices('/')
        .map(|(i, _)| &key[..i])
        .filter(|k| !k.is_empty())
        .collect()
}
