//! Path-based filesystem over a [`TreeStore`].
//!
//! Every operation is one store round trip and nothing is cached: the store
//! is the only source of truth. All store failures collapse into
//! [`FsError::NotFound`]; the underlying cause is logged here, at the
//! translation boundary, and not passed on.
//!
//! Paths are slash-delimited and passed through unchanged; `""` is the root.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};

use crate::handle::FileHandle;
use crate::store::{StoreError, TreeStore};

/// Permission bits reported for every node.
pub const PERM: u16 = 0o666;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
}

impl FsError {
    pub fn errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
        }
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(e: FsError) -> Self {
        e.errno().into()
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Logs a store failure and collapses it into `NotFound`.
pub(crate) fn not_found(op: &str, path: &str, err: StoreError) -> FsError {
    match err {
        // negative lookups are routine for the kernel
        StoreError::KeyNotFound(_) => debug!("{op} {path:?}: {err}"),
        _ => warn!("{op} {path:?} failed: {err}"),
    }
    FsError::NotFound
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
}

impl FileKind {
    pub fn mode(self) -> u32 {
        let fmt = match self {
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Regular => libc::S_IFREG,
        };
        fmt as u32 | PERM as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attr {
    pub kind: FileKind,
    pub size: u64,
}

impl Attr {
    pub fn dir() -> Self {
        Self {
            kind: FileKind::Directory,
            size: 0,
        }
    }

    pub fn regular(size: u64) -> Self {
        Self {
            kind: FileKind::Regular,
            size,
        }
    }

    pub fn mode(&self) -> u32 {
        self.kind.mode()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

pub struct PathFs<S> {
    store: Arc<S>,
}

impl<S> Clone for PathFs<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TreeStore> PathFs<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The root is synthetic and answered without touching the store.
    pub async fn getattr(&self, path: &str) -> FsResult<Attr> {
        if path.is_empty() {
            return Ok(Attr::dir());
        }
        let node = self
            .store
            .get(path, false, false)
            .await
            .map_err(|e| not_found("getattr", path, e))?;
        Ok(if node.dir {
            Attr::dir()
        } else {
            Attr::regular(node.value.len() as u64)
        })
    }

    /// Immediate children in store order. No attributes are fetched.
    pub async fn opendir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let node = self
            .store
            .get(path, false, false)
            .await
            .map_err(|e| not_found("opendir", path, e))?;
        Ok(node
            .nodes
            .iter()
            .map(|child| DirEntry {
                name: child.name().to_string(),
                kind: if child.dir {
                    FileKind::Directory
                } else {
                    FileKind::Regular
                },
            })
            .collect())
    }

    /// Creates the file or truncates an existing one, then opens it.
    pub async fn create(&self, path: &str, flags: u32, mode: u32) -> FsResult<FileHandle<S>> {
        debug!("create {path:?} flags={flags:#o} mode={mode:#o}");
        self.store
            .set(path, Bytes::new(), 0)
            .await
            .map_err(|e| not_found("create", path, e))?;
        Ok(FileHandle::new(path, Arc::clone(&self.store)))
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        if path.is_empty() {
            return Ok(());
        }
        debug!("mkdir {path:?} mode={mode:#o}");
        self.store
            .create_dir(path, 0)
            .await
            .map_err(|e| not_found("mkdir", path, e))
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        if path.is_empty() {
            return Ok(());
        }
        self.store
            .delete(path, false, false)
            .await
            .map_err(|e| not_found("unlink", path, e))
    }

    /// Removes the directory together with everything below it.
    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        if path.is_empty() {
            return Ok(());
        }
        self.store
            .delete(path, true, true)
            .await
            .map_err(|e| not_found("rmdir", path, e))
    }

    /// Flags are ignored. Directories cannot be opened as files.
    pub async fn open(&self, path: &str, flags: u32) -> FsResult<FileHandle<S>> {
        debug!("open {path:?} flags={flags:#o}");
        let node = self
            .store
            .get(path, false, false)
            .await
            .map_err(|e| not_found("open", path, e))?;
        if node.dir {
            warn!("open {path:?} refused: node is a directory");
            return Err(FsError::NotFound);
        }
        Ok(FileHandle::new(path, Arc::clone(&self.store)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTreeStore;

    fn fs() -> PathFs<InMemoryTreeStore> {
        PathFs::new(Arc::new(InMemoryTreeStore::new()))
    }

    #[test]
    fn modes_carry_fixed_permissions() {
        assert_eq!(Attr::dir().mode(), libc::S_IFDIR as u32 | 0o666);
        assert_eq!(Attr::regular(3).mode(), libc::S_IFREG as u32 | 0o666);
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn getattr_reports_kind_and_size() {
        let fs = fs();
        fs.store().set("dir/file", Bytes::from_static(b"hello"), 0).await.unwrap();
        assert_eq!(fs.getattr("dir").await, Ok(Attr::dir()));
        assert_eq!(fs.getattr("dir/file").await, Ok(Attr::regular(5)));
        assert_eq!(fs.getattr("nope").await, Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn opendir_names_are_last_segments() {
        let fs = fs();
        fs.mkdir("a", 0o755).await.unwrap();
        fs.mkdir("a/sub", 0o755).await.unwrap();
        fs.create("a/f.txt", 0, 0o644).await.unwrap();
        let mut entries = fs.opendir("a").await.unwrap();
        entries.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "f.txt".into(), kind: FileKind::Regular },
                DirEntry { name: "sub".into(), kind: FileKind::Directory },
            ]
        );
        assert_eq!(fs.opendir("missing").await, Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn store_failures_collapse_to_not_found() {
        let fs = fs();
        fs.mkdir("d", 0o755).await.unwrap();
        assert_eq!(fs.mkdir("d", 0o755).await, Err(FsError::NotFound));
        assert_eq!(fs.unlink("d").await, Err(FsError::NotFound));
        assert!(fs.create("d", 0, 0o644).await.is_err());
        fs.create("f", 0, 0o644).await.unwrap();
        assert_eq!(fs.rmdir("f").await, Err(FsError::NotFound));
        assert_eq!(fs.unlink("ghost").await, Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn open_rejects_directories_and_missing_paths() {
        let fs = fs();
        fs.mkdir("d", 0o755).await.unwrap();
        assert!(matches!(fs.open("d", 0).await, Err(FsError::NotFound)));
        assert!(matches!(fs.open("missing", 0).await, Err(FsError::NotFound)));
        fs.create("f", 0, 0o644).await.unwrap();
        assert_eq!(fs.open("f", 0).await.unwrap().path(), "f");
    }

    #[tokio::test]
    async fn create_truncates_existing_content() {
        let fs = fs();
        fs.store().set("f", Bytes::from_static(b"old"), 0).await.unwrap();
        fs.create("f", 0, 0o644).await.unwrap();
        assert_eq!(fs.getattr("f").await, Ok(Attr::regular(0)));
    }
}
