//! Open file handles.
//!
//! A handle only remembers which key it was opened against. It buffers
//! nothing: reads fetch the whole value again, writes replace the whole value.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::fs::{FsError, FsResult, not_found};
use crate::store::TreeStore;

pub struct FileHandle<S> {
    path: String,
    store: Arc<S>,
}

impl<S> std::fmt::Debug for FileHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("path", &self.path).finish()
    }
}

impl<S: TreeStore> FileHandle<S> {
    pub(crate) fn new(path: &str, store: Arc<S>) -> Self {
        Self {
            path: path.to_string(),
            store,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current content of the file.
    pub async fn read(&self) -> FsResult<Bytes> {
        let node = self
            .store
            .get(&self.path, false, false)
            .await
            .map_err(|e| not_found("read", &self.path, e))?;
        if node.dir {
            return Err(FsError::NotFound);
        }
        Ok(node.value)
    }

    /// Up to `size` bytes of the current content starting at `offset`.
    pub async fn read_at(&self, offset: u64, size: usize) -> FsResult<Bytes> {
        let value = self.read().await?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(value.len());
        let end = start.saturating_add(size).min(value.len());
        Ok(value.slice(start..end))
    }

    /// Replaces the whole content with `data`; returns the number of bytes stored.
    pub async fn write(&self, data: &[u8]) -> FsResult<usize> {
        self.store
            .set(&self.path, Bytes::copy_from_slice(data), 0)
            .await
            .map_err(|e| not_found("write", &self.path, e))?;
        Ok(data.len())
    }

    /// Cuts the content to `size` bytes, zero-filling when it grows.
    pub async fn truncate(&self, size: u64) -> FsResult<()> {
        let size = usize::try_from(size).map_err(|_| FsError::NotFound)?;
        let value = if size == 0 {
            Bytes::new()
        } else {
            let current = self.read().await?;
            let mut buf = BytesMut::from(&current[..current.len().min(size)]);
            buf.resize(size, 0);
            buf.freeze()
        };
        self.store
            .set(&self.path, value, 0)
            .await
            .map_err(|e| not_found("truncate", &self.path, e))
    }
}
