//! FUSE adapter
//!
//! Bridges the inode-based `rfuse3` raw API to the path-based [`PathFs`].
//! The bridge owns the only per-mount state: the inode table and the open
//! file handles. Attributes and entries are replied with a zero TTL so the
//! kernel asks again on every access.
//!
//! Submodules:
//! - `inode`: inode <-> path table
//! - `mount`: mount helpers
pub mod inode;
pub mod mount;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use log::debug;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};

use crate::fs::{Attr, FileKind, PERM, PathFs};
use crate::handle::FileHandle;
use crate::store::TreeStore;
use inode::{InodeTable, ROOT_INO, UNKNOWN_INO, parent_of};

const TTL: Duration = Duration::ZERO;
const MAX_WRITE: u32 = 1024 * 1024;

pub struct EtcdFuse<S> {
    fs: PathFs<S>,
    inodes: InodeTable,
    handles: Mutex<HashMap<u64, Arc<FileHandle<S>>>>,
    next_fh: AtomicU64,
}

impl<S: TreeStore> EtcdFuse<S> {
    pub fn new(fs: PathFs<S>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, Arc<FileHandle<S>>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_handle(&self, handle: FileHandle<S>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(fh, Arc::new(handle));
        fh
    }

    fn path(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or_else(|| libc::ENOENT.into())
    }

    fn child(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        self.inodes
            .child_path(parent, &name.to_string_lossy())
            .ok_or_else(|| libc::ENOENT.into())
    }

    /// Handle registered as `fh`, or a fresh one opened on the inode's path.
    async fn handle_for(&self, ino: u64, fh: u64) -> FuseResult<Arc<FileHandle<S>>> {
        let known = self.handles().get(&fh).cloned();
        if let Some(handle) = known {
            return Ok(handle);
        }
        let path = self.path(ino)?;
        Ok(Arc::new(self.fs.open(&path, 0).await?))
    }

    /// Entry reply for `path`; counts one kernel lookup on its inode.
    fn entry(&self, path: &str, attr: Attr, req: &Request) -> ReplyEntry {
        let ino = self.inodes.lookup(path);
        ReplyEntry {
            ttl: TTL,
            attr: fuse_attr(ino, &attr, req),
            generation: 0,
        }
    }
}

impl<S> Filesystem for EtcdFuse<S>
where
    S: TreeStore + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.handles().clear();
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        let attr = self.fs.getattr(&path).await?;
        Ok(self.entry(&path, attr, &req))
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        let attr = self.fs.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: fuse_attr(ino, &attr, &req),
        })
    }

    // Only size changes are supported: O_TRUNC and ftruncate land here.
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        if let Some(size) = set_attr.size {
            let handle = self.handle_for(ino, fh.unwrap_or(0)).await?;
            handle.truncate(size).await?;
        }
        let path = self.path(ino)?;
        let attr = self.fs.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: fuse_attr(ino, &attr, &req),
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let handle = self.fs.open(&path, flags).await?;
        let fh = self.insert_handle(handle);
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child(parent, name)?;
        let handle = self.fs.create(&path, flags, mode).await?;
        let fh = self.insert_handle(handle);
        let ino = self.inodes.lookup(&path);
        Ok(ReplyCreated {
            ttl: TTL,
            attr: fuse_attr(ino, &Attr::regular(0), &req),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        self.fs.mkdir(&path, mode).await?;
        Ok(self.entry(&path, Attr::dir(), &req))
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.fs.unlink(&path).await?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.fs.rmdir(&path).await?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let attr = self.fs.getattr(&path).await?;
        if attr.kind != FileKind::Directory {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path(ino)?;
        let children = self.fs.opendir(&path).await?;

        // listings hand out no kernel references, so nothing is allocated here
        let parent_ino = if ino == ROOT_INO {
            ROOT_INO
        } else {
            self.inodes.peek(parent_of(&path)).unwrap_or(UNKNOWN_INO)
        };
        let mut all = Vec::with_capacity(children.len() + 2);
        all.push((ino, FuseFileType::Directory, OsString::from(".")));
        all.push((parent_ino, FuseFileType::Directory, OsString::from("..")));
        for child in children {
            let child_ino = self
                .inodes
                .peek(&inode::join(&path, &child.name))
                .unwrap_or(UNKNOWN_INO);
            all.push((child_ino, fuse_kind(child.kind), OsString::from(child.name)));
        }

        // offset is the cookie of the last entry the kernel already has
        let skip = usize::try_from(offset).unwrap_or(0);
        let entries: Vec<FuseResult<DirectoryEntry>> = all
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(i, (inode, kind, name))| {
                Ok(DirectoryEntry {
                    inode,
                    kind,
                    name,
                    offset: i as i64 + 1,
                })
            })
            .collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let handle = self.handle_for(ino, fh).await?;
        let data: Bytes = handle.read_at(offset, size as usize).await?;
        Ok(ReplyData { data })
    }

    // Whole-value semantics: every write replaces the content, whatever the offset.
    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let handle = self.handle_for(ino, fh).await?;
        if offset != 0 {
            debug!("write to {:?} at offset {offset} replaces whole value", handle.path());
        }
        let written = handle.write(data).await?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.handles().remove(&fh);
        Ok(())
    }

    // Nothing is buffered, so there is nothing to push out.
    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes.forget(inode, nlookup);
        }
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn fuse_kind(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::Directory => FuseFileType::Directory,
        FileKind::Regular => FuseFileType::RegularFile,
    }
}

fn fuse_attr(ino: u64, attr: &Attr, req: &Request) -> FileAttr {
    // no timestamps are stored; report the time of the request
    let now = Timestamp::from(SystemTime::now());
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        #[cfg(target_os = "macos")]
        crtime: now,
        kind: fuse_kind(attr.kind),
        perm: PERM,
        nlink: match attr.kind {
            FileKind::Directory => 2,
            FileKind::Regular => 1,
        },
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
