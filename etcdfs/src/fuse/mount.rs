//! Mount helpers for starting/stopping FUSE
//!
//! Only supported on Linux, where the mount goes through `fusermount3` so no
//! root privileges are needed.

use std::path::Path;

use rfuse3::MountOptions;

use super::EtcdFuse;
use crate::store::TreeStore;

pub const FS_NAME: &str = "etcdfs";

/// Mount options for etcdfs: owned by the invoking user, no `allow_other`.
pub fn default_mount_options() -> MountOptions {
    // SAFETY: getuid/getgid have no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let mut mo = MountOptions::default();
    mo.fs_name(FS_NAME).uid(uid).gid(gid);
    mo
}

/// Mount `fs` on the given empty directory in unprivileged mode.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<S>(
    fs: EtcdFuse<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: TreeStore + 'static,
{
    let session = rfuse3::raw::Session::new(default_mount_options());
    session
        .mount_with_unprivileged(fs, mount_point.as_ref())
        .await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<S>(
    _fs: EtcdFuse<S>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: TreeStore + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
