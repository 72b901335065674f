//! Inode numbers for paths.
//!
//! The kernel addresses nodes by inode while the filesystem works on paths,
//! so the bridge keeps a two-way map. Inode 1 is the root (`""`). Numbers are
//! handed out in order and never reused within a mount.
//!
//! An entry lives as long as the kernel holds a reference to it: every reply
//! that hands an inode to the kernel counts one lookup, and `forget` gives
//! them back. The root is pinned.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const ROOT_INO: u64 = 1;

/// Reported in directory listings for children the kernel has not looked up.
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

struct Slot {
    path: String,
    lookups: u64,
}

struct Inner {
    next: u64,
    by_ino: HashMap<u64, Slot>,
    by_path: HashMap<String, u64>,
}

pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            Slot {
                path: String::new(),
                lookups: 1,
            },
        );
        by_path.insert(String::new(), ROOT_INO);
        Self {
            inner: Mutex::new(Inner {
                next: ROOT_INO + 1,
                by_ino,
                by_path,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.lock().by_ino.get(&ino).map(|slot| slot.path.clone())
    }

    /// Inode already assigned to `path`, if any. Never allocates.
    pub fn peek(&self, path: &str) -> Option<u64> {
        self.lock().by_path.get(path).copied()
    }

    /// Inode for `path`, allocating one on first sight, with one more
    /// lookup counted against it.
    pub fn lookup(&self, path: &str) -> u64 {
        let mut inner = self.lock();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(slot) = inner.by_ino.get_mut(&ino) {
                slot.lookups += 1;
            }
            return ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.by_ino.insert(
            ino,
            Slot {
                path: path.to_string(),
                lookups: 1,
            },
        );
        inner.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Gives back `n` lookups; the entry is dropped once none are left.
    pub fn forget(&self, ino: u64, n: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.lock();
        let Some(slot) = inner.by_ino.get_mut(&ino) else {
            return;
        };
        slot.lookups = slot.lookups.saturating_sub(n);
        if slot.lookups > 0 {
            return;
        }
        if let Some(slot) = inner.by_ino.remove(&ino) {
            inner.by_path.remove(&slot.path);
        }
    }

    /// Path of `name` inside the directory with inode `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent = self.path_of(parent)?;
        Some(join(&parent, name))
    }

    /// Drops `path` and every path below it.
    pub fn remove(&self, path: &str) {
        if path.is_empty() {
            return;
        }
        let below = format!("{path}/");
        let mut inner = self.lock();
        let doomed: Vec<String> = inner
            .by_path
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&below))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(ino) = inner.by_path.remove(&p) {
                inner.by_ino.remove(&ino);
            }
        }
    }

    /// Number of live entries, root included.
    pub fn count(&self) -> usize {
        self.lock().by_ino.len()
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Path of the directory containing `path`; the root is its own parent.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}
