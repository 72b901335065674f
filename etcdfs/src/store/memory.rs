//! In-memory tree store with etcd v2 style semantics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use super::{Node, StoreError, StoreResult, TreeStore, ancestors, key_of};

#[derive(Clone, Debug)]
enum Entry {
    File { value: Bytes, ttl: u64 },
    Dir { ttl: u64 },
}

impl Entry {
    fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir { .. })
    }
}

/// Keyed by canonical store key. The root (`"/"`) is implicit.
#[derive(Default)]
pub struct InMemoryTreeStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    requests: AtomicU64,
}

impl InMemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store operations served so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// TTL recorded for `path`, if the node exists.
    pub fn ttl_of(&self, path: &str) -> Option<u64> {
        match self.lock().get(&key_of(path))? {
            Entry::File { ttl, .. } | Entry::Dir { ttl } => Some(*ttl),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.lock()
    }
}

fn child_base(key: &str) -> String {
    if key == "/" {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

/// Keys of the immediate children of the directory `key`, in key order.
fn child_keys(entries: &BTreeMap<String, Entry>, key: &str) -> Vec<String> {
    let base = child_base(key);
    entries
        .range(base.clone()..)
        .take_while(|(k, _)| k.starts_with(&base))
        .filter(|(k, _)| !k[base.len()..].contains('/'))
        .map(|(k, _)| k.clone())
        .collect()
}

fn build_node(
    entries: &BTreeMap<String, Entry>,
    key: &str,
    descend: bool,
    recursive: bool,
    sorted: bool,
) -> Node {
    if key != "/" {
        if let Some(Entry::File { value, .. }) = entries.get(key) {
            // children listed by a non-recursive read carry no content
            let value = if descend { value.clone() } else { Bytes::new() };
            return Node::file(key, value);
        }
    }
    if !descend {
        return Node::dir(key, Vec::new());
    }
    let mut nodes: Vec<Node> = child_keys(entries, key)
        .iter()
        .map(|child| build_node(entries, child, recursive, recursive, sorted))
        .collect();
    if sorted {
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
    }
    Node::dir(key, nodes)
}

/// Checks that every ancestor of `key` is a directory or absent.
fn check_ancestors(entries: &BTreeMap<String, Entry>, key: &str) -> StoreResult<()> {
    for anc in ancestors(key) {
        if let Some(Entry::File { .. }) = entries.get(anc) {
            return Err(StoreError::NotADir(anc.to_string()));
        }
    }
    Ok(())
}

fn create_ancestors(entries: &mut BTreeMap<String, Entry>, key: &str) {
    for anc in ancestors(key) {
        entries
            .entry(anc.to_string())
            .or_insert(Entry::Dir { ttl: 0 });
    }
}

fn remove_subtree(entries: &mut BTreeMap<String, Entry>, key: &str) {
    let base = child_base(key);
    let doomed: Vec<String> = entries
        .range(base.clone()..)
        .take_while(|(k, _)| k.starts_with(&base))
        .map(|(k, _)| k.clone())
        .collect();
    for k in doomed {
        entries.remove(&k);
    }
    entries.remove(key);
}

#[async_trait]
impl TreeStore for InMemoryTreeStore {
    async fn get(&self, path: &str, recursive: bool, sorted: bool) -> StoreResult<Node> {
        let key = key_of(path);
        let entries = self.begin();
        if key != "/" && !entries.contains_key(&key) {
            return Err(StoreError::KeyNotFound(key));
        }
        Ok(build_node(&entries, &key, true, recursive, sorted))
    }

    async fn set(&self, path: &str, value: Bytes, ttl: u64) -> StoreResult<()> {
        let key = key_of(path);
        let mut entries = self.begin();
        if key == "/" {
            return Err(StoreError::RootReadOnly);
        }
        if entries.get(&key).is_some_and(Entry::is_dir) {
            return Err(StoreError::NotAFile(key));
        }
        check_ancestors(&entries, &key)?;
        create_ancestors(&mut entries, &key);
        entries.insert(key, Entry::File { value, ttl });
        Ok(())
    }

    async fn delete(&self, path: &str, recursive: bool, dir: bool) -> StoreResult<()> {
        let key = key_of(path);
        let mut entries = self.begin();
        if key == "/" {
            return Err(StoreError::RootReadOnly);
        }
        let Some(entry) = entries.get(&key) else {
            return Err(StoreError::KeyNotFound(key));
        };
        if entry.is_dir() {
            if !dir && !recursive {
                return Err(StoreError::NotAFile(key));
            }
            if !recursive && !child_keys(&entries, &key).is_empty() {
                return Err(StoreError::DirNotEmpty(key));
            }
        } else if dir {
            return Err(StoreError::NotADir(key));
        }
        remove_subtree(&mut entries, &key);
        Ok(())
    }

    async fn create_dir(&self, path: &str, ttl: u64) -> StoreResult<()> {
        let key = key_of(path);
        let mut entries = self.begin();
        if key == "/" || entries.contains_key(&key) {
            return Err(StoreError::NodeExist(key));
        }
        check_ancestors(&entries, &key)?;
        create_ancestors(&mut entries, &key);
        entries.insert(key, Entry::Dir { ttl });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_creates_parents_and_get_lists_children() {
        let store = InMemoryTreeStore::new();
        store.set("a/b/c", Bytes::from_static(b"v"), 0).await.unwrap();
        store.set("a/d", Bytes::from_static(b"w"), 0).await.unwrap();

        let a = store.get("a", false, true).await.unwrap();
        assert!(a.dir);
        let keys: Vec<_> = a.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/b", "/a/d"]);
        assert!(a.nodes[0].dir);
        assert!(a.nodes[0].nodes.is_empty(), "non-recursive read stops at children");
        assert!(a.nodes[1].value.is_empty(), "non-recursive read lists names only");
        assert_eq!(store.get("a/d", false, false).await.unwrap().value, Bytes::from_static(b"w"));
    }

    #[tokio::test]
    async fn recursive_get_returns_subtree() {
        let store = InMemoryTreeStore::new();
        store.set("x/y/z", Bytes::from_static(b"1"), 0).await.unwrap();
        let root = store.get("", true, false).await.unwrap();
        assert_eq!(root.key, "/");
        assert_eq!(root.nodes[0].key, "/x");
        assert_eq!(root.nodes[0].nodes[0].key, "/x/y");
        assert_eq!(root.nodes[0].nodes[0].nodes[0].value, Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn kind_conflicts_are_rejected() {
        let store = InMemoryTreeStore::new();
        store.create_dir("d", 0).await.unwrap();
        store.set("f", Bytes::new(), 0).await.unwrap();

        assert!(matches!(store.set("d", Bytes::new(), 0).await, Err(StoreError::NotAFile(_))));
        assert!(matches!(store.create_dir("d", 0).await, Err(StoreError::NodeExist(_))));
        assert!(matches!(store.create_dir("f", 0).await, Err(StoreError::NodeExist(_))));
        assert!(matches!(store.set("f/g", Bytes::new(), 0).await, Err(StoreError::NotADir(_))));
        assert!(matches!(store.delete("d", false, false).await, Err(StoreError::NotAFile(_))));
        assert!(matches!(store.delete("f", true, true).await, Err(StoreError::NotADir(_))));
    }

    #[tokio::test]
    async fn delete_respects_emptiness_unless_recursive() {
        let store = InMemoryTreeStore::new();
        store.set("d/e/f", Bytes::new(), 0).await.unwrap();
        assert!(matches!(store.delete("d", false, true).await, Err(StoreError::DirNotEmpty(_))));
        store.delete("d", true, true).await.unwrap();
        assert!(matches!(store.get("d/e/f", false, false).await, Err(StoreError::KeyNotFound(_))));
        assert!(matches!(store.delete("", true, true).await, Err(StoreError::RootReadOnly)));
    }

    #[tokio::test]
    async fn ttl_is_recorded_and_requests_counted() {
        let store = InMemoryTreeStore::new();
        store.set("t", Bytes::new(), 30).await.unwrap();
        assert_eq!(store.ttl_of("t"), Some(30));
        assert_eq!(store.ttl_of("missing"), None);
        assert_eq!(store.request_count(), 1);
    }
}
