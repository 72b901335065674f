//! Runs against a live etcd. Set ETCDFS_ETCD_ENDPOINT (e.g. http://127.0.0.1:2379)
//! to enable; each test works under its own key prefix, removed when the test
//! ends whether it passed or not.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use etcd_client::{Client, DeleteOptions};
use etcdfs::config::EtcdConfig;
use etcdfs::fs::{Attr, FileKind, FsError, PathFs};
use etcdfs::store::{EtcdTreeStore, StoreError, TreeStore};

/// Deletes every key under `prefix` on drop.
struct PrefixGuard {
    endpoint: String,
    prefix: String,
}

impl PrefixGuard {
    async fn raw_client(&self) -> Client {
        Client::connect([self.endpoint.as_str()], None)
            .await
            .expect("connect etcd")
    }
}

impl Drop for PrefixGuard {
    fn drop(&mut self) {
        let endpoint = self.endpoint.clone();
        let prefix = self.prefix.clone();
        // the test runtime may be unwinding, so clean up on a runtime of our own
        let cleaned = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| e.to_string())?;
            rt.block_on(async {
                let mut client = Client::connect([endpoint], None).await?;
                client
                    .delete(prefix, Some(DeleteOptions::new().with_prefix()))
                    .await
                    .map(|_| ())
            })
            .map_err(|e| e.to_string())
        })
        .join();
        match cleaned {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("cleanup of {} failed: {e}", self.prefix),
            Err(_) => eprintln!("cleanup of {} panicked", self.prefix),
        }
    }
}

async fn store(test: &str) -> Option<(EtcdTreeStore, PrefixGuard)> {
    let Ok(endpoint) = std::env::var("ETCDFS_ETCD_ENDPOINT") else {
        eprintln!("skip {test}: set ETCDFS_ETCD_ENDPOINT to enable");
        return None;
    };
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let prefix = format!("/etcdfs-test/{test}-{nanos}");
    let guard = PrefixGuard {
        endpoint: endpoint.clone(),
        prefix: prefix.clone(),
    };
    let mut cfg = EtcdConfig::from_endpoint(&endpoint).expect("endpoint");
    cfg.prefix = prefix;
    let store = EtcdTreeStore::connect(&cfg).await.expect("connect etcd");
    Some((store, guard))
}

#[tokio::test]
async fn tree_semantics_on_etcd() {
    let Some((store, _guard)) = store("tree").await else {
        return;
    };

    store.set("a/b/c", Bytes::from_static(b"v"), 0).await.unwrap();
    store.create_dir("d", 0).await.unwrap();

    let root = store.get("", false, true).await.unwrap();
    let keys: Vec<_> = root.nodes.iter().map(|n| (n.key.as_str(), n.dir)).collect();
    assert_eq!(keys, vec![("/a", true), ("/d", true)]);

    let deep = store.get("a", true, true).await.unwrap();
    assert_eq!(deep.nodes[0].key, "/a/b");
    assert_eq!(deep.nodes[0].nodes[0].value, Bytes::from_static(b"v"));

    assert!(matches!(store.set("d", Bytes::new(), 0).await, Err(StoreError::NotAFile(_))));
    assert!(matches!(store.create_dir("d", 0).await, Err(StoreError::NodeExist(_))));
    assert!(matches!(store.set("a/b/c/x", Bytes::new(), 0).await, Err(StoreError::NotADir(_))));
    assert!(matches!(store.delete("d", false, false).await, Err(StoreError::NotAFile(_))));
    assert!(matches!(store.delete("a", false, true).await, Err(StoreError::DirNotEmpty(_))));
    store.delete("d", false, true).await.unwrap();
    store.delete("a", true, true).await.unwrap();
    assert!(matches!(store.get("a/b/c", false, false).await, Err(StoreError::KeyNotFound(_))));
}

#[tokio::test]
async fn foreign_directories_are_recognised() {
    let Some((store, guard)) = store("foreign").await else {
        return;
    };
    // written by another client: no directory markers anywhere
    let mut raw = guard.raw_client().await;
    raw.put(format!("{}/ext/deep/x", guard.prefix), "1", None)
        .await
        .expect("raw put");

    let ext = store.get("ext", false, true).await.unwrap();
    assert!(ext.dir);
    assert_eq!(ext.nodes.len(), 1);
    assert_eq!(ext.nodes[0].key, "/ext/deep");
    assert!(ext.nodes[0].dir);

    assert!(matches!(store.create_dir("ext", 0).await, Err(StoreError::NodeExist(_))));
    assert!(matches!(store.create_dir("ext/deep", 0).await, Err(StoreError::NodeExist(_))));
    assert!(matches!(store.set("ext", Bytes::new(), 0).await, Err(StoreError::NotAFile(_))));
    assert!(matches!(store.delete("ext", false, false).await, Err(StoreError::NotAFile(_))));
    assert!(matches!(
        store.get("ext", false, false).await,
        Ok(node) if node.dir
    ));
}

#[tokio::test]
async fn listing_large_directory_reads_keys_only() {
    let Some((store, _guard)) = store("large").await else {
        return;
    };
    // 5 MiB of content in total, over the 4 MiB gRPC default
    let chunk = Bytes::from(vec![b'x'; 1024 * 1024]);
    for i in 0..5 {
        store.set(&format!("big/f{i}"), chunk.clone(), 0).await.unwrap();
    }

    store.ping().await.expect("ping");
    let fs = PathFs::new(Arc::new(store.clone()));
    assert_eq!(fs.getattr("big").await, Ok(Attr::dir()));
    assert_eq!(fs.getattr("big/f0").await, Ok(Attr::regular(1024 * 1024)));
    let entries = fs.opendir("big").await.expect("opendir");
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|e| e.kind == FileKind::Regular));

    let listed = store.get("big", false, true).await.unwrap();
    assert!(listed.nodes.iter().all(|n| n.value.is_empty()));
    let full = store.get("big", true, true).await.expect("recursive get");
    assert!(full.nodes.iter().all(|n| n.value.len() == 1024 * 1024));
}

#[tokio::test]
async fn path_fs_on_etcd() {
    let Some((store, _guard)) = store("fs").await else {
        return;
    };
    let fs = PathFs::new(Arc::new(store));

    fs.mkdir("dir", 0o755).await.unwrap();
    let handle = fs.create("dir/file", 0, 0o644).await.unwrap();
    assert_eq!(fs.getattr("dir/file").await, Ok(Attr::regular(0)));
    handle.write(b"payload").await.unwrap();
    assert_eq!(handle.read().await.unwrap(), Bytes::from_static(b"payload"));

    let entries = fs.opendir("dir").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "file");
    assert_eq!(entries[0].kind, FileKind::Regular);

    assert!(matches!(fs.open("dir", 0).await, Err(FsError::NotFound)));
    fs.unlink("dir/file").await.unwrap();
    assert_eq!(fs.getattr("dir/file").await, Err(FsError::NotFound));
    fs.rmdir("dir").await.unwrap();
    assert!(fs.opendir("").await.map(|e| e.is_empty()).unwrap_or(true));
}
