//! etcd v3 backend.
//!
//! etcd v3 has a flat key space, so the tree is emulated:
//! - a file at `/a/b` is the key `{prefix}/a/b` holding the content
//! - a directory at `/a` is the marker key `{prefix}/a/` with an empty value
//! - children of `/a` are every key in the `{prefix}/a/` range; the first
//!   segment after the base names the child, and a child with a marker or
//!   deeper keys is a directory
//!
//! Keys written by other clients need no marker: any key in the `{prefix}/a/`
//! range makes `/a` a directory, and the kind guards on `set` and
//! `create_dir` check the whole range, not just the marker.
//!
//! A non-recursive read lists the directory range keys only, so its size is
//! bounded by the number of keys below it rather than by their content.
//!
//! Every primitive is a single request or a single transaction, so a failed
//! guard never leaves a half-applied write behind.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, KeyValue, KvClient,
    PutOptions, SortOrder, SortTarget, Txn, TxnOp, TxnOpResponse, TxnResponse,
};
use log::{debug, info};

use super::{Node, StoreError, StoreResult, TreeStore, ancestors, key_of};
use crate::config::EtcdConfig;

/// Largest response accepted from etcd; recursive reads return whole subtrees.
const MAX_DECODING_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct EtcdTreeStore {
    client: Client,
    kv: KvClient,
    prefix: String,
}

impl EtcdTreeStore {
    pub async fn connect(cfg: &EtcdConfig) -> StoreResult<Self> {
        let mut opts = ConnectOptions::new().with_connect_timeout(cfg.connect_timeout);
        if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
            opts = opts.with_user(user.clone(), password.clone());
        }
        info!("connecting to etcd at {:?}", cfg.endpoints);
        let client = Client::connect(&cfg.endpoints, Some(opts)).await?;
        Ok(Self::new(client, &cfg.prefix))
    }

    pub fn new(client: Client, prefix: &str) -> Self {
        let kv = client
            .kv_client()
            .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE);
        Self {
            client,
            kv,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Round trip to etcd that reads at most one key name under the prefix.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut kv = self.kv.clone();
        let opts = GetOptions::new().with_prefix().with_keys_only().with_limit(1);
        kv.get(self.dir_key("/"), Some(opts)).await?;
        Ok(())
    }

    /// etcd key holding the content of the file at `key`.
    fn file_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// etcd key marking the directory at `key`; also the base of its children.
    /// For the root this is the bare prefix range `{prefix}/`.
    fn dir_key(&self, key: &str) -> String {
        if key == "/" {
            format!("{}/", self.prefix)
        } else {
            format!("{}{key}/", self.prefix)
        }
    }

    /// Guard asserting nothing is stored at or below the directory `key`.
    fn dir_absent(&self, key: &str) -> Compare {
        Compare::version(self.dir_key(key), CompareOp::Equal, 0).with_prefix()
    }

    /// Keys-only probe for anything at or below the directory `key`.
    fn dir_probe(&self, key: &str) -> TxnOp {
        TxnOp::get(
            self.dir_key(key),
            Some(GetOptions::new().with_prefix().with_keys_only().with_limit(1)),
        )
    }

    /// Guards asserting no ancestor of `key` is stored as a file.
    fn ancestors_not_files(&self, key: &str) -> Vec<Compare> {
        ancestors(key)
            .into_iter()
            .map(|anc| Compare::version(self.file_key(anc), CompareOp::Equal, 0))
            .collect()
    }

    /// Marker writes for every ancestor of `key`.
    fn ancestor_markers(&self, key: &str) -> Vec<TxnOp> {
        ancestors(key)
            .into_iter()
            .map(|anc| TxnOp::put(self.dir_key(anc), "", None))
            .collect()
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        let mut kv = self.kv.clone();
        Ok(kv.txn(txn).await?)
    }

    fn range_options(recursive: bool, sorted: bool) -> GetOptions {
        let mut opts = GetOptions::new().with_prefix();
        if !recursive {
            opts = opts.with_keys_only();
        }
        if sorted {
            opts.with_sort(SortTarget::Key, SortOrder::Ascend)
        } else {
            opts
        }
    }

    /// Turns the `kvs` of a directory range into its child nodes.
    fn children(&self, key: &str, kvs: &[KeyValue], recursive: bool, sorted: bool) -> Vec<Node> {
        let base = self.dir_key(key);
        let below: Vec<(String, Bytes)> = kvs
            .iter()
            .filter_map(|kv| {
                let k = String::from_utf8_lossy(kv.key());
                let rel = k.strip_prefix(base.as_str())?;
                Some((rel.to_string(), Bytes::copy_from_slice(kv.value())))
            })
            .collect();
        let mut nodes = build_children(key, below, recursive);
        if sorted {
            nodes.sort_by(|a, b| a.key.cmp(&b.key));
        }
        nodes
    }
}

#[derive(Default)]
struct ChildGroup {
    value: Option<Bytes>,
    dir: bool,
    below: Vec<(String, Bytes)>,
}

/// Groups `(relative key, value)` pairs under `parent` by first segment,
/// keeping the order in which children first appear.
fn build_children(parent: &str, entries: Vec<(String, Bytes)>, recursive: bool) -> Vec<Node> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, ChildGroup> = HashMap::new();
    for (rel, value) in entries {
        let (name, rest) = match rel.find('/') {
            Some(i) => (rel[..i].to_string(), Some(rel[i + 1..].to_string())),
            None => (rel, None),
        };
        if name.is_empty() {
            continue;
        }
        let group = groups.entry(name.clone()).or_insert_with(|| {
            order.push(name);
            ChildGroup::default()
        });
        match rest {
            None => group.value = Some(value),
            Some(rest) => {
                group.dir = true;
                if !rest.is_empty() {
                    group.below.push((rest, value));
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let group = groups.remove(&name)?;
            let key = if parent == "/" {
                format!("/{name}")
            } else {
                format!("{parent}/{name}")
            };
            Some(if group.dir {
                let nodes = if recursive {
                    build_children(&key, group.below, true)
                } else {
                    Vec::new()
                };
                Node::dir(key, nodes)
            } else {
                Node::file(key, group.value.unwrap_or_default())
            })
        })
        .collect()
}

fn kvs_at(responses: &[TxnOpResponse], idx: usize) -> &[KeyValue] {
    match responses.get(idx) {
        Some(TxnOpResponse::Get(resp)) => resp.kvs(),
        _ => &[],
    }
}

fn deleted(responses: &[TxnOpResponse]) -> i64 {
    responses
        .iter()
        .map(|r| match r {
            TxnOpResponse::Delete(resp) => resp.deleted(),
            _ => 0,
        })
        .sum()
}

#[async_trait]
impl TreeStore for EtcdTreeStore {
    async fn get(&self, path: &str, recursive: bool, sorted: bool) -> StoreResult<Node> {
        let key = key_of(path);
        debug!("etcd get {key} recursive={recursive} sorted={sorted}");
        if key == "/" {
            let mut kv = self.kv.clone();
            let resp = kv
                .get(self.dir_key(&key), Some(Self::range_options(recursive, sorted)))
                .await?;
            return Ok(Node::dir(
                key.clone(),
                self.children(&key, resp.kvs(), recursive, sorted),
            ));
        }

        let txn = Txn::new().and_then(vec![
            TxnOp::get(self.file_key(&key), None),
            TxnOp::get(self.dir_key(&key), Some(Self::range_options(recursive, sorted))),
        ]);
        let responses = self.txn(txn).await?.op_responses();
        if let Some(kv) = kvs_at(&responses, 0).first() {
            return Ok(Node::file(key, Bytes::copy_from_slice(kv.value())));
        }
        let range = kvs_at(&responses, 1);
        if range.is_empty() {
            return Err(StoreError::KeyNotFound(key));
        }
        let nodes = self.children(&key, range, recursive, sorted);
        Ok(Node::dir(key, nodes))
    }

    async fn set(&self, path: &str, value: Bytes, ttl: u64) -> StoreResult<()> {
        let key = key_of(path);
        if key == "/" {
            return Err(StoreError::RootReadOnly);
        }
        debug!("etcd set {key} ({} bytes, ttl={ttl})", value.len());

        let mut put_opts = PutOptions::new();
        if ttl > 0 {
            let mut client = self.client.clone();
            let lease = client.lease_grant(ttl as i64, None).await?;
            put_opts = put_opts.with_lease(lease.id());
        }

        let mut guards = vec![self.dir_absent(&key)];
        guards.extend(self.ancestors_not_files(&key));
        let mut writes = vec![TxnOp::put(self.file_key(&key), value.to_vec(), Some(put_opts))];
        writes.extend(self.ancestor_markers(&key));
        let txn = Txn::new()
            .when(guards)
            .and_then(writes)
            .or_else(vec![self.dir_probe(&key)]);

        let resp = self.txn(txn).await?;
        if resp.succeeded() {
            return Ok(());
        }
        if kvs_at(&resp.op_responses(), 0).is_empty() {
            Err(StoreError::NotADir(key))
        } else {
            Err(StoreError::NotAFile(key))
        }
    }

    async fn delete(&self, path: &str, recursive: bool, dir: bool) -> StoreResult<()> {
        let key = key_of(path);
        if key == "/" {
            return Err(StoreError::RootReadOnly);
        }
        debug!("etcd delete {key} recursive={recursive} dir={dir}");
        let subtree = || TxnOp::delete(self.dir_key(&key), Some(DeleteOptions::new().with_prefix()));

        match (recursive, dir) {
            (false, false) => {
                let txn = Txn::new()
                    .when(vec![self.dir_absent(&key)])
                    .and_then(vec![TxnOp::delete(self.file_key(&key), None)]);
                let resp = self.txn(txn).await?;
                if !resp.succeeded() {
                    return Err(StoreError::NotAFile(key));
                }
                if deleted(&resp.op_responses()) == 0 {
                    return Err(StoreError::KeyNotFound(key));
                }
                Ok(())
            }
            (true, true) => {
                let txn = Txn::new()
                    .when(vec![Compare::version(self.file_key(&key), CompareOp::Equal, 0)])
                    .and_then(vec![subtree()]);
                let resp = self.txn(txn).await?;
                if !resp.succeeded() {
                    return Err(StoreError::NotADir(key));
                }
                if deleted(&resp.op_responses()) == 0 {
                    return Err(StoreError::KeyNotFound(key));
                }
                Ok(())
            }
            (true, false) => {
                let txn = Txn::new().and_then(vec![
                    TxnOp::delete(self.file_key(&key), None),
                    subtree(),
                ]);
                let resp = self.txn(txn).await?;
                if deleted(&resp.op_responses()) == 0 {
                    return Err(StoreError::KeyNotFound(key));
                }
                Ok(())
            }
            (false, true) => {
                let marker = self.dir_key(&key);
                let probe = Txn::new().and_then(vec![
                    TxnOp::get(self.file_key(&key), Some(GetOptions::new().with_keys_only())),
                    TxnOp::get(
                        marker.clone(),
                        Some(GetOptions::new().with_prefix().with_keys_only().with_limit(2)),
                    ),
                ]);
                let responses = self.txn(probe).await?.op_responses();
                if !kvs_at(&responses, 0).is_empty() {
                    return Err(StoreError::NotADir(key));
                }
                let range = kvs_at(&responses, 1);
                if range.is_empty() {
                    return Err(StoreError::KeyNotFound(key));
                }
                if range.iter().any(|kv| kv.key() != marker.as_bytes()) {
                    return Err(StoreError::DirNotEmpty(key));
                }
                let mut client = self.client.clone();
                client.delete(marker, None).await?;
                Ok(())
            }
        }
    }

    async fn create_dir(&self, path: &str, ttl: u64) -> StoreResult<()> {
        let key = key_of(path);
        if key == "/" {
            return Err(StoreError::NodeExist(key));
        }
        debug!("etcd mkdir {key} ttl={ttl}");

        let mut put_opts = PutOptions::new();
        if ttl > 0 {
            let mut client = self.client.clone();
            let lease = client.lease_grant(ttl as i64, None).await?;
            put_opts = put_opts.with_lease(lease.id());
        }

        let mut guards = vec![
            Compare::version(self.file_key(&key), CompareOp::Equal, 0),
            self.dir_absent(&key),
        ];
        guards.extend(self.ancestors_not_files(&key));
        let mut writes = vec![TxnOp::put(self.dir_key(&key), "", Some(put_opts))];
        writes.extend(self.ancestor_markers(&key));
        let txn = Txn::new().when(guards).and_then(writes).or_else(vec![
            TxnOp::get(self.file_key(&key), Some(GetOptions::new().with_keys_only())),
            self.dir_probe(&key),
        ]);

        let resp = self.txn(txn).await?;
        if resp.succeeded() {
            return Ok(());
        }
        let responses = resp.op_responses();
        if kvs_at(&responses, 0).is_empty() && kvs_at(&responses, 1).is_empty() {
            Err(StoreError::NotADir(key))
        } else {
            Err(StoreError::NodeExist(key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(pairs: &[(&str, &str)]) -> Vec<(String, Bytes)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }

    #[test]
    fn children_classify_markers_and_deeper_keys() {
        let nodes = build_children(
            "/",
            rel(&[("a", "x"), ("b/", ""), ("c/d", "y"), ("c/", "")]),
            false,
        );
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], Node::file("/a", "x"));
        assert_eq!(nodes[1], Node::dir("/b", vec![]));
        assert_eq!(nodes[2], Node::dir("/c", vec![]));
    }

    #[test]
    fn children_recurse_on_request() {
        let nodes = build_children("/top", rel(&[("c/", ""), ("c/d", "y"), ("c/e/", "")]), true);
        assert_eq!(
            nodes,
            vec![Node::dir(
                "/top/c",
                vec![Node::file("/top/c/d", "y"), Node::dir("/top/c/e", vec![])]
            )]
        );
    }

    #[test]
    fn children_skip_empty_segments() {
        let nodes = build_children("/", rel(&[("", ""), ("/odd", "z")]), false);
        assert!(nodes.is_empty());
    }
}
