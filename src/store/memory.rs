//! In-memory coordination store for testing.
//!
//! [`MemoryStore`] implements the full [`CoordinationStore`] contract against
//! a shared in-process tree: ephemeral nodes tied to a session, sequential
//! name suffixes, and one-shot watches that fire on the next mutation.
//!
//! Multiple sessions against the same tree are created with
//! [`MemoryStore::session`]; closing a session removes its ephemeral nodes
//! and fires the relevant watches, which is how tests exercise instance
//! deregistration and claim release on disconnect.
//!
//! Available in unit tests and behind the `test-utilities` feature:
//!
//! ```toml
//! [dev-dependencies]
//! zkafka = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, Result};
use crate::store::{
    ChildrenReply, CoordinationStore, CreateMode, CreateReply, GetReply, NodeStat, StatReply,
    StoreStatus, Watch, WatchEvent,
};

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    version: i32,
    mtime_ms: i64,
    ephemeral_owner: u64,
    /// Counter for sequential child names, mirrors the parent cversion trick.
    next_sequence: u64,
}

impl Node {
    fn new(data: Bytes, ephemeral_owner: u64) -> Self {
        Node {
            data,
            version: 0,
            mtime_ms: Utc::now().timestamp_millis(),
            ephemeral_owner,
            next_sequence: 0,
        }
    }

    fn stat(&self, num_children: u32) -> NodeStat {
        NodeStat {
            version: self.version,
            mtime_ms: self.mtime_ms,
            num_children,
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

type Watchers = HashMap<String, Vec<oneshot::Sender<WatchEvent>>>;

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    data_watches: Watchers,
    child_watches: Watchers,
    exist_watches: Watchers,
    next_session: u64,
}

impl Inner {
    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| {
                let name = &key[prefix.len()..];
                !name.is_empty() && !name.contains('/')
            })
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    fn fire(watches: &mut Watchers, path: &str, event: WatchEvent) {
        if let Some(senders) = watches.remove(path) {
            for sender in senders {
                // A dropped receiver just means the observer went away.
                let _ = sender.send(event.clone());
            }
        }
    }

    fn fire_data(&mut self, path: &str, event: WatchEvent) {
        Self::fire(&mut self.data_watches, path, event.clone());
        Self::fire(&mut self.exist_watches, path, event);
    }

    fn fire_children(&mut self, parent: &str) {
        Self::fire(
            &mut self.child_watches,
            parent,
            WatchEvent::ChildrenChanged(parent.to_string()),
        );
    }
}

/// Shared in-memory store handle; one handle is one session.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    session_id: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.nodes.insert("/".to_string(), Node::new(Bytes::new(), 0));
        inner.next_session = 2;
        MemoryStore {
            inner: Arc::new(Mutex::new(inner)),
            session_id: 1,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens a new session against the same tree.
    pub async fn session(&self) -> MemoryStore {
        let mut inner = self.inner.lock().await;
        let session_id = inner.next_session;
        inner.next_session += 1;
        MemoryStore {
            inner: self.inner.clone(),
            session_id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seeds a persistent node, creating missing ancestors with empty data.
    pub async fn put(&self, path: &str, data: impl Into<Bytes>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut ancestors = Vec::new();
        let mut current = parent_of(path);
        while current != "/" && !inner.nodes.contains_key(current) {
            ancestors.push(current.to_string());
            current = parent_of(current);
        }
        for ancestor in ancestors.into_iter().rev() {
            inner
                .nodes
                .insert(ancestor.clone(), Node::new(Bytes::new(), 0));
        }
        inner
            .nodes
            .insert(path.to_string(), Node::new(data.into(), 0));
        Ok(())
    }

    /// Returns the node payload, if present. Test inspection helper.
    pub async fn peek(&self, path: &str) -> Option<Bytes> {
        let inner = self.inner.lock().await;
        inner.nodes.get(path).map(|node| node.data.clone())
    }

    fn ensure_open(&self, path: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Store {
                path: path.to_string(),
                status: StoreStatus::from_code(-116),
            });
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<GetReply> {
        self.ensure_open(path)?;
        let inner = self.inner.lock().await;
        match inner.nodes.get(path) {
            Some(node) => Ok(GetReply {
                status: StoreStatus::Ok,
                data: Some(node.data.clone()),
                stat: Some(node.stat(inner.children_of(path).len() as u32)),
            }),
            None => Ok(GetReply {
                status: StoreStatus::NoNode,
                data: None,
                stat: None,
            }),
        }
    }

    async fn get_with_watch(&self, path: &str) -> Result<(GetReply, Option<Watch>)> {
        self.ensure_open(path)?;
        let mut inner = self.inner.lock().await;
        match inner.nodes.get(path) {
            Some(node) => {
                let reply = GetReply {
                    status: StoreStatus::Ok,
                    data: Some(node.data.clone()),
                    stat: Some(node.stat(inner.children_of(path).len() as u32)),
                };
                let (tx, watch) = Watch::channel(path);
                inner
                    .data_watches
                    .entry(path.to_string())
                    .or_default()
                    .push(tx);
                Ok((reply, Some(watch)))
            }
            None => Ok((
                GetReply {
                    status: StoreStatus::NoNode,
                    data: None,
                    stat: None,
                },
                None,
            )),
        }
    }

    async fn children(&self, path: &str) -> Result<ChildrenReply> {
        self.ensure_open(path)?;
        let inner = self.inner.lock().await;
        if inner.nodes.contains_key(path) {
            Ok(ChildrenReply {
                status: StoreStatus::Ok,
                children: inner.children_of(path),
            })
        } else {
            Ok(ChildrenReply {
                status: StoreStatus::NoNode,
                children: Vec::new(),
            })
        }
    }

    async fn children_with_watch(&self, path: &str) -> Result<(ChildrenReply, Option<Watch>)> {
        self.ensure_open(path)?;
        let mut inner = self.inner.lock().await;
        if inner.nodes.contains_key(path) {
            let reply = ChildrenReply {
                status: StoreStatus::Ok,
                children: inner.children_of(path),
            };
            let (tx, watch) = Watch::channel(path);
            inner
                .child_watches
                .entry(path.to_string())
                .or_default()
                .push(tx);
            Ok((reply, Some(watch)))
        } else {
            Ok((
                ChildrenReply {
                    status: StoreStatus::NoNode,
                    children: Vec::new(),
                },
                None,
            ))
        }
    }

    async fn set(&self, path: &str, data: Bytes) -> Result<StoreStatus> {
        self.ensure_open(path)?;
        let mut inner = self.inner.lock().await;
        match inner.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                node.version += 1;
                node.mtime_ms = Utc::now().timestamp_millis();
                inner.fire_data(path, WatchEvent::DataChanged(path.to_string()));
                Ok(StoreStatus::Ok)
            }
            None => Ok(StoreStatus::NoNode),
        }
    }

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<CreateReply> {
        self.ensure_open(path)?;
        let mut inner = self.inner.lock().await;
        let parent = parent_of(path).to_string();
        let sequence = match inner.nodes.get_mut(&parent) {
            None => {
                return Ok(CreateReply {
                    status: StoreStatus::NoNode,
                    created_path: None,
                })
            }
            Some(node) if node.ephemeral_owner != 0 => {
                return Ok(CreateReply {
                    status: StoreStatus::from_code(-108),
                    created_path: None,
                })
            }
            Some(node) => {
                let seq = node.next_sequence;
                if mode.is_sequential() {
                    node.next_sequence += 1;
                }
                seq
            }
        };

        let final_path = if mode.is_sequential() {
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };
        if inner.nodes.contains_key(&final_path) {
            return Ok(CreateReply {
                status: StoreStatus::NodeExists,
                created_path: None,
            });
        }

        let owner = if mode.is_ephemeral() { self.session_id } else { 0 };
        inner
            .nodes
            .insert(final_path.clone(), Node::new(data, owner));
        Inner::fire(
            &mut inner.exist_watches,
            &final_path,
            WatchEvent::Created(final_path.clone()),
        );
        inner.fire_children(&parent);
        Ok(CreateReply {
            status: StoreStatus::Ok,
            created_path: Some(final_path),
        })
    }

    async fn delete(&self, path: &str) -> Result<StoreStatus> {
        self.ensure_open(path)?;
        let mut inner = self.inner.lock().await;
        if !inner.nodes.contains_key(path) {
            return Ok(StoreStatus::NoNode);
        }
        if !inner.children_of(path).is_empty() {
            return Ok(StoreStatus::from_code(-111));
        }
        inner.nodes.remove(path);
        inner.fire_data(path, WatchEvent::Deleted(path.to_string()));
        Inner::fire(
            &mut inner.child_watches,
            path,
            WatchEvent::Deleted(path.to_string()),
        );
        inner.fire_children(parent_of(path));
        Ok(StoreStatus::Ok)
    }

    async fn stat(&self, path: &str) -> Result<StatReply> {
        self.ensure_open(path)?;
        let inner = self.inner.lock().await;
        match inner.nodes.get(path) {
            Some(node) => Ok(StatReply {
                status: StoreStatus::Ok,
                stat: Some(node.stat(inner.children_of(path).len() as u32)),
            }),
            None => Ok(StatReply {
                status: StoreStatus::NoNode,
                stat: None,
            }),
        }
    }

    async fn stat_with_watch(&self, path: &str) -> Result<(StatReply, Watch)> {
        self.ensure_open(path)?;
        let mut inner = self.inner.lock().await;
        let reply = match inner.nodes.get(path) {
            Some(node) => StatReply {
                status: StoreStatus::Ok,
                stat: Some(node.stat(inner.children_of(path).len() as u32)),
            },
            None => StatReply {
                status: StoreStatus::NoNode,
                stat: None,
            },
        };
        let (tx, watch) = Watch::channel(path);
        inner
            .exist_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((reply, watch))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let ephemerals: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == self.session_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            inner.nodes.remove(&path);
            inner.fire_data(&path, WatchEvent::Deleted(path.clone()));
            inner.fire_children(parent_of(&path));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let reply = store
            .create("/a/b", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(reply.status, StoreStatus::NoNode);

        store
            .create("/a", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let reply = store
            .create("/a/b", Bytes::from_static(b"x"), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(reply.status, StoreStatus::Ok);
        assert_eq!(reply.created_path.as_deref(), Some("/a/b"));
    }

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        store.put("/claims", "").await.unwrap();
        let first = store
            .create("/claims/p0", Bytes::from_static(b"a"), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(first.status, StoreStatus::Ok);
        let second = store
            .create("/claims/p0", Bytes::from_static(b"b"), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(second.status, StoreStatus::NodeExists);
    }

    #[tokio::test]
    async fn test_sequential_names_increase() {
        let store = MemoryStore::new();
        store.put("/config/changes", "").await.unwrap();
        let a = store
            .create(
                "/config/changes/config_change_",
                Bytes::new(),
                CreateMode::PersistentSequential,
            )
            .await
            .unwrap();
        let b = store
            .create(
                "/config/changes/config_change_",
                Bytes::new(),
                CreateMode::PersistentSequential,
            )
            .await
            .unwrap();
        let a = a.created_path.unwrap();
        let b = b.created_path.unwrap();
        assert!(a < b, "{} should sort before {}", a, b);
        assert!(a.starts_with("/config/changes/config_change_"));
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty() {
        let store = MemoryStore::new();
        store.put("/a/b", "x").await.unwrap();
        assert_eq!(
            store.delete("/a").await.unwrap(),
            StoreStatus::from_code(-111)
        );
        assert_eq!(store.delete("/a/b").await.unwrap(), StoreStatus::Ok);
        assert_eq!(store.delete("/a").await.unwrap(), StoreStatus::Ok);
    }

    #[tokio::test]
    async fn test_session_close_removes_ephemerals_and_fires_watches() {
        let store = MemoryStore::new();
        store.put("/ids", "").await.unwrap();

        let session = store.session().await;
        session
            .create("/ids/inst-1", Bytes::from_static(b"{}"), CreateMode::Ephemeral)
            .await
            .unwrap();

        let (reply, watch) = store.get_with_watch("/ids/inst-1").await.unwrap();
        assert_eq!(reply.status, StoreStatus::Ok);

        session.close().await.unwrap();
        let event = watch.unwrap().wait().await.unwrap();
        assert_eq!(event, WatchEvent::Deleted("/ids/inst-1".to_string()));

        // Persistent nodes survive the session.
        assert_eq!(store.stat("/ids").await.unwrap().status, StoreStatus::Ok);
        assert_eq!(
            store.stat("/ids/inst-1").await.unwrap().status,
            StoreStatus::NoNode
        );
    }

    #[tokio::test]
    async fn test_child_watch_fires_once() {
        let store = MemoryStore::new();
        store.put("/group/ids", "").await.unwrap();
        let (reply, watch) = store.children_with_watch("/group/ids").await.unwrap();
        assert!(reply.children.is_empty());

        store
            .create("/group/ids/a", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        let event = watch.unwrap().wait().await.unwrap();
        assert_eq!(event, WatchEvent::ChildrenChanged("/group/ids".to_string()));

        // The watch was one-shot; a second change needs a new registration.
        let (reply, watch) = store.children_with_watch("/group/ids").await.unwrap();
        assert_eq!(reply.children, vec!["a".to_string()]);
        store
            .create("/group/ids/b", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        watch.unwrap().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_exists_watch_fires_on_create() {
        let store = MemoryStore::new();
        store.put("/brokers/topics", "").await.unwrap();
        let (reply, watch) = store.stat_with_watch("/brokers/topics/new").await.unwrap();
        assert_eq!(reply.status, StoreStatus::NoNode);

        store
            .create("/brokers/topics/new", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let event = watch.wait().await.unwrap();
        assert_eq!(event, WatchEvent::Created("/brokers/topics/new".to_string()));
    }

    #[tokio::test]
    async fn test_set_bumps_version_and_mtime() {
        let store = MemoryStore::new();
        store.put("/node", "v0").await.unwrap();
        let before = store.stat("/node").await.unwrap().stat.unwrap();
        store.set("/node", Bytes::from_static(b"v1")).await.unwrap();
        let after = store.stat("/node").await.unwrap().stat.unwrap();
        assert_eq!(after.version, before.version + 1);
        assert_eq!(
            store.get("/node").await.unwrap().data.unwrap(),
            Bytes::from_static(b"v1")
        );
    }
}
