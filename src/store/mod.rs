//! Path-oriented facade over a hierarchical coordination store.
//!
//! The rest of the crate only speaks to the store through
//! [`CoordinationStore`]: get/set/create/delete/stat plus child listing, each
//! returning a status code and, for reads, the payload and node metadata.
//! Connection management, the wire protocol, and TLS live behind this trait
//! and are not part of this crate.
//!
//! # Watches
//!
//! A read can register a *one-shot* watch that fires on the next change to
//! the path (or its children, for child listings). A fired watch is spent;
//! observers re-issue the watch-read call in a loop to stay live. Watches are
//! surfaced as [`Watch`], a oneshot receiver: dropping the sender side (for
//! example because the underlying connection closed) cancels the watch.
//!
//! Watch registration follows the usual store semantics:
//!
//! - `get`/`children` with watch: the watch is only armed when the node
//!   exists, so those calls return `Option<Watch>`;
//! - `stat` with watch: always armed, and fires on creation of a missing
//!   node or deletion of an existing one.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

/// Raw result codes as reported by a ZooKeeper-style store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum ZkCode {
    Ok = 0,
    SystemError = -1,
    RuntimeInconsistency = -2,
    DataInconsistency = -3,
    ConnectionLoss = -4,
    MarshallingError = -5,
    Unimplemented = -6,
    OperationTimeout = -7,
    BadArguments = -8,
    ApiError = -100,
    NoNode = -101,
    NoAuth = -102,
    BadVersion = -103,
    NoChildrenForEphemerals = -108,
    NodeExists = -110,
    NotEmpty = -111,
    SessionExpired = -112,
    InvalidCallback = -113,
    InvalidAcl = -114,
    AuthFailed = -115,
    Closing = -116,
    Nothing = -117,
    SessionMoved = -118,
}

/// Classified outcome of one store round-trip.
///
/// Every operation in this crate reduces the store's status code to this
/// ternary-plus-one classification and reacts accordingly; `NodeExists` is
/// kept distinct because create-if-absent is the claim/election primitive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    /// The operation succeeded.
    Ok,
    /// The addressed node does not exist.
    NoNode,
    /// A create was attempted on a path that already holds a node.
    NodeExists,
    /// Any other (unexpected) status code.
    Error(i32),
}

impl StoreStatus {
    pub fn from_code(code: i32) -> Self {
        match ZkCode::from_i32(code) {
            Some(ZkCode::Ok) => StoreStatus::Ok,
            Some(ZkCode::NoNode) => StoreStatus::NoNode,
            Some(ZkCode::NodeExists) => StoreStatus::NodeExists,
            _ => StoreStatus::Error(code),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            StoreStatus::Ok => ZkCode::Ok as i32,
            StoreStatus::NoNode => ZkCode::NoNode as i32,
            StoreStatus::NodeExists => ZkCode::NodeExists as i32,
            StoreStatus::Error(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StoreStatus::Ok)
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreStatus::NoNode)
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, StoreStatus::NodeExists)
    }
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        match ZkCode::from_i32(code) {
            Some(sym) => write!(f, "{:?} ({})", sym, code),
            None => write!(f, "Unknown ({})", code),
        }
    }
}

/// Node metadata returned by reads and stat calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Data version, bumped on every set.
    pub version: i32,
    /// Last modification time in milliseconds since the epoch.
    pub mtime_ms: i64,
    /// Number of direct children.
    pub num_children: u32,
    /// Non-zero when the node is ephemeral (id of the owning session).
    pub ephemeral_owner: u64,
}

/// How a node should be created.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
    /// The store appends a monotonically increasing suffix to the name.
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Change notification delivered through a one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    Deleted(String),
    DataChanged(String),
    ChildrenChanged(String),
}

impl WatchEvent {
    pub fn path(&self) -> &str {
        match self {
            WatchEvent::Created(p)
            | WatchEvent::Deleted(p)
            | WatchEvent::DataChanged(p)
            | WatchEvent::ChildrenChanged(p) => p,
        }
    }
}

/// A pending one-shot watch.
///
/// Await [`Watch::wait`] for the next change, or [`Watch::wait_timeout`] for
/// the opt-in bounded wait. A fired watch must be re-registered by re-issuing
/// the original watch-read call.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    /// Creates a sender/receiver pair for store implementations.
    pub fn channel(path: impl Into<String>) -> (oneshot::Sender<WatchEvent>, Watch) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Watch {
                path: path.into(),
                rx,
            },
        )
    }

    /// The path this watch observes.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Blocks until the watch fires or is canceled by the store going away.
    pub async fn wait(self) -> Result<WatchEvent> {
        let path = self.path;
        self.rx.await.map_err(|_| Error::WatchCanceled(path))
    }

    /// Bounded variant of [`Watch::wait`].
    pub async fn wait_timeout(self, timeout: Duration) -> Result<WatchEvent> {
        let path = self.path.clone();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                operation: format!("watch on {}", path),
                waited: timeout,
            }),
        }
    }
}

/// Reply to a data read.
#[derive(Debug)]
pub struct GetReply {
    pub status: StoreStatus,
    pub data: Option<Bytes>,
    pub stat: Option<NodeStat>,
}

/// Reply to a child listing.
#[derive(Debug)]
pub struct ChildrenReply {
    pub status: StoreStatus,
    pub children: Vec<String>,
}

/// Reply to a stat call.
#[derive(Debug)]
pub struct StatReply {
    pub status: StoreStatus,
    pub stat: Option<NodeStat>,
}

/// Reply to a create. `created_path` carries the final name, which differs
/// from the requested path for sequential nodes.
#[derive(Debug)]
pub struct CreateReply {
    pub status: StoreStatus,
    pub created_path: Option<String>,
}

/// Path-addressed operations against the coordination store.
///
/// Implementations translate these calls onto the underlying client. A
/// transport-level failure (lost connection, serialization of the wire
/// protocol) is an `Err`; an unsuccessful status from a healthy store is a
/// normal reply that callers classify.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<GetReply>;

    /// Read with a one-shot watch on the node's next data change or deletion.
    /// The watch is only armed when the node exists.
    async fn get_with_watch(&self, path: &str) -> Result<(GetReply, Option<Watch>)>;

    async fn children(&self, path: &str) -> Result<ChildrenReply>;

    /// List with a one-shot watch on the node's next child change or deletion.
    /// The watch is only armed when the node exists.
    async fn children_with_watch(&self, path: &str) -> Result<(ChildrenReply, Option<Watch>)>;

    async fn set(&self, path: &str, data: Bytes) -> Result<StoreStatus>;

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<CreateReply>;

    async fn delete(&self, path: &str) -> Result<StoreStatus>;

    async fn stat(&self, path: &str) -> Result<StatReply>;

    /// Stat with a watch that is always armed: fires on creation of a missing
    /// node, or on the next change or deletion of an existing one.
    async fn stat_with_watch(&self, path: &str) -> Result<(StatReply, Watch)>;

    /// Ends the session, releasing ephemeral nodes owned by it.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(StoreStatus::from_code(0), StoreStatus::Ok);
        assert_eq!(StoreStatus::from_code(-101), StoreStatus::NoNode);
        assert_eq!(StoreStatus::from_code(-110), StoreStatus::NodeExists);
        assert_eq!(StoreStatus::from_code(-4), StoreStatus::Error(-4));
        assert_eq!(StoreStatus::from_code(-999), StoreStatus::Error(-999));
    }

    #[test]
    fn test_status_round_trips_code() {
        for code in [0, -101, -110, -111, -112, -999] {
            assert_eq!(StoreStatus::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_status_display_is_symbolic_when_known() {
        assert_eq!(StoreStatus::from_code(-111).to_string(), "NotEmpty (-111)");
        assert_eq!(
            StoreStatus::from_code(-999).to_string(),
            "Unknown (-999)"
        );
    }

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(!CreateMode::Ephemeral.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
    }

    #[tokio::test]
    async fn test_watch_delivers_event() {
        let (tx, watch) = Watch::channel("/a/b");
        tx.send(WatchEvent::DataChanged("/a/b".to_string())).unwrap();
        let event = watch.wait().await.unwrap();
        assert_eq!(event, WatchEvent::DataChanged("/a/b".to_string()));
    }

    #[tokio::test]
    async fn test_watch_canceled_when_sender_dropped() {
        let (tx, watch) = Watch::channel("/a/b");
        drop(tx);
        let err = watch.wait().await.unwrap_err();
        assert!(matches!(err, Error::WatchCanceled(p) if p == "/a/b"));
    }

    #[tokio::test]
    async fn test_watch_timeout() {
        let (_tx, watch) = Watch::channel("/slow");
        let err = watch
            .wait_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
