//! Cluster metadata directory.
//!
//! [`Cluster`] is the entry point of the crate: it owns the store handle and
//! cached views of brokers, topics and consumer groups. Caches fill lazily,
//! are replaced wholesale under a lock (never partially), and are dropped by
//! [`Cluster::reset_metadata`] or by any topology-changing write.
//!
//! Fetches fan out one task per independent store round-trip and join before
//! returning; the first failing task aborts the whole batch. The cache lock
//! is only held while installing the assembled result, so two concurrent
//! refreshes of a cold cache may each perform their own fetch.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use crate::consumer::Consumergroup;
use crate::error::{Error, Result};
use crate::store::{CoordinationStore, CreateMode};

pub mod broker;
pub mod config;
pub mod partition;
pub mod paths;
pub mod topic;

pub use broker::{Broker, BrokerId};
pub use config::ClusterOptions;
pub use partition::{Partition, PartitionId};
pub use topic::{Preload, Topic};

/// A handle to one Kafka cluster's control-plane metadata.
///
/// Cheap to clone; clones share the store connection and all caches.
#[derive(Clone)]
pub struct Cluster {
    store: Arc<dyn CoordinationStore>,
    options: ClusterOptions,
    brokers: Arc<Mutex<Option<HashMap<BrokerId, Broker>>>>,
    topics: Arc<Mutex<Option<HashMap<String, Topic>>>>,
    consumergroups: Arc<Mutex<Option<Vec<Consumergroup>>>>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Cluster::with_options(store, ClusterOptions::default())
    }

    pub fn with_options(store: Arc<dyn CoordinationStore>, options: ClusterOptions) -> Self {
        Cluster {
            store,
            options,
            brokers: Arc::new(Mutex::new(None)),
            topics: Arc::new(Mutex::new(None)),
            consumergroups: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn options(&self) -> ClusterOptions {
        self.options
    }

    /// All live brokers, keyed by id.
    ///
    /// A broker disappearing between the id listing and its payload fetch is
    /// skipped, not an error. An absent broker root means no Kafka cluster
    /// uses this store.
    pub async fn brokers(&self) -> Result<HashMap<BrokerId, Broker>> {
        if let Some(cached) = self.brokers.lock().await.as_ref() {
            return Ok(cached.clone());
        }

        let listing = self.store.children(paths::BROKER_IDS).await?;
        match listing.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Err(Error::NoClusterRegistered),
            status => {
                return Err(Error::Store {
                    path: paths::BROKER_IDS.to_string(),
                    status,
                })
            }
        }

        let mut tasks = JoinSet::new();
        for child in listing.children {
            let id: BrokerId = child.parse().map_err(|_| {
                Error::Validation(format!("Invalid broker id {:?} in broker registry", child))
            })?;
            let store = Arc::clone(&self.store);
            tasks.spawn(async move {
                let path = paths::broker(id);
                let reply = store.get(&path).await?;
                match reply.status {
                    s if s.is_ok() => {
                        let data = reply.data.as_deref().unwrap_or_default();
                        Ok(Some(Broker::from_json(id, data, &path)?))
                    }
                    s if s.is_no_node() => Ok(None),
                    status => Err(Error::Store { path, status }),
                }
            });
        }

        let mut brokers = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(broker) = joined?? {
                brokers.insert(broker.id, broker);
            }
        }

        debug!(brokers = brokers.len(), "refreshed broker registry");
        *self.brokers.lock().await = Some(brokers.clone());
        Ok(brokers)
    }

    /// All topics, keyed by name, with the default preload (partitions eager,
    /// config lazy).
    pub async fn topics(&self) -> Result<HashMap<String, Topic>> {
        self.topics_with(Preload::default()).await
    }

    /// All topics, keyed by name, eager-loading according to `preload`.
    pub async fn topics_with(&self, preload: Preload) -> Result<HashMap<String, Topic>> {
        let cached = self.topics.lock().await.clone();
        let topics = match cached {
            Some(topics) => topics,
            None => {
                let listing = self.store.children(paths::TOPICS).await?;
                match listing.status {
                    s if s.is_ok() => {}
                    s if s.is_no_node() => return Err(Error::NoClusterRegistered),
                    status => {
                        return Err(Error::Store {
                            path: paths::TOPICS.to_string(),
                            status,
                        })
                    }
                }
                let topics: HashMap<String, Topic> = listing
                    .children
                    .into_iter()
                    .map(|name| (name.clone(), Topic::new(name)))
                    .collect();
                debug!(topics = topics.len(), "refreshed topic registry");
                *self.topics.lock().await = Some(topics.clone());
                topics
            }
        };

        if preload.partitions || preload.config {
            let mut tasks = JoinSet::new();
            for topic in topics.values().cloned() {
                let cluster = self.clone();
                tasks.spawn(async move {
                    if preload.partitions {
                        topic.partitions(&cluster).await?;
                    }
                    if preload.config {
                        topic.config(&cluster).await?;
                    }
                    Ok::<_, Error>(())
                });
            }
            while let Some(joined) = tasks.join_next().await {
                joined??;
            }
        }
        Ok(topics)
    }

    /// Looks up one topic by name.
    pub async fn topic(&self, name: &str) -> Result<Option<Topic>> {
        Ok(self.topics_with(Preload::NONE).await?.get(name).cloned())
    }

    /// Every partition of every topic.
    pub async fn partitions(&self) -> Result<Vec<Partition>> {
        let topics = self.topics().await?;
        let mut partitions = Vec::new();
        for topic in topics.values() {
            partitions.extend(topic.partitions(self).await?);
        }
        Ok(partitions)
    }

    /// True when any partition in the cluster is under-replicated.
    /// Short-circuits on the first hit.
    pub async fn under_replicated(&self) -> Result<bool> {
        for partition in self.partitions().await? {
            if partition.under_replicated(self).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Creates a topic, placing replicas against the current cluster load,
    /// and blocks until every partition reports a leader.
    pub async fn create_topic(
        &self,
        name: impl Into<String>,
        partitions: u32,
        replication_factor: usize,
        config: HashMap<String, String>,
    ) -> Result<Topic> {
        if partitions == 0 {
            return Err(Error::Validation(
                "A topic needs at least one partition".to_string(),
            ));
        }
        if replication_factor == 0 {
            return Err(Error::Validation(
                "The replication factor must be at least one".to_string(),
            ));
        }

        let name = name.into();
        let mut assigner = crate::assignment::ReplicaAssigner::for_cluster(self).await?;
        let mut layout = Vec::with_capacity(partitions as usize);
        for id in 0..partitions {
            let replicas = assigner.assign(replication_factor)?;
            layout.push(Partition::new(name.clone(), id, replicas));
        }

        let topic = Topic::new(name);
        topic.create(self, layout, config).await?;
        Ok(topic)
    }

    /// Requests a preferred leader election for the given partitions, or for
    /// the whole cluster when `partitions` is `None`.
    pub async fn preferred_leader_election(
        &self,
        partitions: Option<Vec<Partition>>,
    ) -> Result<()> {
        let partitions = match partitions {
            Some(partitions) => partitions,
            None => self.partitions().await?,
        };
        let listed: Vec<serde_json::Value> = partitions
            .iter()
            .map(|p| {
                serde_json::json!({
                    "topic": p.topic_name(),
                    "partition": p.id(),
                })
            })
            .collect();
        let payload = Bytes::from(serde_json::to_vec(&serde_json::json!({
            "version": 1,
            "partitions": listed,
        }))?);

        let path = paths::PREFERRED_REPLICA_ELECTION;
        let mut reply = self
            .store
            .create(path, payload.clone(), CreateMode::Persistent)
            .await?;
        if reply.status.is_no_node() {
            self.recursive_create(paths::parent(path)).await?;
            reply = self
                .store
                .create(path, payload, CreateMode::Persistent)
                .await?;
        }
        match reply.status {
            s if s.is_ok() => Ok(()),
            s if s.is_node_exists() => Err(Error::ElectionInProgress),
            status => Err(Error::Store {
                path: path.to_string(),
                status,
            }),
        }
    }

    /// All consumer groups registered in the store. A cluster without the
    /// consumer root simply has no groups.
    pub async fn consumergroups(&self) -> Result<Vec<Consumergroup>> {
        if let Some(cached) = self.consumergroups.lock().await.as_ref() {
            return Ok(cached.clone());
        }

        let listing = self.store.children(paths::CONSUMERS).await?;
        let groups = match listing.status {
            s if s.is_ok() => listing
                .children
                .into_iter()
                .map(Consumergroup::new)
                .collect(),
            s if s.is_no_node() => Vec::new(),
            status => {
                return Err(Error::Store {
                    path: paths::CONSUMERS.to_string(),
                    status,
                })
            }
        };

        *self.consumergroups.lock().await = Some(groups.clone());
        Ok(groups)
    }

    /// A handle to one consumer group, registered or not.
    pub fn consumergroup(&self, name: impl Into<String>) -> Consumergroup {
        Consumergroup::new(name)
    }

    /// Drops all cached metadata; the next access re-reads the store.
    pub async fn reset_metadata(&self) {
        *self.brokers.lock().await = None;
        *self.topics.lock().await = None;
        *self.consumergroups.lock().await = None;
    }

    /// Ends the store session. Ephemeral nodes owned by it are released.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    /// Creates `path` and any missing ancestors, top-down. Losing a creation
    /// race to a concurrent caller is fine.
    pub async fn recursive_create(&self, path: &str) -> Result<()> {
        if path == "/" || path.is_empty() {
            return Ok(());
        }

        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            let stat = self.store.stat(&prefix).await?;
            if stat.status.is_ok() {
                continue;
            }
            let reply = self
                .store
                .create(&prefix, Bytes::new(), CreateMode::Persistent)
                .await?;
            match reply.status {
                s if s.is_ok() || s.is_node_exists() => {}
                status => {
                    return Err(Error::Store {
                        path: prefix,
                        status,
                    })
                }
            }
        }
        Ok(())
    }

    /// Deletes `path` and everything below it, fanning out one task per
    /// child. Deleting an absent path is a no-op.
    pub async fn recursive_delete(&self, path: &str) -> Result<()> {
        recursive_delete_owned(self.clone(), path.to_string()).await
    }
}

fn recursive_delete_owned(
    cluster: Cluster,
    path: String,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let listing = cluster.store.children(&path).await?;
        match listing.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Ok(()),
            status => return Err(Error::Store { path, status }),
        }

        let mut tasks = JoinSet::new();
        for child in listing.children {
            let child_path = paths::join(&path, &child);
            tasks.spawn(recursive_delete_owned(cluster.clone(), child_path));
        }
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let status = cluster.store.delete(&path).await?;
        match status {
            s if s.is_ok() || s.is_no_node() => Ok(()),
            status => Err(Error::Store { path, status }),
        }
    })
}
