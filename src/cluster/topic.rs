//! Topics: partition layout, configuration, and lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cluster::partition::Partition;
use crate::cluster::{paths, Cluster};
use crate::error::{Error, Result};
use crate::store::{CreateMode, WatchEvent};

/// Which parts of a topic to eager-load when listing the cluster's topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preload {
    pub partitions: bool,
    pub config: bool,
}

impl Preload {
    pub const NONE: Preload = Preload {
        partitions: false,
        config: false,
    };
    /// Partition layout only; config stays lazy.
    pub const DEFAULT: Preload = Preload {
        partitions: true,
        config: false,
    };
    pub const ALL: Preload = Preload {
        partitions: true,
        config: true,
    };
}

impl Default for Preload {
    fn default() -> Self {
        Preload::DEFAULT
    }
}

/// A topic registered in the cluster.
///
/// The partition layout and the config map are fetched lazily and cached in
/// the `Topic` value; clones share the caches. Mutating operations refresh
/// both the topic's own caches and the cluster-level metadata cache.
#[derive(Debug, Clone)]
pub struct Topic {
    name: String,
    partitions: Arc<Mutex<Option<Vec<Partition>>>>,
    config: Arc<Mutex<Option<HashMap<String, String>>>>,
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Topic {}

#[derive(Debug, Deserialize)]
struct TopicAssignment {
    version: i64,
    partitions: HashMap<String, Vec<u32>>,
}

#[derive(Debug, Deserialize)]
struct TopicConfigPayload {
    version: i64,
    config: HashMap<String, String>,
}

/// Checks the broker-side naming rules: `[A-Za-z0-9._-]+`, at most 255
/// characters, and neither `.` nor `..`.
pub fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Topic name must not be empty".to_string()));
    }
    if name.len() > 255 {
        return Err(Error::Validation(format!(
            "Topic name {:?} is longer than 255 characters",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::Validation(format!(
            "Topic name must not be {:?}",
            name
        )));
    }
    for ch in name.chars() {
        if !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-') {
            return Err(Error::Validation(format!(
                "Topic name {:?} contains the invalid character {:?}",
                name, ch
            )));
        }
    }
    Ok(())
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic {
            name: name.into(),
            partitions: Arc::new(Mutex::new(None)),
            config: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the topic's assignment node is present in the store.
    pub async fn exists(&self, cluster: &Cluster) -> Result<bool> {
        let reply = cluster.store().stat(&paths::topic(&self.name)).await?;
        match reply.status {
            s if s.is_ok() => Ok(true),
            s if s.is_no_node() => Ok(false),
            status => Err(Error::Store {
                path: paths::topic(&self.name),
                status,
            }),
        }
    }

    /// The topic's partitions, ordered by partition id.
    pub async fn partitions(&self, cluster: &Cluster) -> Result<Vec<Partition>> {
        let mut guard = self.partitions.lock().await;
        if let Some(partitions) = guard.as_ref() {
            return Ok(partitions.clone());
        }
        let fetched = self.fetch_partitions(cluster).await?;
        *guard = Some(fetched.clone());
        Ok(fetched)
    }

    /// The topic's replication factor: the smallest replica count across its
    /// partitions.
    pub async fn replication_factor(&self, cluster: &Cluster) -> Result<usize> {
        self.partitions(cluster)
            .await?
            .iter()
            .map(Partition::replication_factor)
            .min()
            .ok_or_else(|| {
                Error::Validation(format!("Topic {} has no partitions", self.name))
            })
    }

    /// True when any partition of this topic is under-replicated.
    pub async fn under_replicated(&self, cluster: &Cluster) -> Result<bool> {
        for partition in self.partitions(cluster).await? {
            if partition.under_replicated(cluster).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Checks the topic name and every partition's replica assignment.
    pub async fn validate(&self, cluster: &Cluster) -> Result<()> {
        validate_topic_name(&self.name)?;
        let partitions = self.partitions(cluster).await?;
        if partitions.is_empty() {
            return Err(Error::Validation(format!(
                "Topic {} has no partitions",
                self.name
            )));
        }
        for partition in &partitions {
            partition.validate()?;
        }
        Ok(())
    }

    /// Registers the topic in the store and blocks until every partition has
    /// an elected leader.
    ///
    /// Writes the config node first, then the assignment node; leader
    /// election is performed asynchronously by the cluster controller, so the
    /// final wait is a bounded poll.
    pub(crate) async fn create(
        &self,
        cluster: &Cluster,
        partitions: Vec<Partition>,
        config: HashMap<String, String>,
    ) -> Result<()> {
        if self.exists(cluster).await? {
            return Err(Error::TopicAlreadyExists(self.name.clone()));
        }
        validate_topic_name(&self.name)?;
        if partitions.is_empty() {
            return Err(Error::Validation(format!(
                "Topic {} needs at least one partition",
                self.name
            )));
        }
        for partition in &partitions {
            partition.validate()?;
        }

        info!(
            topic = %self.name,
            partitions = partitions.len(),
            "creating topic"
        );

        let config_path = paths::topic_config(&self.name);
        let payload = Bytes::from(serde_json::to_vec(&serde_json::json!({
            "version": 1,
            "config": ordered(&config),
        }))?);
        let mut reply = cluster
            .store()
            .create(&config_path, payload.clone(), CreateMode::Persistent)
            .await?;
        if reply.status.is_no_node() {
            cluster.recursive_create(paths::parent(&config_path)).await?;
            reply = cluster
                .store()
                .create(&config_path, payload, CreateMode::Persistent)
                .await?;
        }
        if !reply.status.is_ok() {
            return Err(Error::Store {
                path: config_path,
                status: reply.status,
            });
        }

        self.write_assignment(cluster, &partitions, CreateMode::Persistent)
            .await?;

        *self.partitions.lock().await = Some(partitions.clone());
        *self.config.lock().await = Some(config);
        cluster.reset_metadata().await;

        self.wait_for_leaders(cluster, &partitions).await
    }

    /// Grows the topic to `partition_count` partitions, placing the replicas
    /// of the new partitions with a fresh load snapshot of the cluster, and
    /// waits until all partitions (old and new) have a leader.
    pub async fn add_partitions(
        &self,
        cluster: &Cluster,
        partition_count: u32,
        replication_factor: usize,
    ) -> Result<()> {
        if !self.exists(cluster).await? {
            return Err(Error::TopicNotFound(self.name.clone()));
        }
        let mut partitions = self.fetch_partitions(cluster).await?;
        if (partition_count as usize) <= partitions.len() {
            return Err(Error::Validation(format!(
                "Topic {} already has {} partitions; requested {}",
                self.name,
                partitions.len(),
                partition_count
            )));
        }

        let mut assigner = crate::assignment::ReplicaAssigner::for_cluster(cluster).await?;
        for id in partitions.len() as u32..partition_count {
            let replicas = assigner.assign(replication_factor)?;
            partitions.push(Partition::new(self.name.clone(), id, replicas));
        }
        for partition in &partitions {
            partition.validate()?;
        }

        info!(
            topic = %self.name,
            partitions = partitions.len(),
            "expanding topic"
        );
        self.write_assignment(cluster, &partitions, CreateMode::Persistent)
            .await?;

        *self.partitions.lock().await = Some(partitions.clone());
        cluster.reset_metadata().await;

        self.wait_for_leaders(cluster, &partitions).await
    }

    /// Requests deletion of the topic and suspends until the cluster
    /// controller has removed the topic node.
    pub async fn destroy(&self, cluster: &Cluster) -> Result<()> {
        let topic_path = paths::topic(&self.name);
        let (reply, mut watch) = cluster.store().stat_with_watch(&topic_path).await?;
        if reply.status.is_no_node() {
            return Err(Error::TopicNotFound(self.name.clone()));
        }

        let marker_path = paths::delete_topic(&self.name);
        let mut created = cluster
            .store()
            .create(&marker_path, Bytes::new(), CreateMode::Persistent)
            .await?;
        if created.status.is_no_node() {
            cluster.recursive_create(paths::DELETE_TOPICS).await?;
            created = cluster
                .store()
                .create(&marker_path, Bytes::new(), CreateMode::Persistent)
                .await?;
        }
        match created.status {
            s if s.is_ok() => {}
            s if s.is_node_exists() => {
                return Err(Error::TopicAlreadyMarkedForDeletion(self.name.clone()));
            }
            status => {
                return Err(Error::Store {
                    path: marker_path,
                    status,
                });
            }
        }

        info!(topic = %self.name, "topic marked for deletion, awaiting removal");
        loop {
            match watch.wait().await? {
                WatchEvent::Deleted(_) => break,
                event => {
                    debug!(topic = %self.name, ?event, "still awaiting topic removal");
                    let (reply, next) = cluster.store().stat_with_watch(&topic_path).await?;
                    if reply.status.is_no_node() {
                        break;
                    }
                    watch = next;
                }
            }
        }

        *self.partitions.lock().await = None;
        *self.config.lock().await = None;
        cluster.reset_metadata().await;
        Ok(())
    }

    /// The topic's configuration overrides. A missing config node reads as an
    /// empty map.
    pub async fn config(&self, cluster: &Cluster) -> Result<HashMap<String, String>> {
        let mut guard = self.config.lock().await;
        if let Some(config) = guard.as_ref() {
            return Ok(config.clone());
        }
        let fetched = self.fetch_config(cluster).await?;
        *guard = Some(fetched.clone());
        Ok(fetched)
    }

    /// Sets one config override and notifies the brokers.
    pub async fn set_config(
        &self,
        cluster: &Cluster,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let mut config = self.config(cluster).await?;
        config.insert(key.into(), value.into());
        self.write_config(cluster, config).await
    }

    /// Removes one config override and notifies the brokers.
    pub async fn delete_config(&self, cluster: &Cluster, key: &str) -> Result<()> {
        let mut config = self.config(cluster).await?;
        config.remove(key);
        self.write_config(cluster, config).await
    }

    /// Drops all overrides, reverting the topic to the broker defaults.
    pub async fn reset_default_config(&self, cluster: &Cluster) -> Result<()> {
        self.write_config(cluster, HashMap::new()).await
    }

    async fn fetch_partitions(&self, cluster: &Cluster) -> Result<Vec<Partition>> {
        let path = paths::topic(&self.name);
        let reply = cluster.store().get(&path).await?;
        match reply.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Err(Error::TopicNotFound(self.name.clone())),
            status => return Err(Error::Store { path, status }),
        }

        let assignment: TopicAssignment =
            serde_json::from_slice(reply.data.as_deref().unwrap_or_default())?;
        if assignment.version != 1 {
            return Err(Error::VersionNotSupported {
                path,
                version: assignment.version,
            });
        }

        let brokers = cluster.brokers().await?;
        let mut partitions = Vec::with_capacity(assignment.partitions.len());
        for (raw_id, replica_ids) in assignment.partitions {
            let id: u32 = raw_id.parse().map_err(|_| {
                Error::Validation(format!(
                    "Invalid partition id {:?} in assignment of topic {}",
                    raw_id, self.name
                ))
            })?;
            let replicas = replica_ids
                .iter()
                .map(|replica| {
                    brokers.get(replica).cloned().ok_or_else(|| {
                        Error::Validation(format!(
                            "Replica {} of {}/{} is not a known broker",
                            replica, self.name, id
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            partitions.push(Partition::new(self.name.clone(), id, replicas));
        }
        partitions.sort_by_key(Partition::id);
        Ok(partitions)
    }

    async fn fetch_config(&self, cluster: &Cluster) -> Result<HashMap<String, String>> {
        let path = paths::topic_config(&self.name);
        let reply = cluster.store().get(&path).await?;
        match reply.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Ok(HashMap::new()),
            status => return Err(Error::Store { path, status }),
        }
        let payload: TopicConfigPayload =
            serde_json::from_slice(reply.data.as_deref().unwrap_or_default())?;
        if payload.version != 1 {
            return Err(Error::VersionNotSupported {
                path,
                version: payload.version,
            });
        }
        Ok(payload.config)
    }

    async fn write_assignment(
        &self,
        cluster: &Cluster,
        partitions: &[Partition],
        mode: CreateMode,
    ) -> Result<()> {
        let assignment: BTreeMap<String, Vec<u32>> = partitions
            .iter()
            .map(|p| {
                (
                    p.id().to_string(),
                    p.replicas().iter().map(|b| b.id).collect(),
                )
            })
            .collect();
        let payload = Bytes::from(serde_json::to_vec(&serde_json::json!({
            "version": 1,
            "partitions": assignment,
        }))?);

        let path = paths::topic(&self.name);
        let status = if self.exists(cluster).await? {
            cluster.store().set(&path, payload).await?
        } else {
            cluster.store().create(&path, payload, mode).await?.status
        };
        if !status.is_ok() {
            return Err(Error::Store { path, status });
        }
        Ok(())
    }

    /// Persists the config map and appends a sequential change marker so
    /// running brokers pick up the new configuration. Both writes must
    /// succeed.
    async fn write_config(&self, cluster: &Cluster, config: HashMap<String, String>) -> Result<()> {
        let path = paths::topic_config(&self.name);
        let payload = Bytes::from(serde_json::to_vec(&serde_json::json!({
            "version": 1,
            "config": ordered(&config),
        }))?);

        let mut status = cluster.store().set(&path, payload.clone()).await?;
        if status.is_no_node() {
            cluster.recursive_create(paths::parent(&path)).await?;
            status = cluster
                .store()
                .create(&path, payload, CreateMode::Persistent)
                .await?
                .status;
        }
        if !status.is_ok() {
            return Err(Error::Store { path, status });
        }

        let marker = paths::config_change();
        let notification = Bytes::from(serde_json::to_vec(&self.name)?);
        let mut reply = cluster
            .store()
            .create(&marker, notification.clone(), CreateMode::PersistentSequential)
            .await?;
        if reply.status.is_no_node() {
            cluster.recursive_create(paths::CONFIG_CHANGES).await?;
            reply = cluster
                .store()
                .create(&marker, notification, CreateMode::PersistentSequential)
                .await?;
        }
        if !reply.status.is_ok() {
            return Err(Error::Store {
                path: marker,
                status: reply.status,
            });
        }

        debug!(topic = %self.name, "topic configuration updated");
        *self.config.lock().await = Some(config);
        Ok(())
    }

    async fn wait_for_leaders(&self, cluster: &Cluster, partitions: &[Partition]) -> Result<()> {
        for partition in partitions {
            partition.wait_for_leader(cluster).await?;
        }
        debug!(topic = %self.name, "all partitions have a leader");
        Ok(())
    }
}

fn ordered(config: &HashMap<String, String>) -> BTreeMap<&str, &str> {
    config
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}
