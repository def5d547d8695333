//! Legacy ZooKeeper-based consumer group protocol.
//!
//! A [`Consumergroup`] is a name under the consumer root; it caches nothing,
//! every query re-reads the store. An [`Instance`] is one running member of
//! a group. Membership and partition ownership are ephemeral nodes, so a
//! crashed member's registrations and claims disappear with its session.
//!
//! Group states, informally: unregistered, registered but inactive (the
//! namespace exists, no members), and active (at least one member).
//! `destroy` is only permitted while inactive.
//!
//! The only synchronization primitive of the protocol is the store's atomic
//! create-if-absent: whoever creates the ownership node for a partition owns
//! it until the node goes away.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::cluster::{paths, Cluster, Partition, Topic};
use crate::error::{Error, Result};
use crate::store::{CreateMode, CreateReply, StoreStatus, Watch};
use crate::subscription::Subscription;

/// A consumer group, registered in the store or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumergroup {
    name: String,
}

/// One running member of a consumer group.
#[derive(Debug, Clone)]
pub struct Instance {
    group: String,
    id: String,
    subscription: Option<Subscription>,
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.id == other.id
    }
}

impl Eq for Instance {}

impl Consumergroup {
    pub fn new(name: impl Into<String>) -> Self {
        Consumergroup { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the group's namespace exists in the store.
    pub async fn exists(&self, cluster: &Cluster) -> Result<bool> {
        let path = paths::group(&self.name);
        let reply = cluster.store().stat(&path).await?;
        match reply.status {
            s if s.is_ok() => Ok(true),
            s if s.is_no_node() => Ok(false),
            status => Err(Error::Store { path, status }),
        }
    }

    /// Registers the group's namespace (ids and owners subtrees).
    pub async fn create(&self, cluster: &Cluster) -> Result<()> {
        cluster.recursive_create(&paths::group_ids(&self.name)).await?;
        cluster
            .recursive_create(&paths::group_owners(&self.name))
            .await?;
        info!(group = %self.name, "consumer group registered");
        cluster.reset_metadata().await;
        Ok(())
    }

    /// Removes the group and all of its state. Refused while the group still
    /// has running instances.
    pub async fn destroy(&self, cluster: &Cluster) -> Result<()> {
        if self.active(cluster).await? {
            return Err(Error::Validation(format!(
                "Consumer group {} still has running instances",
                self.name
            )));
        }
        cluster.recursive_delete(&paths::group(&self.name)).await?;
        info!(group = %self.name, "consumer group destroyed");
        cluster.reset_metadata().await;
        Ok(())
    }

    /// When the group's namespace was last touched.
    pub async fn created_at(&self, cluster: &Cluster) -> Result<DateTime<Utc>> {
        let path = paths::group(&self.name);
        let reply = cluster.store().stat(&path).await?;
        match reply.status {
            s if s.is_ok() => {
                let mtime = reply.stat.map(|s| s.mtime_ms).unwrap_or_default();
                Ok(DateTime::from_timestamp_millis(mtime).unwrap_or_default())
            }
            status => Err(Error::Store { path, status }),
        }
    }

    /// A new, not yet registered member of this group. The id defaults to
    /// `<hostname>:<random token>`.
    pub fn instantiate(&self, id: Option<String>) -> Instance {
        Instance {
            group: self.name.clone(),
            id: id.unwrap_or_else(Instance::generate_id),
            subscription: None,
        }
    }

    /// Whether the group has at least one running instance.
    pub async fn active(&self, cluster: &Cluster) -> Result<bool> {
        Ok(!self.instances(cluster).await?.is_empty())
    }

    /// The group's running instances, each with its stored subscription.
    /// An unregistered group has none.
    pub async fn instances(&self, cluster: &Cluster) -> Result<Vec<Instance>> {
        let path = paths::group_ids(&self.name);
        let listing = cluster.store().children(&path).await?;
        match listing.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Ok(Vec::new()),
            status => return Err(Error::Store { path, status }),
        }
        self.resolve_instances(cluster, listing.children).await
    }

    /// Like [`Consumergroup::instances`], with a one-shot watch on the next
    /// membership change. The watch is absent for an unregistered group.
    pub async fn watch_instances(
        &self,
        cluster: &Cluster,
    ) -> Result<(Vec<Instance>, Option<Watch>)> {
        let path = paths::group_ids(&self.name);
        let (listing, watch) = cluster.store().children_with_watch(&path).await?;
        match listing.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Ok((Vec::new(), None)),
            status => return Err(Error::Store { path, status }),
        }
        let instances = self.resolve_instances(cluster, listing.children).await?;
        Ok((instances, watch))
    }

    /// The subscription shared by all running instances.
    ///
    /// Group behavior is only well-defined when every member subscribes to
    /// the same thing; disagreement is an error, not a merge.
    pub async fn subscription(&self, cluster: &Cluster) -> Result<Subscription> {
        let instances = self.instances(cluster).await?;
        let mut subscriptions = instances.into_iter().filter_map(|i| i.subscription);
        let first = subscriptions
            .next()
            .ok_or_else(|| Error::NoRunningInstances(self.name.clone()))?;
        if subscriptions.all(|s| s == first) {
            Ok(first)
        } else {
            Err(Error::InconsistentSubscriptions(self.name.clone()))
        }
    }

    /// Topics for which this group currently holds partition claims.
    pub async fn claimed_topics(&self, cluster: &Cluster) -> Result<Vec<Topic>> {
        let topics = cluster.topics().await?;
        let mut claimed: Vec<Topic> = self
            .claimed_topic_names(cluster)
            .await?
            .into_iter()
            .filter_map(|name| topics.get(&name).cloned())
            .collect();
        claimed.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(claimed)
    }

    /// Topics the group's current subscription covers.
    pub async fn subscribed_topics(&self, cluster: &Cluster) -> Result<Vec<Topic>> {
        self.subscription(cluster).await?.topics(cluster).await
    }

    /// All partitions the group should be consuming.
    pub async fn partitions(&self, cluster: &Cluster) -> Result<Vec<Partition>> {
        self.subscription(cluster).await?.partitions(cluster).await
    }

    /// Partitions the group subscribes to but nobody currently claims.
    pub async fn unclaimed_partitions(&self, cluster: &Cluster) -> Result<Vec<Partition>> {
        let claims = self.partition_claims(cluster).await?;
        Ok(self
            .partitions(cluster)
            .await?
            .into_iter()
            .filter(|p| !claims.contains_key(p))
            .collect())
    }

    /// The full partition-to-owner mapping, resolved concurrently.
    ///
    /// A claim that disappears mid-listing was released by its owner and is
    /// skipped, as are claims for topics no longer in the cluster.
    pub async fn partition_claims(
        &self,
        cluster: &Cluster,
    ) -> Result<HashMap<Partition, Instance>> {
        let topics = cluster.topics().await?;
        let group = self.name.clone();

        let mut topic_tasks = JoinSet::new();
        for topic_name in self.claimed_topic_names(cluster).await? {
            let Some(topic) = topics.get(&topic_name).cloned() else {
                continue;
            };
            let cluster = cluster.clone();
            let group = group.clone();
            topic_tasks.spawn(async move {
                let path = paths::topic_owners(&group, &topic_name);
                let listing = cluster.store().children(&path).await?;
                match listing.status {
                    s if s.is_ok() => {}
                    s if s.is_no_node() => return Ok(Vec::new()),
                    status => return Err(Error::Store { path, status }),
                }
                let partitions = topic.partitions(&cluster).await?;

                let mut claim_tasks = JoinSet::new();
                for child in listing.children {
                    let id: u32 = child.parse().map_err(|_| {
                        Error::Validation(format!(
                            "Invalid partition id {:?} under {}",
                            child, path
                        ))
                    })?;
                    let Some(partition) = partitions.iter().find(|p| p.id() == id).cloned()
                    else {
                        continue;
                    };
                    let owner_path = paths::partition_owner(&group, &topic_name, id);
                    let cluster = cluster.clone();
                    let group = group.clone();
                    claim_tasks.spawn(async move {
                        let reply = cluster.store().get(&owner_path).await?;
                        match reply.status {
                            s if s.is_ok() => {
                                let owner = String::from_utf8_lossy(
                                    reply.data.as_deref().unwrap_or_default(),
                                )
                                .into_owned();
                                Ok(Some((
                                    partition,
                                    Instance {
                                        group,
                                        id: owner,
                                        subscription: None,
                                    },
                                )))
                            }
                            s if s.is_no_node() => Ok(None),
                            status => Err(Error::Store {
                                path: owner_path,
                                status,
                            }),
                        }
                    });
                }

                let mut claims = Vec::new();
                while let Some(joined) = claim_tasks.join_next().await {
                    if let Some(claim) = joined?? {
                        claims.push(claim);
                    }
                }
                Ok::<_, Error>(claims)
            });
        }

        let mut mapping = HashMap::new();
        while let Some(joined) = topic_tasks.join_next().await {
            for (partition, instance) in joined?? {
                mapping.insert(partition, instance);
            }
        }
        Ok(mapping)
    }

    /// The current owner of one partition, plus a one-shot watch on the next
    /// claim change. An unclaimed partition yields `(None, None)`.
    pub async fn watch_partition_claim(
        &self,
        cluster: &Cluster,
        partition: &Partition,
    ) -> Result<(Option<Instance>, Option<Watch>)> {
        let path = paths::partition_owner(&self.name, partition.topic_name(), partition.id());
        let (reply, watch) = cluster.store().get_with_watch(&path).await?;
        match reply.status {
            s if s.is_ok() => {
                let owner =
                    String::from_utf8_lossy(reply.data.as_deref().unwrap_or_default())
                        .into_owned();
                Ok((
                    Some(Instance {
                        group: self.name.clone(),
                        id: owner,
                        subscription: None,
                    }),
                    watch,
                ))
            }
            s if s.is_no_node() => Ok((None, None)),
            status => Err(Error::Store { path, status }),
        }
    }

    /// The committed offset for one partition: the next offset to read, or
    /// `None` when nothing was ever committed.
    pub async fn retrieve_offset(
        &self,
        cluster: &Cluster,
        partition: &Partition,
    ) -> Result<Option<i64>> {
        let path = paths::partition_offset(&self.name, partition.topic_name(), partition.id());
        let reply = cluster.store().get(&path).await?;
        match reply.status {
            s if s.is_ok() => {
                let raw = String::from_utf8_lossy(reply.data.as_deref().unwrap_or_default())
                    .into_owned();
                let offset = raw.trim().parse().map_err(|_| {
                    Error::Validation(format!("Invalid offset {:?} stored at {}", raw, path))
                })?;
                Ok(Some(offset))
            }
            s if s.is_no_node() => Ok(None),
            status => Err(Error::Store { path, status }),
        }
    }

    /// Records that `offset` was processed: stores `offset + 1`, the next
    /// offset to read. Creates the offset node and its ancestors on the
    /// first commit for a partition.
    pub async fn commit_offset(
        &self,
        cluster: &Cluster,
        partition: &Partition,
        offset: i64,
    ) -> Result<()> {
        let path = paths::partition_offset(&self.name, partition.topic_name(), partition.id());
        let data = Bytes::from((offset + 1).to_string());

        let mut status = cluster.store().set(&path, data.clone()).await?;
        if status.is_no_node() {
            cluster.recursive_create(paths::parent(&path)).await?;
            status = cluster
                .store()
                .create(&path, data.clone(), CreateMode::Persistent)
                .await?
                .status;
            // NodeExists means another member won the first-commit race; the
            // node is there now, so the set can proceed.
            if status.is_node_exists() {
                status = cluster.store().set(&path, data).await?;
            }
        }
        if !status.is_ok() {
            return Err(Error::Store { path, status });
        }
        debug!(group = %self.name, partition = %partition.key(), offset, "offset committed");
        Ok(())
    }

    /// Every committed offset of the group, keyed by partition.
    pub async fn retrieve_all_offsets(
        &self,
        cluster: &Cluster,
    ) -> Result<HashMap<Partition, i64>> {
        let root = paths::group_offsets(&self.name);
        let listing = cluster.store().children(&root).await?;
        match listing.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Ok(HashMap::new()),
            status => return Err(Error::Store { path: root, status }),
        }

        let topics = cluster.topics().await?;
        let mut tasks = JoinSet::new();
        for topic_name in listing.children {
            let Some(topic) = topics.get(&topic_name).cloned() else {
                continue;
            };
            let cluster = cluster.clone();
            let group = self.clone();
            tasks.spawn(async move {
                let path = paths::topic_offsets(&group.name, &topic_name);
                let listing = cluster.store().children(&path).await?;
                match listing.status {
                    s if s.is_ok() => {}
                    s if s.is_no_node() => return Ok(Vec::new()),
                    status => return Err(Error::Store { path, status }),
                }
                let partitions = topic.partitions(&cluster).await?;

                let mut offsets = Vec::new();
                for child in listing.children {
                    let id: u32 = child.parse().map_err(|_| {
                        Error::Validation(format!(
                            "Invalid partition id {:?} under {}",
                            child, path
                        ))
                    })?;
                    let Some(partition) = partitions.iter().find(|p| p.id() == id).cloned()
                    else {
                        continue;
                    };
                    if let Some(offset) = group.retrieve_offset(&cluster, &partition).await? {
                        offsets.push((partition, offset));
                    }
                }
                Ok::<_, Error>(offsets)
            });
        }

        let mut mapping = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            for (partition, offset) in joined?? {
                mapping.insert(partition, offset);
            }
        }
        Ok(mapping)
    }

    /// Offsets for every partition of a subscription (defaulting to the
    /// group's own), resolved concurrently. Uncommitted partitions map to
    /// `None`.
    pub async fn retrieve_offsets(
        &self,
        cluster: &Cluster,
        subscription: Option<&Subscription>,
    ) -> Result<HashMap<Partition, Option<i64>>> {
        let subscription = match subscription {
            Some(s) => s.clone(),
            None => self.subscription(cluster).await?,
        };

        let mut tasks = JoinSet::new();
        for partition in subscription.partitions(cluster).await? {
            let cluster = cluster.clone();
            let group = self.clone();
            tasks.spawn(async move {
                let offset = group.retrieve_offset(&cluster, &partition).await?;
                Ok::<_, Error>((partition, offset))
            });
        }

        let mut mapping = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (partition, offset) = joined??;
            mapping.insert(partition, offset);
        }
        Ok(mapping)
    }

    /// Forgets every committed offset of the group.
    pub async fn reset_all_offsets(&self, cluster: &Cluster) -> Result<()> {
        let root = paths::group_offsets(&self.name);
        let reply = cluster.store().stat(&root).await?;
        if reply.status.is_no_node() {
            return Ok(());
        }
        info!(group = %self.name, "resetting all committed offsets");
        cluster.recursive_delete(&root).await
    }

    /// Drops ownership subtrees for topics outside the given subscription
    /// (defaulting to the group's own), reclaiming state after the group's
    /// interest narrowed.
    pub async fn clean_topic_claims(
        &self,
        cluster: &Cluster,
        subscription: Option<&Subscription>,
    ) -> Result<()> {
        let subscription = match subscription {
            Some(s) => s.clone(),
            None => self.subscription(cluster).await?,
        };
        for topic_name in self.claimed_topic_names(cluster).await? {
            if !subscription.has_topic(&topic_name) {
                debug!(group = %self.name, topic = %topic_name, "dropping stale topic claims");
                cluster
                    .recursive_delete(&paths::topic_owners(&self.name, &topic_name))
                    .await?;
            }
        }
        Ok(())
    }

    /// Drops offset subtrees for topics outside the given subscription
    /// (defaulting to the group's own).
    pub async fn clean_stored_offsets(
        &self,
        cluster: &Cluster,
        subscription: Option<&Subscription>,
    ) -> Result<()> {
        let subscription = match subscription {
            Some(s) => s.clone(),
            None => self.subscription(cluster).await?,
        };
        let root = paths::group_offsets(&self.name);
        let listing = cluster.store().children(&root).await?;
        match listing.status {
            s if s.is_ok() => {}
            s if s.is_no_node() => return Ok(()),
            status => return Err(Error::Store { path: root, status }),
        }
        for topic_name in listing.children {
            if !subscription.has_topic(&topic_name) {
                debug!(group = %self.name, topic = %topic_name, "dropping stale stored offsets");
                cluster
                    .recursive_delete(&paths::topic_offsets(&self.name, &topic_name))
                    .await?;
            }
        }
        Ok(())
    }

    async fn claimed_topic_names(&self, cluster: &Cluster) -> Result<Vec<String>> {
        let path = paths::group_owners(&self.name);
        let listing = cluster.store().children(&path).await?;
        match listing.status {
            s if s.is_ok() => Ok(listing.children),
            s if s.is_no_node() => Ok(Vec::new()),
            status => Err(Error::Store { path, status }),
        }
    }

    async fn resolve_instances(
        &self,
        cluster: &Cluster,
        ids: Vec<String>,
    ) -> Result<Vec<Instance>> {
        let mut tasks = JoinSet::new();
        for id in ids {
            let cluster = cluster.clone();
            let group = self.name.clone();
            tasks.spawn(async move {
                let path = paths::instance(&group, &id);
                let reply = cluster.store().get(&path).await?;
                match reply.status {
                    s if s.is_ok() => {
                        let subscription = Subscription::from_json(
                            reply.data.as_deref().unwrap_or_default(),
                        )?;
                        Ok(Some(Instance {
                            group,
                            id,
                            subscription: Some(subscription),
                        }))
                    }
                    s if s.is_no_node() => Ok(None),
                    status => Err(Error::Store { path, status }),
                }
            });
        }

        let mut instances = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(instance) = joined?? {
                instances.push(instance);
            }
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }
}

impl Instance {
    /// The default instance id, `<hostname>:<random token>`.
    pub fn generate_id() -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("{}:{}", host, uuid::Uuid::new_v4())
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The subscription this instance registered with, when known.
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Whether this instance's registration node is present.
    pub async fn registered(&self, cluster: &Cluster) -> Result<bool> {
        let path = paths::instance(&self.group, &self.id);
        let reply = cluster.store().stat(&path).await?;
        match reply.status {
            s if s.is_ok() => Ok(true),
            s if s.is_no_node() => Ok(false),
            status => Err(Error::Store { path, status }),
        }
    }

    /// Joins the group: writes the ephemeral registration node carrying the
    /// subscription, then makes sure an ownership subtree exists for every
    /// subscribed topic.
    pub async fn register(&mut self, cluster: &Cluster, subscription: &Subscription) -> Result<()> {
        let path = paths::instance(&self.group, &self.id);
        let payload = Bytes::from(subscription.to_json()?);

        let mut reply = cluster
            .store()
            .create(&path, payload.clone(), CreateMode::Ephemeral)
            .await?;
        if reply.status.is_no_node() {
            cluster.recursive_create(paths::parent(&path)).await?;
            reply = cluster
                .store()
                .create(&path, payload, CreateMode::Ephemeral)
                .await?;
        }
        if !reply.status.is_ok() {
            return Err(self.registration_failed(reply.status));
        }

        for topic in subscription.topics(cluster).await? {
            let owners = paths::topic_owners(&self.group, topic.name());
            let created = cluster
                .store()
                .create(&owners, Bytes::new(), CreateMode::Persistent)
                .await?;
            match created.status {
                s if s.is_ok() || s.is_node_exists() => {}
                status => return Err(self.registration_failed(status)),
            }
        }

        info!(group = %self.group, instance = %self.id, "consumer instance registered");
        self.subscription = Some(subscription.clone());
        Ok(())
    }

    /// Leaves the group. Claims held by this instance are released by the
    /// store when the session's ephemeral nodes go away, but the
    /// registration node is removed eagerly here.
    pub async fn deregister(&self, cluster: &Cluster) -> Result<()> {
        let path = paths::instance(&self.group, &self.id);
        let status = cluster.store().delete(&path).await?;
        match status {
            s if s.is_ok() || s.is_no_node() => {
                info!(group = %self.group, instance = %self.id, "consumer instance deregistered");
                Ok(())
            }
            status => Err(Error::Store { path, status }),
        }
    }

    /// When this instance registered.
    pub async fn created_at(&self, cluster: &Cluster) -> Result<DateTime<Utc>> {
        let path = paths::instance(&self.group, &self.id);
        let reply = cluster.store().stat(&path).await?;
        match reply.status {
            s if s.is_ok() => {
                let mtime = reply.stat.map(|s| s.mtime_ms).unwrap_or_default();
                Ok(DateTime::from_timestamp_millis(mtime).unwrap_or_default())
            }
            status => Err(Error::Store { path, status }),
        }
    }

    /// Attempts to become the exclusive consumer of a partition.
    ///
    /// The ownership node is ephemeral and created if absent; an existing
    /// node means another instance got there first, reported as
    /// [`Error::PartitionAlreadyClaimed`] so the caller can move on to a
    /// different partition.
    pub async fn claim_partition(&self, cluster: &Cluster, partition: &Partition) -> Result<()> {
        let path = paths::partition_owner(&self.group, partition.topic_name(), partition.id());
        let payload = Bytes::from(self.id.clone());

        let reply: CreateReply = cluster
            .store()
            .create(&path, payload, CreateMode::Ephemeral)
            .await?;
        match reply.status {
            s if s.is_ok() => {
                debug!(
                    group = %self.group,
                    instance = %self.id,
                    partition = %partition.key(),
                    "partition claimed"
                );
                Ok(())
            }
            s if s.is_node_exists() => Err(Error::PartitionAlreadyClaimed {
                topic: partition.topic_name().to_string(),
                partition: partition.id(),
            }),
            status => Err(Error::Store { path, status }),
        }
    }

    /// Gives up the claim on a partition.
    pub async fn release_partition(&self, cluster: &Cluster, partition: &Partition) -> Result<()> {
        let path = paths::partition_owner(&self.group, partition.topic_name(), partition.id());
        let status = cluster.store().delete(&path).await?;
        if status.is_ok() {
            debug!(
                group = %self.group,
                instance = %self.id,
                partition = %partition.key(),
                "partition released"
            );
            Ok(())
        } else {
            Err(Error::ReleasePartitionFailed {
                topic: partition.topic_name().to_string(),
                partition: partition.id(),
                status,
            })
        }
    }

    fn registration_failed(&self, status: StoreStatus) -> Error {
        Error::InstanceRegistrationFailed {
            group: self.group.clone(),
            instance: self.id.clone(),
            status,
        }
    }
}
