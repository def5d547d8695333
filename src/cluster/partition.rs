//! Topic partitions and their runtime state.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cluster::broker::Broker;
use crate::cluster::{paths, Cluster};
use crate::error::{Error, Result};

pub type PartitionId = u32;

/// Leader and in-sync replica set, fetched lazily from the partition state
/// node. Not auto-invalidated: discard the `Partition` (or call
/// [`Partition::refresh_state`]) to observe newer state.
#[derive(Debug, Clone)]
struct PartitionState {
    leader: Broker,
    isr: Vec<Broker>,
}

/// One partition of a topic.
///
/// Identity is `(topic, id)`. The static replica assignment is immutable;
/// runtime state is fetched on first access and shared between clones of the
/// same `Partition` under a per-partition lock.
#[derive(Debug, Clone)]
pub struct Partition {
    topic_name: String,
    id: PartitionId,
    replicas: Vec<Broker>,
    state: Arc<Mutex<Option<PartitionState>>>,
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.topic_name == other.topic_name && self.id == other.id
    }
}

impl Eq for Partition {}

impl std::hash::Hash for Partition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.topic_name.hash(state);
        self.id.hash(state);
    }
}

#[derive(Debug, Deserialize)]
struct PartitionStatePayload {
    leader: i64,
    isr: Vec<u32>,
}

impl Partition {
    pub fn new(topic_name: impl Into<String>, id: PartitionId, replicas: Vec<Broker>) -> Self {
        Partition {
            topic_name: topic_name.into(),
            id,
            replicas,
            state: Arc::new(Mutex::new(None)),
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Replicas in preference order; index 0 is the preferred leader.
    pub fn replicas(&self) -> &[Broker] {
        &self.replicas
    }

    /// The broker that is elected leader under normal conditions.
    pub fn preferred_leader(&self) -> Option<&Broker> {
        self.replicas.first()
    }

    pub fn replication_factor(&self) -> usize {
        self.replicas.len()
    }

    /// The `topic/id` key used in log lines and mappings.
    pub fn key(&self) -> String {
        format!("{}/{}", self.topic_name, self.id)
    }

    /// Checks the static replica assignment: non-empty and no broker listed
    /// twice. Never touches the store.
    pub fn validate(&self) -> Result<()> {
        if self.replicas.is_empty() {
            return Err(Error::Validation(format!(
                "No replicas defined for {}",
                self.key()
            )));
        }
        for (idx, replica) in self.replicas.iter().enumerate() {
            if self.replicas[..idx].contains(replica) {
                return Err(Error::Validation(format!(
                    "The replicas of {} should be assigned to different brokers",
                    self.key()
                )));
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// The partition's current leader.
    pub async fn leader(&self, cluster: &Cluster) -> Result<Broker> {
        Ok(self.state(cluster).await?.leader)
    }

    /// The partition's current in-sync replica set.
    pub async fn isr(&self, cluster: &Cluster) -> Result<Vec<Broker>> {
        Ok(self.state(cluster).await?.isr)
    }

    /// True when fewer replicas are in sync than the replication factor.
    pub async fn under_replicated(&self, cluster: &Cluster) -> Result<bool> {
        Ok(self.isr(cluster).await?.len() < self.replication_factor())
    }

    /// Drops the cached runtime state and fetches it again.
    pub async fn refresh_state(&self, cluster: &Cluster) -> Result<()> {
        let fresh = self.fetch_state(cluster).await?;
        *self.state.lock().await = Some(fresh);
        Ok(())
    }

    /// Polls, bounded by the cluster's [`ClusterOptions`], until the partition
    /// reports a leader. Leader election propagates asynchronously through
    /// the store after topic creation.
    ///
    /// [`ClusterOptions`]: crate::cluster::ClusterOptions
    pub async fn wait_for_leader(&self, cluster: &Cluster) -> Result<()> {
        let options = cluster.options();
        let deadline = Instant::now() + options.leader_wait_timeout;
        loop {
            match self.fetch_state(cluster).await {
                Ok(state) => {
                    *self.state.lock().await = Some(state);
                    return Ok(());
                }
                Err(Error::NoLeader { .. }) | Err(Error::Store { .. }) => {}
                Err(other) => return Err(other),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("leader election of {}", self.key()),
                    waited: options.leader_wait_timeout,
                });
            }
            tokio::time::sleep(options.leader_wait_poll).await;
        }
    }

    async fn state(&self, cluster: &Cluster) -> Result<PartitionState> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }
        let fresh = self.fetch_state(cluster).await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fetch_state(&self, cluster: &Cluster) -> Result<PartitionState> {
        let path = paths::partition_state(&self.topic_name, self.id);
        let reply = cluster.store().get(&path).await?;
        if !reply.status.is_ok() {
            return Err(Error::Store {
                path,
                status: reply.status,
            });
        }
        let payload: PartitionStatePayload =
            serde_json::from_slice(reply.data.as_deref().unwrap_or_default())?;

        let brokers = cluster.brokers().await?;
        let leader = u32::try_from(payload.leader)
            .ok()
            .and_then(|id| brokers.get(&id).cloned())
            .ok_or_else(|| Error::NoLeader {
                topic: self.topic_name.clone(),
                partition: self.id,
            })?;
        let isr = payload
            .isr
            .iter()
            .map(|id| {
                brokers.get(id).cloned().ok_or_else(|| {
                    Error::Validation(format!(
                        "In-sync replica {} of {} is not a known broker",
                        id,
                        self.key()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PartitionState { leader, isr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(id: u32) -> Broker {
        Broker {
            id,
            host: format!("kafka{}", id),
            port: 9092,
            jmx_port: None,
        }
    }

    #[test]
    fn test_identity_is_topic_and_id() {
        let a = Partition::new("events", 0, vec![broker(1)]);
        let b = Partition::new("events", 0, vec![broker(2), broker(3)]);
        let c = Partition::new("events", 1, vec![broker(1)]);
        let d = Partition::new("logs", 0, vec![broker(1)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_validate_rejects_empty_replicas() {
        let partition = Partition::new("events", 0, vec![]);
        assert!(matches!(partition.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_replicas() {
        let partition = Partition::new("events", 0, vec![broker(1), broker(1)]);
        assert!(matches!(partition.validate(), Err(Error::Validation(_))));
        let partition = Partition::new("events", 0, vec![broker(1), broker(2)]);
        assert!(partition.validate().is_ok());
    }

    #[test]
    fn test_preferred_leader_is_first_replica() {
        let partition = Partition::new("events", 0, vec![broker(3), broker(1)]);
        assert_eq!(partition.preferred_leader().unwrap().id, 3);
        assert_eq!(partition.replication_factor(), 2);
        assert_eq!(partition.key(), "events/0");
    }
}
