//! Greedy balanced placement for new partitions.

use std::collections::HashMap;

use crate::cluster::{Broker, BrokerId, Cluster};
use crate::error::{Error, Result};

/// Stateful placement planner.
///
/// Carries a running tally of per-broker leader and replica counts, seeded
/// from the cluster's existing partitions, and charges every assignment it
/// hands out against that tally. Placement is a greedy heuristic: not
/// globally optimal, but deterministic given the same starting counts and
/// call sequence.
#[derive(Debug, Clone)]
pub struct ReplicaAssigner {
    brokers: Vec<Broker>,
    broker_leaders: HashMap<BrokerId, usize>,
    broker_replicas: HashMap<BrokerId, usize>,
}

impl ReplicaAssigner {
    /// An assigner over the given brokers with all counters at zero.
    pub fn new(brokers: impl IntoIterator<Item = Broker>) -> Self {
        let mut brokers: Vec<Broker> = brokers.into_iter().collect();
        brokers.sort_by_key(|b| b.id);
        let broker_leaders = brokers.iter().map(|b| (b.id, 0)).collect();
        let broker_replicas = brokers.iter().map(|b| (b.id, 0)).collect();
        ReplicaAssigner {
            brokers,
            broker_leaders,
            broker_replicas,
        }
    }

    /// An assigner seeded with a fresh load snapshot: one scan over every
    /// existing partition of the cluster.
    pub async fn for_cluster(cluster: &Cluster) -> Result<Self> {
        let mut assigner = ReplicaAssigner::new(cluster.brokers().await?.into_values());
        for partition in cluster.partitions().await? {
            if let Some(leader) = partition.preferred_leader() {
                assigner.count_leader(leader.id);
            }
            for replica in partition.replicas() {
                assigner.count_replica(replica.id);
            }
        }
        Ok(assigner)
    }

    /// Records an existing partition's preferred leader in the tally.
    pub fn count_leader(&mut self, broker: BrokerId) {
        *self.broker_leaders.entry(broker).or_insert(0) += 1;
    }

    /// Records an existing replica in the tally.
    pub fn count_replica(&mut self, broker: BrokerId) {
        *self.broker_replicas.entry(broker).or_insert(0) += 1;
    }

    /// Places one new partition's replica set.
    ///
    /// The leader is the broker with the fewest current leaders; the
    /// remaining replicas are the brokers with the fewest current replicas,
    /// the leader excluded. Ties break on ascending broker id. Index 0 of
    /// the returned set is the preferred leader.
    pub fn assign(&mut self, replication_factor: usize) -> Result<Vec<Broker>> {
        if replication_factor == 0 {
            return Err(Error::Validation(
                "replication_factor should be higher than 0".to_string(),
            ));
        }
        if replication_factor > self.brokers.len() {
            return Err(Error::Validation(format!(
                "replication_factor {} should not be higher than the number of brokers ({})",
                replication_factor,
                self.brokers.len()
            )));
        }

        let mut by_leaders = self.brokers.clone();
        by_leaders.sort_by_key(|b| (self.broker_leaders.get(&b.id).copied().unwrap_or(0), b.id));
        let leader = by_leaders.remove(0);

        // The leader counts as a leader and as a replica against itself for
        // subsequent picks within the same batch.
        self.count_leader(leader.id);
        self.count_replica(leader.id);

        let mut by_replicas: Vec<Broker> = self
            .brokers
            .iter()
            .filter(|b| b.id != leader.id)
            .cloned()
            .collect();
        by_replicas.sort_by_key(|b| (self.broker_replicas.get(&b.id).copied().unwrap_or(0), b.id));

        let mut replicas = vec![leader];
        for broker in by_replicas.into_iter().take(replication_factor - 1) {
            self.count_replica(broker.id);
            replicas.push(broker);
        }
        Ok(replicas)
    }

    /// Total number of partition leaderships in the tally.
    pub fn cluster_leader_count(&self) -> usize {
        self.broker_leaders.values().sum()
    }

    /// Total number of hosted replicas in the tally.
    pub fn cluster_replica_count(&self) -> usize {
        self.broker_replicas.values().sum()
    }

    pub fn broker_leaders(&self) -> &HashMap<BrokerId, usize> {
        &self.broker_leaders
    }

    pub fn broker_replicas(&self) -> &HashMap<BrokerId, usize> {
        &self.broker_replicas
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

    fn assigner_with_load(
        leaders: &[(u32, usize)],
        replicas: &[(u32, usize)],
    ) -> ReplicaAssigner {
        let mut assigner = ReplicaAssigner::new([broker(1), broker(2), broker(3)]);
        for &(id, count) in leaders {
            for _ in 0..count {
                assigner.count_leader(id);
            }
        }
        for &(id, count) in replicas {
            for _ in 0..count {
                assigner.count_replica(id);
            }
        }
        assigner
    }

    #[test]
    fn test_rejects_out_of_range_replication_factor() {
        let mut assigner = ReplicaAssigner::new([broker(1), broker(2), broker(3)]);
        assert!(assigner.assign(0).is_err());
        assert!(assigner.assign(4).is_err());
    }

    #[test]
    fn test_returns_distinct_brokers_leader_first() {
        let mut assigner = ReplicaAssigner::new([broker(1), broker(2), broker(3)]);
        let set = assigner.assign(3).unwrap();
        assert_eq!(set.len(), 3);
        let mut ids: Vec<u32> = set.iter().map(|b| b.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_prefers_least_loaded_brokers() {
        let mut assigner = assigner_with_load(
            &[(1, 2), (2, 2), (3, 1)],
            &[(1, 3), (2, 4), (3, 3)],
        );
        let set = assigner.assign(2).unwrap();
        let ids: Vec<u32> = set.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn test_counters_charge_assignments() {
        let mut assigner = ReplicaAssigner::new([broker(1), broker(2), broker(3)]);
        assigner.assign(2).unwrap();
        assert_eq!(assigner.cluster_leader_count(), 1);
        assert_eq!(assigner.cluster_replica_count(), 2);
    }

    #[test]
    fn test_spread_stays_within_one_under_repeated_assignment() {
        let mut assigner = ReplicaAssigner::new([broker(1), broker(2), broker(3)]);
        for _ in 0..25 {
            assigner.assign(2).unwrap();
        }
        let leader_counts: Vec<usize> = assigner.broker_leaders().values().copied().collect();
        let replica_counts: Vec<usize> = assigner.broker_replicas().values().copied().collect();
        for counts in [leader_counts, replica_counts] {
            let max = counts.iter().max().unwrap();
            let min = counts.iter().min().unwrap();
            assert!(max - min <= 1, "unbalanced counts: {:?}", counts);
        }
    }
}
