//! Replica placement seeded from live cluster metadata, and migration
//! planning over broker values.

use std::sync::Arc;

use zkafka::assignment::{reassigner, ReplicaAssigner};
use zkafka::store::memory::MemoryStore;
use zkafka::{Broker, Cluster};

fn broker_json(id: u32) -> String {
    format!(r#"{{"version":1,"host":"kafka{}","port":9092}}"#, id)
}

async fn seed(store: &MemoryStore) {
    for id in 1..=3 {
        store
            .put(&format!("/brokers/ids/{}", id), broker_json(id))
            .await
            .unwrap();
    }
    // Five partitions giving leader counts {1: 2, 2: 2, 3: 1} and replica
    // counts {1: 3, 2: 4, 3: 3}.
    store
        .put(
            "/brokers/topics/alpha",
            r#"{"version":1,"partitions":{"0":[1,2],"1":[1,3],"2":[2,3]}}"#,
        )
        .await
        .unwrap();
    store
        .put(
            "/brokers/topics/beta",
            r#"{"version":1,"partitions":{"0":[2,1],"1":[3,2]}}"#,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_assigner_seeds_from_cluster_load() {
    let store = MemoryStore::new();
    seed(&store).await;
    let cluster = Cluster::new(Arc::new(store.clone()));

    let assigner = ReplicaAssigner::for_cluster(&cluster).await.unwrap();
    assert_eq!(assigner.cluster_leader_count(), 5);
    assert_eq!(assigner.cluster_replica_count(), 10);
    assert_eq!(assigner.broker_leaders()[&3], 1);
    assert_eq!(assigner.broker_replicas()[&2], 4);
}

#[tokio::test]
async fn test_assignment_picks_least_loaded_brokers() {
    let store = MemoryStore::new();
    seed(&store).await;
    let cluster = Cluster::new(Arc::new(store.clone()));

    let mut assigner = ReplicaAssigner::for_cluster(&cluster).await.unwrap();
    // Broker 3 has the fewest leaders; of the rest, broker 1 hosts fewer
    // replicas than broker 2.
    let set = assigner.assign(2).unwrap();
    let ids: Vec<u32> = set.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![3, 1]);
}

#[tokio::test]
async fn test_reassignment_plan_over_broker_values() {
    let store = MemoryStore::new();
    seed(&store).await;
    let cluster = Cluster::new(Arc::new(store.clone()));

    let brokers = cluster.brokers().await.unwrap();
    let topic = cluster.topic("alpha").await.unwrap().unwrap();
    let partition = topic.partitions(&cluster).await.unwrap().remove(0);

    let from: Vec<Broker> = partition.replicas().to_vec();
    let to = vec![brokers[&3].clone(), brokers[&1].clone()];

    let plan = reassigner::steps(&from, &to, 1, None, true).unwrap();
    assert_eq!(plan.first().unwrap(), &from);
    assert_eq!(plan.last().unwrap(), &to);
    for pair in plan.windows(2) {
        assert!(reassigner::safe_reassignment(&pair[0], &pair[1], 1, 2));
    }
}
