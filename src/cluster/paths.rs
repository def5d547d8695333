//! Store path layout.
//!
//! These paths must match the layout an existing Kafka cluster writes into
//! ZooKeeper; they are the interoperability contract of this crate.
//!
//! | Path | Contents |
//! |---|---|
//! | `/brokers/ids/<id>` | JSON `{version, host, port, jmx_port?}` |
//! | `/brokers/topics/<name>` | JSON `{version: 1, partitions: {<id>: [broker, ...]}}` |
//! | `/brokers/topics/<name>/partitions/<id>/state` | JSON `{leader, isr, ...}` |
//! | `/config/topics/<name>` | JSON `{version: 1, config: {key: value}}` |
//! | `/config/changes/config_change_<seq>` | sequential marker, payload = quoted topic name |
//! | `/admin/delete_topics/<name>` | existence = deletion requested |
//! | `/admin/preferred_replica_election` | JSON election request |
//! | `/consumers/<group>/ids/<instance>` | ephemeral, JSON subscription |
//! | `/consumers/<group>/owners/<topic>/<id>` | ephemeral, payload = instance id |
//! | `/consumers/<group>/offsets/<topic>/<id>` | payload = next offset, decimal string |

pub const BROKER_IDS: &str = "/brokers/ids";
pub const TOPICS: &str = "/brokers/topics";
pub const CONFIG_TOPICS: &str = "/config/topics";
pub const CONFIG_CHANGES: &str = "/config/changes";
pub const DELETE_TOPICS: &str = "/admin/delete_topics";
pub const PREFERRED_REPLICA_ELECTION: &str = "/admin/preferred_replica_election";
pub const CONSUMERS: &str = "/consumers";

pub fn broker(id: u32) -> String {
    format!("{}/{}", BROKER_IDS, id)
}

pub fn topic(name: &str) -> String {
    format!("{}/{}", TOPICS, name)
}

pub fn partition_state(topic: &str, partition: u32) -> String {
    format!("{}/{}/partitions/{}/state", TOPICS, topic, partition)
}

pub fn topic_config(name: &str) -> String {
    format!("{}/{}", CONFIG_TOPICS, name)
}

/// Prefix for sequential config change markers; the store appends the suffix.
pub fn config_change() -> String {
    format!("{}/config_change_", CONFIG_CHANGES)
}

pub fn delete_topic(name: &str) -> String {
    format!("{}/{}", DELETE_TOPICS, name)
}

pub fn group(name: &str) -> String {
    format!("{}/{}", CONSUMERS, name)
}

pub fn group_ids(name: &str) -> String {
    format!("{}/{}/ids", CONSUMERS, name)
}

pub fn group_owners(name: &str) -> String {
    format!("{}/{}/owners", CONSUMERS, name)
}

pub fn group_offsets(name: &str) -> String {
    format!("{}/{}/offsets", CONSUMERS, name)
}

pub fn instance(group: &str, instance: &str) -> String {
    format!("{}/{}/ids/{}", CONSUMERS, group, instance)
}

pub fn topic_owners(group: &str, topic: &str) -> String {
    format!("{}/{}/owners/{}", CONSUMERS, group, topic)
}

pub fn partition_owner(group: &str, topic: &str, partition: u32) -> String {
    format!("{}/{}/owners/{}/{}", CONSUMERS, group, topic, partition)
}

pub fn topic_offsets(group: &str, topic: &str) -> String {
    format!("{}/{}/offsets/{}", CONSUMERS, group, topic)
}

pub fn partition_offset(group: &str, topic: &str, partition: u32) -> String {
    format!("{}/{}/offsets/{}/{}", CONSUMERS, group, topic, partition)
}

/// Parent of a store path; the parent of a top-level node is `/`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

/// Joins a child name onto a parent path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_kafka_conventions() {
        assert_eq!(broker(3), "/brokers/ids/3");
        assert_eq!(topic("events"), "/brokers/topics/events");
        assert_eq!(
            partition_state("events", 2),
            "/brokers/topics/events/partitions/2/state"
        );
        assert_eq!(topic_config("events"), "/config/topics/events");
        assert_eq!(delete_topic("events"), "/admin/delete_topics/events");
        assert_eq!(
            partition_owner("grp", "events", 0),
            "/consumers/grp/owners/events/0"
        );
        assert_eq!(
            partition_offset("grp", "events", 0),
            "/consumers/grp/offsets/events/0"
        );
    }

    #[test]
    fn test_parent_and_join() {
        assert_eq!(parent("/brokers/ids/3"), "/brokers/ids");
        assert_eq!(parent("/brokers"), "/");
        assert_eq!(join("/", "brokers"), "/brokers");
        assert_eq!(join("/brokers", "ids"), "/brokers/ids");
    }
}
