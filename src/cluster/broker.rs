//! Broker records.

use serde::Deserialize;
use tokio::task::JoinSet;

use crate::cluster::partition::Partition;
use crate::cluster::Cluster;
use crate::error::{Error, Result};

pub type BrokerId = u32;

/// One member of the cluster, as registered under `/brokers/ids/<id>`.
///
/// Immutable after construction. Identity is the broker id within its
/// cluster: two `Broker` values with the same id compare equal regardless of
/// their other fields. The id carries no cluster discriminant, so values
/// obtained from different [`Cluster`]s must not be mixed in one collection.
#[derive(Debug, Clone)]
pub struct Broker {
    pub id: BrokerId,
    pub host: String,
    pub port: u16,
    pub jmx_port: Option<i32>,
}

impl PartialEq for Broker {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Broker {}

impl std::hash::Hash for Broker {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Registration payload written by the broker itself.
#[derive(Debug, Deserialize)]
struct BrokerRegistration {
    version: i64,
    host: String,
    port: u16,
    #[serde(default)]
    jmx_port: Option<i32>,
}

impl Broker {
    /// Decodes a broker from its registration node payload.
    ///
    /// Versions 1 through 3 share the fields this client reads; anything else
    /// fails with `VersionNotSupported`.
    pub(crate) fn from_json(id: BrokerId, payload: &[u8], path: &str) -> Result<Broker> {
        let registration: BrokerRegistration = serde_json::from_slice(payload)?;
        match registration.version {
            1..=3 => Ok(Broker {
                id,
                host: registration.host,
                port: registration.port,
                jmx_port: registration.jmx_port,
            }),
            version => Err(Error::VersionNotSupported {
                path: path.to_string(),
                version,
            }),
        }
    }

    /// The address to connect to, `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// All partitions currently led by this broker. Resolves each partition's
    /// runtime state concurrently.
    pub async fn led_partitions(&self, cluster: &Cluster) -> Result<Vec<Partition>> {
        let id = self.id;
        self.select_partitions(cluster, move |leader, _| leader.id == id)
            .await
    }

    /// All partitions hosting a replica on this broker.
    pub async fn replicated_partitions(&self, cluster: &Cluster) -> Result<Vec<Partition>> {
        let mut result = Vec::new();
        for partition in cluster.partitions().await? {
            if partition.replicas().contains(self) {
                result.push(partition);
            }
        }
        Ok(result)
    }

    /// Whether losing this broker would leave some partition without the
    /// required number of in-sync replicas.
    pub async fn is_critical(&self, cluster: &Cluster, required_replicas: usize) -> Result<bool> {
        let id = self.id;
        let affected = self
            .select_partitions(cluster, move |_, isr| {
                isr.iter().filter(|replica| replica.id != id).count() < required_replicas
            })
            .await?;
        Ok(!affected.is_empty())
    }

    /// Fans out one state fetch per partition hosted on this broker and keeps
    /// those for which the predicate holds on (leader, isr). Partitions the
    /// broker holds no replica of are never inspected.
    async fn select_partitions<F>(&self, cluster: &Cluster, predicate: F) -> Result<Vec<Partition>>
    where
        F: Fn(&Broker, &[Broker]) -> bool + Send + Sync + Copy + 'static,
    {
        let mut tasks = JoinSet::new();
        for partition in self.replicated_partitions(cluster).await? {
            let cluster = cluster.clone();
            tasks.spawn(async move {
                let leader = partition.leader(&cluster).await?;
                let isr = partition.isr(&cluster).await?;
                Ok::<_, Error>((partition, predicate(&leader, &isr)))
            });
        }

        let mut result = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (partition, selected) = joined??;
            if selected {
                result.push(partition);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(broker: &Broker) -> u64 {
        let mut hasher = DefaultHasher::new();
        broker.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_identity_is_the_id() {
        let a = Broker {
            id: 1,
            host: "kafka1".to_string(),
            port: 9092,
            jmx_port: None,
        };
        let b = Broker {
            id: 1,
            host: "kafka1.internal".to_string(),
            port: 9093,
            jmx_port: Some(9999),
        };
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = Broker { id: 2, ..a.clone() };
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_json_versions() {
        let payload = br#"{"version":1,"host":"kafka1","port":9092,"jmx_port":9999}"#;
        let broker = Broker::from_json(1, payload, "/brokers/ids/1").unwrap();
        assert_eq!(broker.addr(), "kafka1:9092");
        assert_eq!(broker.jmx_port, Some(9999));

        let payload = br#"{"version":2,"host":"kafka2","port":9092}"#;
        let broker = Broker::from_json(2, payload, "/brokers/ids/2").unwrap();
        assert_eq!(broker.jmx_port, None);

        let payload = br#"{"version":9,"host":"kafka3","port":9092}"#;
        let err = Broker::from_json(3, payload, "/brokers/ids/3").unwrap_err();
        assert!(matches!(
            err,
            Error::VersionNotSupported { version: 9, .. }
        ));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(Broker::from_json(1, b"not json", "/brokers/ids/1").is_err());
    }
}
