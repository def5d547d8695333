//! # zkafka
//!
//! A coordination client for Kafka clusters that keep their control-plane
//! metadata in a ZooKeeper-style store. It models brokers, topics and
//! partitions as the cluster writes them, implements the legacy
//! ZooKeeper-mediated consumer group protocol (ephemeral membership,
//! partition claims, offset bookkeeping), and plans replica placement and
//! reassignment.
//!
//! ## Architecture
//!
//! - [`store`]: the path-addressed facade over the coordination store, with
//!   one-shot watches. An in-memory implementation backs the test suite.
//! - [`cluster`]: the metadata directory. [`Cluster`] caches brokers and
//!   topics, fans out fetches concurrently, and carries topic lifecycle
//!   operations (create, grow, destroy, config changes).
//! - [`subscription`]: static and pattern subscriptions with the version-1
//!   wire serialization.
//! - [`consumer`]: consumer groups and their running instances, claims and
//!   offsets.
//! - [`assignment`]: balanced replica placement for new partitions and
//!   availability-preserving reassignment plans.
//! - [`telemetry`]: logging setup.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zkafka::{Cluster, Subscription};
//! # async fn example(store: Arc<dyn zkafka::store::CoordinationStore>) -> zkafka::Result<()> {
//! let cluster = Cluster::new(store);
//!
//! let brokers = cluster.brokers().await?;
//! println!("cluster has {} brokers", brokers.len());
//!
//! let group = cluster.consumergroup("reporting");
//! group.create(&cluster).await?;
//!
//! let mut instance = group.instantiate(None);
//! instance
//!     .register(&cluster, &Subscription::static_topics(["events"])?)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod assignment;
pub mod cluster;
pub mod consumer;
pub mod error;
pub mod store;
pub mod subscription;
pub mod telemetry;

pub use assignment::ReplicaAssigner;
pub use cluster::{Broker, BrokerId, Cluster, ClusterOptions, Partition, Preload, Topic};
pub use consumer::{Consumergroup, Instance};
pub use error::{Error, Result};
pub use subscription::{PatternKind, Subscription};
