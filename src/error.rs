//! Crate-level error types.
//!
//! Every failure surfaces as a [`Error`] carrying a human-readable message;
//! errors that originate from a coordination store round-trip always include
//! the node path and the status code that was received.
//!
//! # Classification policy
//!
//! Each store round-trip ends in one of three outcomes: success, "no such
//! node", or some other error code. Operations in this crate classify the
//! outcome at the call site:
//!
//! - "no such node" is a valid result where the protocol defines an absent
//!   node as meaningful (no committed offset, no current claim, inactive
//!   group) and is an error everywhere else;
//! - any unexpected status is wrapped in [`Error::Store`] with the path and
//!   the symbolic + numeric code for diagnosis.

use std::time::Duration;

use thiserror::Error as ThisError;

use crate::store::StoreStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the coordination client.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed input, always raised before any store mutation is attempted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A persisted payload carries a schema version this client does not understand.
    #[error("Unsupported version {version} in payload at {path}")]
    VersionNotSupported { path: String, version: i64 },

    /// The broker root namespace is absent; no Kafka cluster is registered in this store.
    #[error("No Kafka cluster is registered in this coordination store")]
    NoClusterRegistered,

    /// The topic does not exist in the cluster.
    #[error("Topic {0} does not exist")]
    TopicNotFound(String),

    /// The topic already exists and cannot be created again.
    #[error("Topic {0} already exists")]
    TopicAlreadyExists(String),

    /// A deletion marker for this topic is already present.
    #[error("Topic {0} is already marked for deletion")]
    TopicAlreadyMarkedForDeletion(String),

    /// A preferred leader election request is still pending.
    #[error("Another preferred leader election is still in progress")]
    ElectionInProgress,

    /// The partition has no live leader (yet).
    #[error("Partition {topic}/{partition} has no leader")]
    NoLeader { topic: String, partition: u32 },

    /// The consumer group has no running instances, so its subscription is undefined.
    #[error("Consumer group {0} has no running instances; cannot determine subscription")]
    NoRunningInstances(String),

    /// Running instances of the group disagree on their subscription.
    #[error("Subscriptions of running instances of group {0} are different from each other")]
    InconsistentSubscriptions(String),

    /// A subscription payload or expression could not be understood.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Expected, recoverable outcome of racing claim attempts. Callers should
    /// try a different partition rather than retrying the same one.
    #[error("Partition {topic}/{partition} is already claimed")]
    PartitionAlreadyClaimed { topic: String, partition: u32 },

    /// Registering a consumer instance in the group failed.
    #[error("Failed to register instance {instance} for consumer group {group}: {status}")]
    InstanceRegistrationFailed {
        group: String,
        instance: String,
        status: StoreStatus,
    },

    /// Releasing a claimed partition failed.
    #[error("Failed to release partition {topic}/{partition}: {status}")]
    ReleasePartitionFailed {
        topic: String,
        partition: u32,
        status: StoreStatus,
    },

    /// No safe reassignment plan exists under the given constraints.
    #[error("Cannot generate a safe reassignment plan: {0}")]
    ReassignmentPlan(String),

    /// Generic coordination error: an unexpected status from the store.
    #[error("Store operation on {path} failed: {status}")]
    Store { path: String, status: StoreStatus },

    /// A registered watch was dropped before its event fired.
    #[error("Watch on {0} was canceled before an event fired")]
    WatchCanceled(String),

    /// A bounded wait elapsed before the awaited condition held.
    #[error("Timed out after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },

    /// A fan-out worker task failed to join.
    #[error("Worker task failed: {0}")]
    Task(String),

    /// Payload (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Network or connection level failure from the store client.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}
