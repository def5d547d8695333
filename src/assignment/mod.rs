//! Replica placement and reassignment planning.
//!
//! [`ReplicaAssigner`] places the replicas of new partitions so leader and
//! replica load stay evenly divided over the brokers. [`reassigner`] plans
//! multi-step migrations from one replica set to another without ever losing
//! all in-sync replicas at once.

mod assigner;
pub mod reassigner;

pub use assigner::ReplicaAssigner;
