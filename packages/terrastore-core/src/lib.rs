//! Terrastore Core -- hashing, partitioning, and the command/wire protocol.
//!
//! This crate provides the foundation layer for the routing, partitioning,
//! and request-dispatch subsystem:
//!
//! - **Hash** ([`hash`]): MurmurHash-2-class 32-bit hash, the wire-visible
//!   contract every node in the ensemble must agree on.
//! - **Partition** ([`partition`]): [`partition::EnsemblePartitioner`]
//!   (bucket to cluster) and [`partition::ClusterPartitioner`] (bucket/key
//!   to node within a cluster).
//! - **Command** ([`command`]): the tagged-variant command protocol and the
//!   length-prefixed wire framing types.
//! - **Error** ([`error`]): the five-kind error taxonomy shared by every
//!   layer above this one.
//! - **Types** ([`types`]): small shared data-model types (`Cluster`,
//!   partitioner configuration).

pub mod command;
pub mod error;
pub mod hash;
pub mod partition;
pub mod types;

pub use command::{wire, Command, CommandKind, CommandResult, KeyRange, MemberAddress, PROTOCOL_VERSION};
pub use error::{ErrorMessage, RouteError};
pub use partition::{ClusterPartitioner, EnsemblePartitioner};
pub use types::{Cluster, ClusterPartitionerConfig};
