//! External collaborator interfaces
//!
//! The engine consumes these services but does not implement them (metadata
//! persistence transport, cluster topology discovery, the memcached client,
//! the filter expression compiler, the target checkpoint REST surface). Each
//! is an async trait; an in-memory metadata service ships here because the
//! checkpoint and spec services need a concrete store in embedded and test
//! deployments.

mod capi;
mod cluster;
mod filter;
mod mc;
mod metadata_svc;

pub use capi::{CheckpointHandshake, MassValidationResult, RemoteVBReplicationStatus};
pub use cluster::ClusterInfoProvider;
pub use filter::{FilterFactory, FilterMatcher};
pub use mc::{DcpStream, DcpStreamFactory, McConnection, McConnectionFactory};
pub use metadata_svc::{MemMetadataService, MetadataEntry, MetadataService, Revision};
