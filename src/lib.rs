//! Replistream - Cross-Datacenter Replication Engine
//!
//! Continuously streams document mutations from a source bucket (partitioned
//! into vBuckets across kv servers) to a target bucket in a remote cluster,
//! preserving per-vBucket ordering, surviving node and network failure, and
//! exposing live telemetry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Pipeline Supervisor                   │
//! │   Pending → Starting → Replicating → Paused/Failed → …   │
//! └──────────────┬───────────────────────────────────────────┘
//!                │ owns
//! ┌──────────────┴───────────────────────────────────────────┐
//! │  DCP nozzle ──► Router/Filter ──► XMEM nozzle ──► target │
//! │      │               │                 │                 │
//! │      └───────── typed events ──────────┘                 │
//! └──────┬──────────────────────────────────────┬────────────┘
//!        │                                      │
//! ┌──────┴───────────┐                 ┌────────┴──────────┐
//! │ Checkpoint mgr   │                 │ Statistics mgr    │
//! │ (resume points,  │                 │ (lag correlation, │
//! │  through-seqnos) │                 │  rates, queues)   │
//! └──────────────────┘                 └───────────────────┘
//! ```
//!
//! External collaborators (metadata persistence, cluster topology, the
//! memcached transport, the filter expression compiler, the target REST
//! handshake) are consumed through the traits in [`service`].

pub mod checkpoint;
pub mod error;
pub mod metadata;
pub mod parts;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod service;
pub mod settings;
pub mod stats;
pub mod testing;

pub use error::{Error, Result};
pub use metadata::{ReplicationSpecification, SpecService};
pub use pipeline::part::{ComponentEvent, EventAux, EventKind, EventListener, Part};
pub use pipeline::supervisor::{PipelineState, PipelineSupervisor};
pub use pipeline::{Pipeline, PipelineConfig, PipelineServices, ReplicationStatus};
pub use protocol::{DcpMessage, HeloFeatures, MutationEvent, MutationKind};
pub use settings::{SettingValue, Settings};
