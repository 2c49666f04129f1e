//! Target checkpoint handshake interface
//!
//! Three idempotent per-vBucket operations on the target cluster, used to
//! validate resume points and to read the target's committed seqno at
//! checkpoint time.

use crate::Result;
use async_trait::async_trait;

/// What the engine believes about a remote vBucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVBReplicationStatus {
    /// vBucket number
    pub vbno: u16,
    /// Last known target vBucket UUID (0 when unknown)
    pub vb_uuid: u64,
    /// Last known target seqno
    pub seqno: u64,
}

impl RemoteVBReplicationStatus {
    /// Status for a vBucket the engine knows nothing about
    pub fn empty(vbno: u16) -> Self {
        RemoteVBReplicationStatus {
            vbno,
            vb_uuid: 0,
            seqno: 0,
        }
    }
}

/// Result of a batched vBucket UUID validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MassValidationResult {
    /// vBuckets whose `(uuid, seqno)` the target confirmed
    pub matching: Vec<u16>,
    /// vBuckets whose uuid the target contradicts
    pub mismatching: Vec<u16>,
    /// vBuckets the target does not know
    pub missing: Vec<u16>,
}

/// Target-side checkpoint handshake
#[async_trait]
pub trait CheckpointHandshake: Send + Sync {
    /// `_pre_replicate`: whether the known status still matches the target;
    /// returns `(match, current target vb_uuid)`
    async fn pre_replicate(&self, known: &RemoteVBReplicationStatus) -> Result<(bool, u64)>;

    /// `_commit_for_checkpoint`: the target's committed seqno for a vBucket;
    /// returns `(target seqno, current target vb_uuid)` where a non-zero
    /// uuid means the target rolled and the stored uuid must be replaced
    async fn commit_for_checkpoint(&self, vbno: u16, vb_uuid: u64) -> Result<(u64, u64)>;

    /// `_mass_validate_vb_uuids`: batched validation at activation time
    async fn mass_validate(
        &self,
        entries: &[RemoteVBReplicationStatus],
    ) -> Result<MassValidationResult>;
}
