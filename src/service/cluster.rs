//! Cluster topology interface

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Resolves bucket topology: which kv servers exist and which vBuckets each
/// owns, honouring alternate/external addresses where the cluster publishes
/// them
#[async_trait]
pub trait ClusterInfoProvider: Send + Sync {
    /// kv server list for a bucket
    async fn server_list(&self, bucket: &str) -> Result<Vec<String>>;

    /// server address → owned vBuckets for a bucket
    async fn server_vbucket_map(&self, bucket: &str) -> Result<HashMap<String, Vec<u16>>>;

    /// vBuckets a specific node owns, as of the latest topology
    async fn active_vbuckets(&self, bucket: &str, node: &str) -> Result<Vec<u16>> {
        let map = self.server_vbucket_map(bucket).await?;
        Ok(map.get(node).cloned().unwrap_or_default())
    }
}
