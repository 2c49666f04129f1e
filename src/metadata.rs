//! Replication metadata: specifications, remote cluster references and the
//! replication settings schema
//!
//! These are the durable entities an administrator manipulates. They persist
//! through the metadata service as self-describing JSON with a numeric schema
//! version; reads of older versions run the settings `post_load`/`upgrade`
//! fix-ups.

use crate::service::{MetadataService, Revision};
use crate::settings::{
    enterprise_only, xmem_only, Schema, SettingConfig, SettingValue, Settings,
};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;

/// Separator inside a replication id
pub const REPLICATION_ID_DELIMITER: &str = "/";

/// Catalog key grouping all replication specifications
pub const REPLICATION_SPECS_CATALOG: &str = "replicationSpec";

/// Metadata key of the default replication settings singleton
pub const DEFAULT_REPLICATION_SETTINGS_KEY: &str = "DefaultReplicationSettings";

/// Schema version written into persisted specs
pub const SPEC_SCHEMA_VERSION: u32 = 1;

// settings keys
/// Replication type: `xmem` or `capi`
pub const REPLICATION_TYPE: &str = "replication_type";
/// Filter expression source text; empty means no filtering
pub const FILTER_EXPRESSION: &str = "filter_expression";
/// Whether the replication is active
pub const ACTIVE: &str = "active";
/// Seconds between checkpoint persists
pub const CHECKPOINT_INTERVAL: &str = "checkpoint_interval";
/// Mutations per target batch
pub const BATCH_COUNT: &str = "batch_count";
/// Kilobytes per target batch
pub const BATCH_SIZE: &str = "batch_size";
/// Milliseconds a partial batch may age before flushing
pub const MAX_BATCH_AGE: &str = "max_batch_age";
/// Seconds to wait before restarting a failed pipeline
pub const FAILURE_RESTART_INTERVAL: &str = "failure_restart_interval";
/// Milliseconds of replication lag considered acceptable
pub const MAX_EXPECTED_REPLICATION_LAG: &str = "max_expected_replication_lag";
/// Bytes below which a mutation skips optimistic pre-checks
pub const OPTIMISTIC_REPLICATION_THRESHOLD: &str = "optimistic_replication_threshold";
/// Source nozzles per source kv node
pub const SOURCE_NOZZLE_PER_NODE: &str = "source_nozzle_per_node";
/// Target nozzles per target kv node
pub const TARGET_NOZZLE_PER_NODE: &str = "target_nozzle_per_node";
/// Retry ceiling for transient target failures
pub const MAX_RETRY: &str = "max_retry";
/// Initial retry delay in milliseconds
pub const RETRY_INTERVAL: &str = "retry_interval";
/// Multiplier between successive retry delays
pub const RETRY_FACTOR: &str = "retry_factor";
/// Milliseconds between statistics publishes
pub const PUBLISH_INTERVAL: &str = "publish_interval";
/// Bounded histogram sample size
pub const SAMPLE_SIZE: &str = "sample_size";
/// Whether a failed pipeline restarts automatically
pub const AUTO_RESTART: &str = "auto_restart";
/// Consecutive failures after which auto-restart gives up
pub const MAX_CONSECUTIVE_FAILURES: &str = "max_consecutive_failures";
/// Wire compression toward the target: `none` or `snappy`
pub const COMPRESSION_TYPE: &str = "compression_type";

/// Replication type variant: memcached meta-preserving writes
pub const REPLICATION_TYPE_XMEM: &str = "xmem";
/// Replication type variant: REST (capi) writes
pub const REPLICATION_TYPE_CAPI: &str = "capi";

/// Schema of the per-replication settings
pub fn replication_settings_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        let mut schema = Schema::new();
        schema.insert(
            REPLICATION_TYPE,
            SettingConfig::enumerated(
                REPLICATION_TYPE_XMEM,
                &[REPLICATION_TYPE_XMEM, REPLICATION_TYPE_CAPI],
            ),
        );
        schema.insert(
            FILTER_EXPRESSION,
            SettingConfig::plain(SettingValue::Str(String::new())),
        );
        schema.insert(ACTIVE, SettingConfig::plain(SettingValue::Bool(true)));
        schema.insert(CHECKPOINT_INTERVAL, SettingConfig::ranged(600, 60, 14_400));
        schema.insert(BATCH_COUNT, SettingConfig::ranged(500, 1, 10_000));
        schema.insert(BATCH_SIZE, SettingConfig::ranged(2048, 10, 10_000));
        schema.insert(MAX_BATCH_AGE, SettingConfig::ranged(500, 10, 60_000));
        schema.insert(
            FAILURE_RESTART_INTERVAL,
            SettingConfig::ranged(30, 1, 300),
        );
        schema.insert(
            MAX_EXPECTED_REPLICATION_LAG,
            SettingConfig::ranged(1000, 100, 3_600_000),
        );
        schema.insert(
            OPTIMISTIC_REPLICATION_THRESHOLD,
            SettingConfig::ranged(256, 0, 20 * 1024 * 1024),
        );
        schema.insert(SOURCE_NOZZLE_PER_NODE, SettingConfig::ranged(2, 1, 100));
        schema.insert(TARGET_NOZZLE_PER_NODE, SettingConfig::ranged(2, 1, 100));
        schema.insert(MAX_RETRY, SettingConfig::ranged(10, 0, 1000));
        schema.insert(RETRY_INTERVAL, SettingConfig::ranged(10, 1, 10_000));
        schema.insert(RETRY_FACTOR, SettingConfig::ranged(2, 1, 10));
        schema.insert(PUBLISH_INTERVAL, SettingConfig::ranged(1000, 100, 3_600_000));
        schema.insert(SAMPLE_SIZE, SettingConfig::ranged(1000, 10, 100_000));
        schema.insert(AUTO_RESTART, SettingConfig::plain(SettingValue::Bool(true)));
        schema.insert(
            MAX_CONSECUTIVE_FAILURES,
            SettingConfig::ranged(5, 1, 100),
        );
        schema.insert(
            COMPRESSION_TYPE,
            SettingConfig::enumerated("none", &["none", "snappy"])
                .with_validator(compression_validator),
        );
        schema
    })
}

/// Compression is enterprise-only and xmem-only
fn compression_validator(
    value: &SettingValue,
    config: &SettingConfig,
    ctx: &crate::settings::ValidationContext,
) -> Result<()> {
    enterprise_only(value, config, ctx)?;
    xmem_only(value, config, ctx)
}

/// Replication settings populated from schema defaults
pub fn default_replication_settings() -> Settings {
    Settings::defaults(replication_settings_schema)
}

/// Build a replication id from its constituents
pub fn replication_id(
    source_bucket: &str,
    target_cluster_uuid: &str,
    target_bucket: &str,
) -> String {
    [source_bucket, target_cluster_uuid, target_bucket].join(REPLICATION_ID_DELIMITER)
}

/// Whether a replication id replicates from the given source bucket
pub fn is_replication_id_for_source_bucket(id: &str, source_bucket: &str) -> bool {
    id.split(REPLICATION_ID_DELIMITER).next() == Some(source_bucket)
}

/// A replication specification: one source bucket replicating to one target
#[derive(Debug, Clone)]
pub struct ReplicationSpecification {
    /// Unique id: `sourceBucket/targetClusterUUID/targetBucket`
    pub id: String,
    /// Source bucket name
    pub source_bucket: String,
    /// Target cluster reference uuid
    pub target_cluster_uuid: String,
    /// Target bucket name
    pub target_bucket: String,
    /// Per-replication settings
    pub settings: Settings,
    /// Revision attached at read time
    pub revision: Option<Revision>,
}

impl ReplicationSpecification {
    /// Create a specification with default settings
    pub fn new(source_bucket: &str, target_cluster_uuid: &str, target_bucket: &str) -> Self {
        ReplicationSpecification {
            id: replication_id(source_bucket, target_cluster_uuid, target_bucket),
            source_bucket: source_bucket.to_string(),
            target_cluster_uuid: target_cluster_uuid.to_string(),
            target_bucket: target_bucket.to_string(),
            settings: default_replication_settings(),
            revision: None,
        }
    }

    /// Serialize to the persisted JSON form
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "version": SPEC_SCHEMA_VERSION,
            "id": self.id,
            "source_bucket": self.source_bucket,
            "target_cluster_uuid": self.target_cluster_uuid,
            "target_bucket": self.target_bucket,
            "settings": self.settings.to_json(),
        })
    }

    /// Reconstruct from persisted bytes, attaching the read revision
    pub fn from_bytes(value: &[u8], rev: Option<Revision>) -> Result<Self> {
        let raw: Value = serde_json::from_slice(value)
            .map_err(|e| Error::invalid_input(format!("malformed replication spec: {}", e)))?;
        let field = |name: &str| -> Result<String> {
            raw.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::invalid_input(format!("replication spec missing {}", name)))
        };
        let settings_raw = raw
            .get("settings")
            .ok_or_else(|| Error::invalid_input("replication spec missing settings"))?;
        let settings = Settings::from_json(settings_raw, replication_settings_schema)?;
        Ok(ReplicationSpecification {
            id: field("id")?,
            source_bucket: field("source_bucket")?,
            target_cluster_uuid: field("target_cluster_uuid")?,
            target_bucket: field("target_bucket")?,
            settings,
            revision: rev,
        })
    }
}

/// Reference to a remote cluster a replication targets
#[derive(Debug, Clone)]
pub struct RemoteClusterReference {
    /// Remote cluster uuid
    pub uuid: String,
    /// Administrator-chosen name
    pub name: String,
    /// `host:port` of the remote admin endpoint
    pub host_name: String,
    /// Credentials user name; empty when a client certificate is used
    pub user_name: String,
    /// Credentials password
    pub password: String,
    /// Whether connections must be encrypted
    pub demand_encryption: bool,
    /// Server certificate when encryption is demanded
    pub certificate: Option<Vec<u8>>,
    /// Revision attached at read time
    pub revision: Option<Revision>,
}

/// Replication specification store over the metadata service
pub struct SpecService {
    metadata: Arc<dyn MetadataService>,
}

impl SpecService {
    /// Create a spec service over a metadata backend
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        SpecService { metadata }
    }

    /// Read one specification
    pub async fn spec(&self, id: &str) -> Result<ReplicationSpecification> {
        let (value, rev) = self.metadata.get(id).await?;
        ReplicationSpecification::from_bytes(&value, Some(rev))
    }

    /// Persist a new specification
    pub async fn add_spec(&self, spec: &ReplicationSpecification) -> Result<()> {
        let value = serde_json::to_vec(&spec.to_json())
            .map_err(|e| Error::fatal(format!("spec serialization failed: {}", e)))?;
        self.metadata
            .add_with_catalog(REPLICATION_SPECS_CATALOG, &spec.id, value)
            .await
    }

    /// Replace a specification, checking its revision
    pub async fn set_spec(&self, spec: &ReplicationSpecification) -> Result<()> {
        let value = serde_json::to_vec(&spec.to_json())
            .map_err(|e| Error::fatal(format!("spec serialization failed: {}", e)))?;
        self.metadata.set(&spec.id, value, spec.revision).await
    }

    /// Delete a specification
    pub async fn delete_spec(&self, id: &str) -> Result<()> {
        let (_, rev) = self.metadata.get(id).await?;
        self.metadata
            .delete_with_catalog(REPLICATION_SPECS_CATALOG, id, Some(rev))
            .await
    }

    /// All persisted specifications
    pub async fn all_specs(&self) -> Result<Vec<ReplicationSpecification>> {
        let entries = self
            .metadata
            .get_all_from_catalog(REPLICATION_SPECS_CATALOG)
            .await?;
        let mut specs = Vec::with_capacity(entries.len());
        for entry in entries {
            specs.push(ReplicationSpecification::from_bytes(
                &entry.value,
                Some(entry.rev),
            )?);
        }
        Ok(specs)
    }

    /// Ids of specifications replicating from a source bucket
    pub async fn spec_ids_for_bucket(&self, bucket: &str) -> Result<Vec<String>> {
        let keys = self
            .metadata
            .get_all_keys_from_catalog(REPLICATION_SPECS_CATALOG)
            .await?;
        Ok(keys
            .into_iter()
            .filter(|id| is_replication_id_for_source_bucket(id, bucket))
            .collect())
    }

    /// The default settings singleton; schema defaults when never persisted
    pub async fn default_settings(&self) -> Result<Settings> {
        match self.metadata.get(DEFAULT_REPLICATION_SETTINGS_KEY).await {
            Ok((value, _rev)) => {
                let raw: Value = serde_json::from_slice(&value).map_err(|e| {
                    Error::invalid_input(format!("malformed default settings: {}", e))
                })?;
                Settings::from_json(&raw, replication_settings_schema)
            }
            Err(Error::NotFound(_)) => Ok(default_replication_settings()),
            Err(err) => Err(err),
        }
    }

    /// Persist the default settings singleton
    pub async fn set_default_settings(
        &self,
        settings: &Settings,
        rev: Option<Revision>,
    ) -> Result<()> {
        let value = serde_json::to_vec(&settings.to_json())
            .map_err(|e| Error::fatal(format!("settings serialization failed: {}", e)))?;
        match rev {
            Some(_) => {
                self.metadata
                    .set(DEFAULT_REPLICATION_SETTINGS_KEY, value, rev)
                    .await
            }
            None => self.metadata.add(DEFAULT_REPLICATION_SETTINGS_KEY, value).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MemMetadataService;

    #[test]
    fn test_replication_id_format() {
        let id = replication_id("beer-sample", "f4e2a1", "beer-backup");
        assert_eq!(id, "beer-sample/f4e2a1/beer-backup");
        assert!(is_replication_id_for_source_bucket(&id, "beer-sample"));
        assert!(!is_replication_id_for_source_bucket(&id, "beer"));
    }

    #[test]
    fn test_default_settings_values() {
        let settings = default_replication_settings();
        assert_eq!(settings.get_str(REPLICATION_TYPE), REPLICATION_TYPE_XMEM);
        assert_eq!(settings.get_int(BATCH_COUNT), 500);
        assert_eq!(settings.get_int(BATCH_SIZE), 2048);
        assert!(settings.get_bool(ACTIVE));
        assert_eq!(settings.get_str(FILTER_EXPRESSION), "");
    }

    #[test]
    fn test_spec_round_trip() {
        let mut spec = ReplicationSpecification::new("src", "uuid-1", "dst");
        let mut updates = std::collections::HashMap::new();
        updates.insert(BATCH_COUNT.to_string(), serde_json::Value::from(42));
        let (_, errors) = spec
            .settings
            .update_from_map(&updates, &Default::default());
        assert!(errors.is_empty());

        let bytes = serde_json::to_vec(&spec.to_json()).unwrap();
        let reloaded =
            ReplicationSpecification::from_bytes(&bytes, Some(Revision(3))).unwrap();
        assert_eq!(reloaded.id, spec.id);
        assert_eq!(reloaded.settings.get_int(BATCH_COUNT), 42);
        assert_eq!(reloaded.revision, Some(Revision(3)));
        assert_eq!(reloaded.settings, spec.settings);
    }

    #[tokio::test]
    async fn test_spec_service_cycle() {
        let metadata = Arc::new(MemMetadataService::new());
        let service = SpecService::new(metadata);

        let spec = ReplicationSpecification::new("src", "u1", "dst");
        service.add_spec(&spec).await.unwrap();

        let mut loaded = service.spec(&spec.id).await.unwrap();
        assert_eq!(loaded.source_bucket, "src");
        assert!(loaded.revision.is_some());

        let mut updates = std::collections::HashMap::new();
        updates.insert(BATCH_COUNT.to_string(), serde_json::Value::from(99));
        loaded.settings.update_from_map(&updates, &Default::default());
        service.set_spec(&loaded).await.unwrap();

        let ids = service.spec_ids_for_bucket("src").await.unwrap();
        assert_eq!(ids, vec![spec.id.clone()]);
        assert!(service.spec_ids_for_bucket("other").await.unwrap().is_empty());

        service.delete_spec(&spec.id).await.unwrap();
        assert!(service.all_specs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_settings_singleton() {
        let metadata = Arc::new(MemMetadataService::new());
        let service = SpecService::new(metadata.clone());

        // unpersisted: schema defaults
        let defaults = service.default_settings().await.unwrap();
        assert_eq!(defaults.get_int(BATCH_COUNT), 500);

        let mut settings = defaults.clone();
        let mut updates = std::collections::HashMap::new();
        updates.insert(PUBLISH_INTERVAL.to_string(), serde_json::Value::from(250));
        settings.update_from_map(&updates, &Default::default());
        service.set_default_settings(&settings, None).await.unwrap();

        let reloaded = service.default_settings().await.unwrap();
        assert_eq!(reloaded.get_int(PUBLISH_INTERVAL), 250);
    }
}
