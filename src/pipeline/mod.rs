//! Per-replication pipeline
//!
//! A pipeline replicates one specification: DCP source nozzles (one per
//! source kv server) feed routers which fan mutations out to XMEM target
//! nozzles (one per target kv server), with the checkpoint manager and the
//! statistics manager riding alongside and the supervisor owning lifecycle.
//!
//! ```text
//!  DCP nozzle ──► Router ──► XMEM nozzle ──► remote target
//!      │             │            │
//!      └──────── events ──────────┘
//!          (supervisor, statistics)
//! ```

pub mod part;
pub mod supervisor;

use crate::checkpoint::{CheckpointManager, SourceProgress, StreamPosition, VBTimestamp};
use crate::metadata::{self, ReplicationSpecification};
use crate::parts::{DcpNozzle, Router, XmemNozzle};
use crate::pool::BytePool;
use crate::service::{
    CheckpointHandshake, ClusterInfoProvider, DcpStreamFactory, FilterFactory, FilterMatcher,
    McConnectionFactory, MetadataService,
};
use crate::settings::Settings;
use crate::stats::{StatisticsManager, StatsContext};
use crate::{Error, Result};
use async_trait::async_trait;
use part::{EventKind, Part};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{PipelineState, PipelineSupervisor};

/// Deadline for children to honour a stop signal
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable settings snapshot handed to every part at start
///
/// Hot reconfiguration requires a pipeline restart; nothing here changes
/// while the pipeline runs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Mutations per target batch
    pub batch_count: usize,
    /// Bytes per target batch
    pub batch_bytes: usize,
    /// Age at which a partial batch flushes
    pub batch_age: Duration,
    /// Transient-failure retry ceiling
    pub max_retry: u32,
    /// Initial retry delay
    pub retry_interval: Duration,
    /// Backoff multiplier
    pub retry_factor: f64,
    /// Interval between checkpoint rounds
    pub checkpoint_interval: Duration,
    /// Interval between statistics publishes
    pub publish_interval: Duration,
    /// Histogram sample bound
    pub sample_size: usize,
    /// Filter expression source; empty disables filtering
    pub filter_expression: String,
    /// Whether to request Snappy toward the target
    pub compression: bool,
    /// Shutdown deadline
    pub stop_timeout: Duration,
    /// Restart policy: reactivate after failure
    pub auto_restart: bool,
    /// Restart policy: give up after this many consecutive failures
    pub max_consecutive_failures: u32,
    /// Restart policy: delay before reactivation
    pub failure_restart_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::from_settings(&metadata::default_replication_settings())
    }
}

impl PipelineConfig {
    /// Snapshot the typed knobs out of a settings instance
    pub fn from_settings(settings: &Settings) -> Self {
        PipelineConfig {
            batch_count: settings.get_int(metadata::BATCH_COUNT) as usize,
            batch_bytes: settings.get_int(metadata::BATCH_SIZE) as usize * 1024,
            batch_age: Duration::from_millis(settings.get_int(metadata::MAX_BATCH_AGE) as u64),
            max_retry: settings.get_int(metadata::MAX_RETRY) as u32,
            retry_interval: Duration::from_millis(
                settings.get_int(metadata::RETRY_INTERVAL) as u64
            ),
            retry_factor: settings.get_int(metadata::RETRY_FACTOR) as f64,
            checkpoint_interval: Duration::from_secs(
                settings.get_int(metadata::CHECKPOINT_INTERVAL) as u64,
            ),
            publish_interval: Duration::from_millis(
                settings.get_int(metadata::PUBLISH_INTERVAL) as u64,
            ),
            sample_size: settings.get_int(metadata::SAMPLE_SIZE) as usize,
            filter_expression: settings.get_str(metadata::FILTER_EXPRESSION),
            compression: settings.get_str(metadata::COMPRESSION_TYPE) == "snappy",
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            auto_restart: settings.get_bool(metadata::AUTO_RESTART),
            max_consecutive_failures: settings.get_int(metadata::MAX_CONSECUTIVE_FAILURES) as u32,
            failure_restart_interval: Duration::from_secs(
                settings.get_int(metadata::FAILURE_RESTART_INTERVAL) as u64,
            ),
        }
    }
}

/// External services a pipeline is built over
#[derive(Clone)]
pub struct PipelineServices {
    /// Metadata persistence
    pub metadata: Arc<dyn MetadataService>,
    /// Source cluster topology
    pub source_cluster: Arc<dyn ClusterInfoProvider>,
    /// Target cluster topology
    pub target_cluster: Arc<dyn ClusterInfoProvider>,
    /// DCP consumer connections
    pub dcp_factory: Arc<dyn DcpStreamFactory>,
    /// Memcached connections (target writes and stats queries)
    pub mc_factory: Arc<dyn McConnectionFactory>,
    /// Target checkpoint handshake
    pub handshake: Arc<dyn CheckpointHandshake>,
    /// Filter expression compiler; required when specs carry expressions
    pub filter_factory: Option<Arc<dyn FilterFactory>>,
}

/// Admin-facing status of one replication
#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    /// Current pipeline state
    pub state: PipelineState,
    /// Recent errors, oldest first
    pub errors: Vec<String>,
    /// Published overview statistics
    pub stats: Option<serde_json::Value>,
}

/// Owns pipelines built from replication specifications (external)
#[async_trait]
pub trait ReplicationManager: Send + Sync {
    /// Create and persist a specification
    async fn add_spec(&self, spec: ReplicationSpecification) -> Result<()>;

    /// Update a persisted specification
    async fn set_spec(&self, spec: ReplicationSpecification) -> Result<()>;

    /// Delete a specification, deactivating its pipeline
    async fn delete_spec(&self, id: &str) -> Result<()>;

    /// All persisted specifications
    async fn list_specs(&self) -> Result<Vec<ReplicationSpecification>>;

    /// Status of one replication
    async fn replication_status(&self, topic: &str) -> Result<ReplicationStatus>;
}

/// One running replication: parts, services and supervision
pub struct Pipeline {
    topic: String,
    instance_id: String,
    config: Arc<PipelineConfig>,
    source_bucket: String,
    sources: Vec<Arc<DcpNozzle>>,
    routers: Vec<Arc<Router>>,
    targets: Vec<Arc<XmemNozzle>>,
    supervisor: Arc<PipelineSupervisor>,
    stats: Arc<StatisticsManager>,
    checkpoints: Arc<CheckpointManager>,
    services: PipelineServices,
    source_map: HashMap<String, Vec<u16>>,
}

impl Pipeline {
    /// Build the pipeline graph for a specification
    pub async fn build(
        spec: &ReplicationSpecification,
        services: PipelineServices,
    ) -> Result<Pipeline> {
        let topic = spec.id.clone();
        let config = Arc::new(PipelineConfig::from_settings(&spec.settings));

        let source_map = services
            .source_cluster
            .server_vbucket_map(&spec.source_bucket)
            .await?;
        let target_map = services
            .target_cluster
            .server_vbucket_map(&spec.target_bucket)
            .await?;

        let mut all_vbnos: Vec<u16> = source_map.values().flatten().copied().collect();
        all_vbnos.sort_unstable();
        all_vbnos.dedup();
        if all_vbnos.is_empty() {
            return Err(Error::pipeline(format!(
                "{}: source bucket has no vbuckets",
                topic
            )));
        }

        let filter = build_filter(&config, services.filter_factory.as_deref())?;

        // one target nozzle per target server, mapped by the vbuckets it owns
        let mut target_servers: Vec<&String> = target_map.keys().collect();
        target_servers.sort();
        let mut targets = Vec::with_capacity(target_servers.len());
        let mut target_by_vb: HashMap<u16, Arc<XmemNozzle>> = HashMap::new();
        for (index, server) in target_servers.iter().enumerate() {
            let vbnos = target_map.get(*server).cloned().unwrap_or_default();
            let nozzle = Arc::new(XmemNozzle::new(
                format!("xmem_{}", index),
                (*server).clone(),
                spec.target_bucket.clone(),
                vbnos.clone(),
                Arc::clone(&services.mc_factory),
                Arc::clone(&services.target_cluster),
            ));
            for vbno in vbnos {
                target_by_vb.insert(vbno, Arc::clone(&nozzle));
            }
            targets.push(nozzle);
        }
        for vbno in &all_vbnos {
            if !target_by_vb.contains_key(vbno) {
                return Err(Error::topology(format!(
                    "{}: target bucket has no owner for vb {}",
                    topic, vbno
                )));
            }
        }

        // one dcp nozzle and one router per source server
        let pool = Arc::new(BytePool::new());
        let mut source_servers: Vec<&String> = source_map.keys().collect();
        source_servers.sort();
        let mut sources = Vec::with_capacity(source_servers.len());
        let mut routers = Vec::with_capacity(source_servers.len());
        for (index, server) in source_servers.iter().enumerate() {
            let vbnos = source_map.get(*server).cloned().unwrap_or_default();
            let nozzle = Arc::new(DcpNozzle::new(
                format!("dcp_{}", index),
                (*server).clone(),
                spec.source_bucket.clone(),
                vbnos.clone(),
                Arc::clone(&services.dcp_factory),
            ));
            let router_targets: HashMap<u16, Arc<XmemNozzle>> = vbnos
                .iter()
                .filter_map(|vbno| target_by_vb.get(vbno).map(|t| (*vbno, Arc::clone(t))))
                .collect();
            let router = Arc::new(Router::new(
                format!("router_{}", index),
                router_targets,
                filter.clone(),
                Arc::clone(&pool),
            ));
            nozzle.set_connector(Arc::clone(&router) as Arc<dyn part::Connector>);
            sources.push(nozzle);
            routers.push(router);
        }

        let checkpoints = Arc::new(CheckpointManager::new(
            topic.clone(),
            all_vbnos,
            Arc::clone(&services.metadata),
            Arc::clone(&services.handshake),
        ));
        for source in &sources {
            source.set_rollback_handler(Arc::clone(&checkpoints) as Arc<dyn crate::parts::RollbackHandler>);
        }

        let progress = Arc::new(PipelineProgress::new(&sources, &targets));
        checkpoints.set_source(progress);

        let stats = Arc::new(StatisticsManager::new(
            topic.clone(),
            Arc::clone(&services.mc_factory),
        ));
        stats.attach(&sources, &routers, &targets, config.sample_size);

        let supervisor = Arc::new(PipelineSupervisor::new(topic.clone(), config.stop_timeout));
        for source in &sources {
            let part: Arc<dyn Part> = Arc::clone(source) as Arc<dyn Part>;
            part.publisher()
                .register_listener(EventKind::ErrorRaised, Arc::clone(&supervisor) as _);
            supervisor.adopt(part);
        }
        for target in &targets {
            let part: Arc<dyn Part> = Arc::clone(target) as Arc<dyn Part>;
            part.publisher()
                .register_listener(EventKind::ErrorRaised, Arc::clone(&supervisor) as _);
            supervisor.adopt(part);
        }
        stats
            .publisher()
            .register_listener(EventKind::ErrorRaised, Arc::clone(&supervisor) as _);

        let instance_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            topic = %topic,
            instance = %instance_id,
            sources = sources.len(),
            targets = targets.len(),
            "pipeline graph assembled"
        );

        Ok(Pipeline {
            topic,
            instance_id,
            config,
            source_bucket: spec.source_bucket.clone(),
            sources,
            routers,
            targets,
            supervisor,
            stats,
            checkpoints,
            services,
            source_map,
        })
    }

    /// Pipeline topic (= specification id)
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unique id of this pipeline instance
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Router connectors
    pub fn routers(&self) -> &[Arc<Router>] {
        &self.routers
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        self.supervisor.state()
    }

    /// Supervisor handle
    pub fn supervisor(&self) -> &Arc<PipelineSupervisor> {
        &self.supervisor
    }

    /// Statistics manager handle
    pub fn stats(&self) -> &Arc<StatisticsManager> {
        &self.stats
    }

    /// Checkpoint manager handle
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Target nozzles
    pub fn targets(&self) -> &[Arc<XmemNozzle>] {
        &self.targets
    }

    /// Admin-facing status snapshot
    pub fn status(&self) -> ReplicationStatus {
        ReplicationStatus {
            state: self.state(),
            errors: self
                .supervisor
                .errors()
                .into_iter()
                .map(|e| e.message)
                .collect(),
            stats: self.stats.overview(),
        }
    }

    /// Start replication: validate checkpoints, negotiate resume points,
    /// bring parts up downstream-first
    pub async fn start(&self) -> Result<()> {
        self.supervisor.transition(PipelineState::Starting)?;
        match self.start_inner().await {
            Ok(()) => {
                self.supervisor.transition(PipelineState::Replicating)?;
                self.supervisor.note_clean_run();
                tracing::info!(topic = %self.topic, "pipeline replicating");
                Ok(())
            }
            Err(err) => {
                self.supervisor.report_fatal(err.to_string());
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        self.checkpoints.load().await?;
        let validated = self.checkpoints.mass_validate().await?;
        if !validated.mismatching.is_empty() || !validated.missing.is_empty() {
            tracing::info!(
                topic = %self.topic,
                mismatching = validated.mismatching.len(),
                missing = validated.missing.len(),
                "target checkpoint validation dropped stale history"
            );
        }

        let failover_logs = self.fetch_failover_logs().await?;
        let mut timestamps = self.checkpoints.resume(&failover_logs).await?;
        // a zero start still streams under the vBucket's current lineage
        for (vbno, ts) in timestamps.iter_mut() {
            if ts.vb_uuid == 0 {
                if let Some((uuid, _)) = failover_logs.get(vbno).and_then(|log| log.first()) {
                    ts.vb_uuid = *uuid;
                }
            }
        }

        // downstream first, so the queues exist before mutations flow
        for target in &self.targets {
            target.start(Arc::clone(&self.config)).await?;
        }
        for source in &self.sources {
            let starts: HashMap<u16, VBTimestamp> = source
                .vbnos()
                .iter()
                .filter_map(|vbno| timestamps.get(vbno).map(|ts| (*vbno, *ts)))
                .collect();
            source.set_start_timestamps(starts);
            source.start(Arc::clone(&self.config)).await?;
        }

        self.stats.set_context(StatsContext {
            active_vbs: self.source_map.clone(),
            start_seqnos: timestamps.iter().map(|(vbno, ts)| (*vbno, ts.seqno)).collect(),
            bucket: self.source_bucket.clone(),
        });
        self.stats.start(Arc::clone(&self.config))?;
        self.checkpoints.start(self.config.checkpoint_interval);
        Ok(())
    }

    async fn fetch_failover_logs(&self) -> Result<HashMap<u16, Vec<(u64, u64)>>> {
        let mut logs = HashMap::new();
        for source in &self.sources {
            let mut stream = self
                .services
                .dcp_factory
                .open(source.server(), &self.source_bucket)
                .await?;
            for vbno in source.vbnos() {
                logs.insert(*vbno, stream.failover_log(*vbno).await?);
            }
            stream.close().await;
        }
        Ok(logs)
    }

    /// Stop replication: final checkpoint, then children under the deadline
    pub async fn stop(&self) -> Result<()> {
        self.checkpoints.stop().await;
        self.stats.stop().await;
        self.supervisor.stop_children().await
    }

    /// Pause replication; `start` resumes from the latest checkpoints
    pub async fn pause(&self) -> Result<()> {
        self.supervisor.transition(PipelineState::Paused)?;
        self.checkpoints.stop().await;
        self.stats.stop().await;
        for source in &self.sources {
            source.stop().await?;
        }
        for target in &self.targets {
            target.stop().await?;
        }
        tracing::info!(topic = %self.topic, "pipeline paused");
        Ok(())
    }
}

fn build_filter(
    config: &PipelineConfig,
    factory: Option<&dyn FilterFactory>,
) -> Result<Option<Arc<dyn FilterMatcher>>> {
    if config.filter_expression.is_empty() {
        return Ok(None);
    }
    let factory = factory.ok_or_else(|| {
        Error::pipeline("specification carries a filter expression but no filter factory is wired")
    })?;
    factory.compile(&config.filter_expression).map(Some)
}

/// Bridges part-level progress into the checkpoint manager
struct PipelineProgress {
    dcp_by_vb: HashMap<u16, Arc<DcpNozzle>>,
    trackers_by_vb: HashMap<u16, Arc<crate::parts::ThroughSeqnoTracker>>,
}

impl PipelineProgress {
    fn new(sources: &[Arc<DcpNozzle>], targets: &[Arc<XmemNozzle>]) -> Self {
        let mut dcp_by_vb = HashMap::new();
        for source in sources {
            for vbno in source.vbnos() {
                dcp_by_vb.insert(*vbno, Arc::clone(source));
            }
        }
        let mut trackers_by_vb = HashMap::new();
        for target in targets {
            for vbno in target.vbnos() {
                trackers_by_vb.insert(*vbno, target.seqno_tracker());
            }
        }
        PipelineProgress {
            dcp_by_vb,
            trackers_by_vb,
        }
    }
}

impl SourceProgress for PipelineProgress {
    fn through_seqno(&self, vbno: u16) -> u64 {
        self.trackers_by_vb
            .get(&vbno)
            .map_or(0, |tracker| tracker.through_seqno(vbno))
    }

    fn stream_position(&self, vbno: u16) -> Option<StreamPosition> {
        let nozzle = self.dcp_by_vb.get(&vbno)?;
        let state = nozzle.stream_state(vbno)?;
        Some(StreamPosition {
            vb_uuid: state.vb_uuid,
            snapshot_start: state.snapshot_start,
            snapshot_end: state.snapshot_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = metadata::default_replication_settings();
        let config = PipelineConfig::from_settings(&settings);
        assert_eq!(config.batch_count, 500);
        assert_eq!(config.batch_bytes, 2048 * 1024);
        assert_eq!(config.publish_interval, Duration::from_millis(1000));
        assert!(!config.compression);
        assert!(config.auto_restart);
    }

    #[test]
    fn test_config_compression_flag() {
        let mut settings = metadata::default_replication_settings();
        let mut updates = HashMap::new();
        updates.insert(
            metadata::COMPRESSION_TYPE.to_string(),
            serde_json::Value::from("snappy"),
        );
        let ctx = crate::settings::ValidationContext {
            enterprise: true,
            capi: false,
        };
        let (_, errors) = settings.update_from_map(&updates, &ctx);
        assert!(errors.is_empty());
        assert!(PipelineConfig::from_settings(&settings).compression);
    }
}
