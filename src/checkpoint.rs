//! Checkpoint manager
//!
//! Periodically persists per-vBucket replication progress and, on restart,
//! negotiates a safe resume point with the target. A checkpoint may only
//! record a seqno the target has acknowledged in full (the through-seqno),
//! so resuming from it can at worst re-send duplicates, never lose data.
//!
//! Each vBucket keeps a short history of records; resume walks that history
//! newest-first and falls back to a zero start when the target confirms none
//! of them.

use crate::retry::with_conflict_retry;
use crate::service::{
    CheckpointHandshake, MassValidationResult, MetadataService, RemoteVBReplicationStatus, Revision,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Schema version written into persisted checkpoint documents
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Records retained per vBucket, newest first
pub const MAX_CHECKPOINT_RECORDS: usize = 5;

/// Stream position of one vBucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBTimestamp {
    /// vBucket number
    pub vbno: u16,
    /// vBucket UUID the position is valid under
    pub vb_uuid: u64,
    /// Sequence number
    pub seqno: u64,
    /// Snapshot window start
    pub snapshot_start: u64,
    /// Snapshot window end
    pub snapshot_end: u64,
}

impl VBTimestamp {
    /// Zero-vector start for a vBucket
    pub fn zero(vbno: u16) -> Self {
        VBTimestamp {
            vbno,
            vb_uuid: 0,
            seqno: 0,
            snapshot_start: 0,
            snapshot_end: 0,
        }
    }
}

/// One persisted checkpoint for one vBucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Target vBucket UUID at checkpoint time
    pub target_vb_uuid: u64,
    /// Target committed seqno at checkpoint time
    pub target_seqno: u64,
    /// Source vBucket UUID the stream ran under
    pub source_vb_uuid: u64,
    /// Source through-seqno: everything at or below is on the target
    pub source_seqno: u64,
    /// Source snapshot window start
    pub snapshot_start: u64,
    /// Source snapshot window end
    pub snapshot_end: u64,
    /// Failover log entry the record was cut under
    pub failover_uuid: u64,
    /// Seqno of that failover log entry
    pub failover_seqno: u64,
}

impl CheckpointRecord {
    /// Resume timestamp encoded by this record
    pub fn timestamp(&self, vbno: u16) -> VBTimestamp {
        VBTimestamp {
            vbno,
            vb_uuid: self.source_vb_uuid,
            seqno: self.source_seqno,
            snapshot_start: self.snapshot_start,
            snapshot_end: self.snapshot_end,
        }
    }
}

/// Persisted per-vBucket checkpoint history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointsDoc {
    /// Schema version; older documents upgrade on read
    #[serde(default)]
    pub version: u32,
    /// Records, newest first
    #[serde(default)]
    pub records: Vec<CheckpointRecord>,
}

impl CheckpointsDoc {
    fn upgraded(mut self) -> Self {
        if self.version < CHECKPOINT_SCHEMA_VERSION {
            self.version = CHECKPOINT_SCHEMA_VERSION;
        }
        self
    }
}

/// Source-side progress surface the manager reads at checkpoint time
pub trait SourceProgress: Send + Sync {
    /// Largest seqno with everything at or below acknowledged by the target
    fn through_seqno(&self, vbno: u16) -> u64;

    /// Current stream position of a vBucket, when its stream is open
    fn stream_position(&self, vbno: u16) -> Option<StreamPosition>;
}

/// Live stream facts the checkpoint record is cut from
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamPosition {
    /// vBucket UUID the stream runs under
    pub vb_uuid: u64,
    /// Current snapshot window start
    pub snapshot_start: u64,
    /// Current snapshot window end
    pub snapshot_end: u64,
}

/// Periodic checkpointing and resume negotiation for one pipeline
pub struct CheckpointManager {
    topic: String,
    metadata: Arc<dyn MetadataService>,
    handshake: Arc<dyn CheckpointHandshake>,
    source: RwLock<Option<Arc<dyn SourceProgress>>>,
    vbnos: Vec<u16>,
    docs: Mutex<HashMap<u16, (CheckpointsDoc, Option<Revision>)>>,
    finish_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointManager {
    /// Manager for one replication topic and its vBuckets
    pub fn new(
        topic: impl Into<String>,
        vbnos: Vec<u16>,
        metadata: Arc<dyn MetadataService>,
        handshake: Arc<dyn CheckpointHandshake>,
    ) -> Self {
        CheckpointManager {
            topic: topic.into(),
            metadata,
            handshake,
            source: RwLock::new(None),
            vbnos,
            docs: Mutex::new(HashMap::new()),
            finish_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Wire the source progress surface (pipeline parts) in
    pub fn set_source(&self, source: Arc<dyn SourceProgress>) {
        *self.source.write() = Some(source);
    }

    fn record_key(&self, vbno: u16) -> String {
        format!("ckpt/{}/{}", self.topic, vbno)
    }

    fn catalog_key(&self) -> String {
        format!("ckpt/{}", self.topic)
    }

    /// Load persisted checkpoint documents into the cache
    pub async fn load(&self) -> Result<()> {
        for vbno in &self.vbnos {
            let key = self.record_key(*vbno);
            let loaded = match self.metadata.get(&key).await {
                Ok((value, rev)) => {
                    let doc: CheckpointsDoc = serde_json::from_slice(&value).map_err(|e| {
                        Error::invalid_input(format!("malformed checkpoint doc for vb {}: {}", vbno, e))
                    })?;
                    (doc.upgraded(), Some(rev))
                }
                Err(Error::NotFound(_)) => (CheckpointsDoc::default(), None),
                Err(err) => return Err(err),
            };
            self.docs.lock().insert(*vbno, loaded);
        }
        Ok(())
    }

    /// Newest record for a vBucket
    pub fn latest_record(&self, vbno: u16) -> Option<CheckpointRecord> {
        self.docs
            .lock()
            .get(&vbno)
            .and_then(|(doc, _)| doc.records.first().cloned())
    }

    /// Validate all vBuckets' stored target positions in one batch
    ///
    /// vBuckets the target contradicts or does not know lose their stored
    /// history and restart from zero.
    pub async fn mass_validate(&self) -> Result<MassValidationResult> {
        let entries: Vec<RemoteVBReplicationStatus> = {
            let docs = self.docs.lock();
            self.vbnos
                .iter()
                .filter_map(|vbno| {
                    docs.get(vbno).and_then(|(doc, _)| {
                        doc.records.first().map(|rec| RemoteVBReplicationStatus {
                            vbno: *vbno,
                            vb_uuid: rec.target_vb_uuid,
                            seqno: rec.target_seqno,
                        })
                    })
                })
                .collect()
        };
        if entries.is_empty() {
            return Ok(MassValidationResult::default());
        }

        let result = self.handshake.mass_validate(&entries).await?;
        for vbno in result.mismatching.iter().chain(result.missing.iter()) {
            tracing::warn!(
                topic = %self.topic,
                vbno,
                "target no longer matches stored checkpoints, dropping history"
            );
            self.replace_doc(*vbno, CheckpointsDoc {
                version: CHECKPOINT_SCHEMA_VERSION,
                records: Vec::new(),
            })
            .await?;
        }
        Ok(result)
    }

    /// Negotiate resume timestamps for all vBuckets
    ///
    /// Walks each vBucket's record history newest-first: a record is usable
    /// when the target confirms its `(target_vb_uuid, target_seqno)` and its
    /// source UUID still appears in the vBucket's failover log. With no
    /// usable record the vBucket restarts from zero.
    pub async fn resume(
        &self,
        failover_logs: &HashMap<u16, Vec<(u64, u64)>>,
    ) -> Result<HashMap<u16, VBTimestamp>> {
        self.load().await?;
        let mut timestamps = HashMap::with_capacity(self.vbnos.len());

        for vbno in &self.vbnos {
            let records = self
                .docs
                .lock()
                .get(vbno)
                .map(|(doc, _)| doc.records.clone())
                .unwrap_or_default();
            let failover_log = failover_logs.get(vbno);

            let mut resumed = None;
            for record in &records {
                if !source_uuid_in_log(record, failover_log) {
                    continue;
                }
                let known = RemoteVBReplicationStatus {
                    vbno: *vbno,
                    vb_uuid: record.target_vb_uuid,
                    seqno: record.target_seqno,
                };
                let (matched, current_uuid) = self.handshake.pre_replicate(&known).await?;
                if matched {
                    resumed = Some(record.timestamp(*vbno));
                    break;
                }
                tracing::debug!(
                    topic = %self.topic,
                    vbno,
                    stored_uuid = record.target_vb_uuid,
                    current_uuid,
                    "checkpoint rejected by target, trying an older one"
                );
            }

            let ts = resumed.unwrap_or_else(|| {
                tracing::info!(topic = %self.topic, vbno, "no valid checkpoint, restarting from zero");
                VBTimestamp::zero(*vbno)
            });
            timestamps.insert(*vbno, ts);
        }
        Ok(timestamps)
    }

    /// Cut and persist one round of checkpoints
    pub async fn checkpoint_once(&self) -> Result<()> {
        let source = self
            .source
            .read()
            .clone()
            .ok_or_else(|| Error::pipeline(format!("{}: checkpoint source not wired", self.topic)))?;

        for vbno in &self.vbnos {
            let Some(position) = source.stream_position(*vbno) else {
                continue;
            };
            let through_seqno = source.through_seqno(*vbno);

            let stored_uuid = self
                .latest_record(*vbno)
                .map(|rec| rec.target_vb_uuid)
                .unwrap_or(0);
            let (target_seqno, current_uuid) =
                self.handshake.commit_for_checkpoint(*vbno, stored_uuid).await?;
            // a non-zero returned uuid means the target rolled
            let target_vb_uuid = if current_uuid != 0 {
                current_uuid
            } else {
                stored_uuid
            };

            let record = CheckpointRecord {
                target_vb_uuid,
                target_seqno,
                source_vb_uuid: position.vb_uuid,
                source_seqno: through_seqno,
                snapshot_start: position.snapshot_start.min(through_seqno),
                snapshot_end: position.snapshot_end,
                failover_uuid: position.vb_uuid,
                failover_seqno: through_seqno,
            };

            let doc = {
                let mut docs = self.docs.lock();
                let (doc, _) = docs.entry(*vbno).or_default();
                doc.version = CHECKPOINT_SCHEMA_VERSION;
                doc.records.insert(0, record);
                doc.records.truncate(MAX_CHECKPOINT_RECORDS);
                doc.clone()
            };
            self.persist(*vbno, doc).await?;
        }
        Ok(())
    }

    /// Persist a vBucket's document with optimistic concurrency
    async fn persist(&self, vbno: u16, doc: CheckpointsDoc) -> Result<()> {
        let key = self.record_key(vbno);
        let value = serde_json::to_vec(&doc)
            .map_err(|e| Error::fatal(format!("checkpoint serialization failed: {}", e)))?;

        let rev = self.docs.lock().get(&vbno).and_then(|(_, rev)| *rev);
        let metadata = Arc::clone(&self.metadata);
        let catalog = self.catalog_key();
        let first_write = rev.is_none();

        let value_for_retry = value.clone();
        with_conflict_retry("persist_checkpoint", 3, || {
            let metadata = Arc::clone(&metadata);
            let key = key.clone();
            let catalog = catalog.clone();
            let value = value_for_retry.clone();
            async move {
                if first_write {
                    match metadata.add_with_catalog(&catalog, &key, value.clone()).await {
                        Ok(()) => return Ok(()),
                        // someone persisted first; fall through to a set
                        Err(Error::Conflict(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                let (_, current_rev) = metadata.get(&key).await?;
                metadata.set(&key, value, Some(current_rev)).await
            }
        })
        .await?;

        let (_, new_rev) = self.metadata.get(&key).await?;
        self.docs.lock().insert(vbno, (doc, Some(new_rev)));
        Ok(())
    }

    async fn replace_doc(&self, vbno: u16, doc: CheckpointsDoc) -> Result<()> {
        let had_rev = self
            .docs
            .lock()
            .get(&vbno)
            .map(|(_, rev)| rev.is_some())
            .unwrap_or(false);
        if had_rev {
            self.persist(vbno, doc).await
        } else {
            self.docs.lock().insert(vbno, (doc, None));
            Ok(())
        }
    }

    /// Start the periodic checkpoint ticker
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let (finish_tx, mut finish_rx) = oneshot::channel();
        *self.finish_tx.lock() = Some(finish_tx);

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut finish_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.checkpoint_once().await {
                            tracing::error!(topic = %manager.topic, error = %err, "checkpoint round failed");
                        }
                    }
                }
            }
            // final checkpoint on the way down
            if let Err(err) = manager.checkpoint_once().await {
                tracing::warn!(topic = %manager.topic, error = %err, "shutdown checkpoint failed");
            }
        });
        *self.task.lock() = Some(task);
    }

    /// Stop the ticker, cutting a final checkpoint
    pub async fn stop(&self) {
        if let Some(finish) = self.finish_tx.lock().take() {
            let _ = finish.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!(topic = %self.topic, "checkpoint manager stopped");
    }
}

#[async_trait]
impl crate::parts::dcp::RollbackHandler for CheckpointManager {
    /// Supply the next stream attempt after a rollback demand
    ///
    /// Keeps only records at or below the rollback seqno; the newest survivor
    /// becomes the restart point. With no survivor the stream restarts at the
    /// rollback seqno under the last known source UUID.
    async fn rollback_point(&self, vbno: u16, seqno: u64) -> Result<VBTimestamp> {
        let (ts, doc) = {
            let mut docs = self.docs.lock();
            let (doc, _) = docs.entry(vbno).or_default();
            let prior = doc.records.first().cloned();
            doc.records.retain(|rec| rec.source_seqno <= seqno);

            let ts = match doc.records.first() {
                Some(rec) => rec.timestamp(vbno),
                None => {
                    let vb_uuid = prior.as_ref().map(|rec| rec.source_vb_uuid).unwrap_or(0);
                    let clamped = VBTimestamp {
                        vbno,
                        vb_uuid,
                        seqno,
                        snapshot_start: seqno,
                        snapshot_end: seqno,
                    };
                    if let Some(prior) = prior {
                        doc.records.insert(
                            0,
                            CheckpointRecord {
                                source_seqno: seqno,
                                snapshot_start: seqno,
                                snapshot_end: seqno,
                                failover_seqno: seqno,
                                ..prior
                            },
                        );
                    }
                    clamped
                }
            };
            (ts, doc.clone())
        };
        self.replace_doc(vbno, doc).await?;
        Ok(ts)
    }
}

fn source_uuid_in_log(record: &CheckpointRecord, log: Option<&Vec<(u64, u64)>>) -> bool {
    match log {
        None => true,
        Some(entries) if entries.is_empty() => true,
        Some(entries) => entries.iter().any(|(uuid, _)| *uuid == record.source_vb_uuid),
    }
}
