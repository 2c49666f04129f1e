//! XMEM target nozzle
//!
//! Owns a single memcached connection to one target kv server and replicates
//! mutations for the vBuckets that server owns. Mutations accumulate in a
//! bounded queue (the upstream connector blocks when it fills) and are
//! written in batches of `SET_WITH_META` / `DEL_WITH_META` requests; the
//! response of every request is classified into acknowledge / retry /
//! re-route / escalate.

use crate::pipeline::part::{
    EventAux, EventKind, EventPublisher, Part, PartState,
};
use crate::pipeline::PipelineConfig;
use crate::protocol::{compose_with_meta, Disposition, HeloFeatures, MutationEvent};
use crate::retry::BackoffConfig;
use crate::service::{ClusterInfoProvider, McConnection, McConnectionFactory};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Agent name sent in the HELO handshake
const XMEM_USER_AGENT: &str = "replistream/xmem";

/// Per-vBucket write progress
#[derive(Debug, Clone, Copy, Default)]
pub struct VbProgress {
    /// Highest seqno that entered the nozzle queue
    pub last_received: u64,
    /// Highest seqno written to the target socket
    pub last_sent: u64,
    /// Highest seqno acknowledged by the target
    pub last_acked: u64,
}

/// Monotonic per-vBucket seqno tracking
///
/// `last_acked` for a vBucket is its through-seqno: every mutation at or
/// below it has been acknowledged by the target.
#[derive(Default)]
pub struct ThroughSeqnoTracker {
    inner: RwLock<HashMap<u16, VbProgress>>,
}

impl ThroughSeqnoTracker {
    /// Record a mutation entering the queue
    pub fn note_received(&self, vbno: u16, seqno: u64) {
        let mut inner = self.inner.write();
        let entry = inner.entry(vbno).or_default();
        entry.last_received = entry.last_received.max(seqno);
    }

    /// Record a mutation written to the socket
    pub fn note_sent(&self, vbno: u16, seqno: u64) {
        let mut inner = self.inner.write();
        let entry = inner.entry(vbno).or_default();
        entry.last_sent = entry.last_sent.max(seqno);
    }

    /// Record a target acknowledgment
    pub fn note_acked(&self, vbno: u16, seqno: u64) {
        let mut inner = self.inner.write();
        let entry = inner.entry(vbno).or_default();
        entry.last_acked = entry.last_acked.max(seqno);
    }

    /// Through-seqno for a vBucket
    pub fn through_seqno(&self, vbno: u16) -> u64 {
        self.inner.read().get(&vbno).map_or(0, |p| p.last_acked)
    }

    /// Full progress snapshot for a vBucket
    pub fn progress(&self, vbno: u16) -> VbProgress {
        self.inner.read().get(&vbno).copied().unwrap_or_default()
    }
}

/// Target nozzle writing one server's vBuckets over memcached
pub struct XmemNozzle {
    id: String,
    bucket: String,
    server: Arc<RwLock<String>>,
    vbnos: Vec<u16>,
    factory: Arc<dyn McConnectionFactory>,
    cluster: Arc<dyn ClusterInfoProvider>,
    publisher: Arc<EventPublisher>,
    state: Arc<RwLock<PartState>>,
    seqnos: Arc<ThroughSeqnoTracker>,
    features: Arc<RwLock<HeloFeatures>>,
    queue_len: Arc<AtomicUsize>,
    queue_bytes: Arc<AtomicUsize>,
    queue_tx: Mutex<Option<mpsc::Sender<Arc<MutationEvent>>>>,
    finish_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl XmemNozzle {
    /// Nozzle for one target server and its vBuckets
    pub fn new(
        id: impl Into<String>,
        server: impl Into<String>,
        bucket: impl Into<String>,
        vbnos: Vec<u16>,
        factory: Arc<dyn McConnectionFactory>,
        cluster: Arc<dyn ClusterInfoProvider>,
    ) -> Self {
        let id = id.into();
        XmemNozzle {
            publisher: Arc::new(EventPublisher::new(id.clone())),
            id,
            bucket: bucket.into(),
            server: Arc::new(RwLock::new(server.into())),
            vbnos,
            factory,
            cluster,
            state: Arc::new(RwLock::new(PartState::Initial)),
            seqnos: Arc::new(ThroughSeqnoTracker::default()),
            features: Arc::new(RwLock::new(HeloFeatures::default())),
            queue_len: Arc::new(AtomicUsize::new(0)),
            queue_bytes: Arc::new(AtomicUsize::new(0)),
            queue_tx: Mutex::new(None),
            finish_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// vBuckets this nozzle is responsible for
    pub fn vbnos(&self) -> &[u16] {
        &self.vbnos
    }

    /// Seqno tracker shared with the checkpoint manager
    pub fn seqno_tracker(&self) -> Arc<ThroughSeqnoTracker> {
        Arc::clone(&self.seqnos)
    }

    /// Features negotiated with the target
    pub fn negotiated_features(&self) -> HeloFeatures {
        *self.features.read()
    }

    /// Enqueue a mutation for replication; blocks while the queue is full
    pub async fn accept(&self, mutation: Arc<MutationEvent>) -> Result<()> {
        let tx = self
            .queue_tx
            .lock()
            .clone()
            .ok_or_else(|| Error::pipeline(format!("{} is not started", self.id)))?;
        let size = mutation.size();
        let (vbno, seqno) = (mutation.vbno, mutation.seqno);

        tx.send(Arc::clone(&mutation))
            .await
            .map_err(|_| Error::pipeline(format!("{} queue is closed", self.id)))?;

        let queue_len = self.queue_len.fetch_add(1, Ordering::SeqCst) + 1;
        let queue_bytes = self.queue_bytes.fetch_add(size, Ordering::SeqCst) + size;
        self.seqnos.note_received(vbno, seqno);
        self.publisher.raise(
            EventKind::DataReceived,
            Some(mutation),
            EventAux {
                seqno,
                vbno,
                size,
                queue_len,
                queue_bytes,
                at: Some(Instant::now()),
                ..Default::default()
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Part for XmemNozzle {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> PartState {
        *self.state.read()
    }

    fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    async fn start(&self, config: Arc<PipelineConfig>) -> Result<()> {
        if *self.state.read() == PartState::Running {
            return Err(Error::pipeline(format!("{} already running", self.id)));
        }

        let server = self.server.read().clone();
        let mut conn = self.factory.connect(&server, &self.bucket).await?;
        let requested = HeloFeatures {
            xattr: true,
            snappy: config.compression,
        };
        let negotiated = conn.helo(XMEM_USER_AGENT, requested).await?;
        *self.features.write() = negotiated;
        tracing::info!(
            part = %self.id,
            server = %server,
            xattr = negotiated.xattr,
            snappy = negotiated.snappy,
            "target features negotiated"
        );

        let capacity = (config.batch_count * 2).max(8);
        let (tx, rx) = mpsc::channel(capacity);
        let (finish_tx, finish_rx) = oneshot::channel();
        *self.queue_tx.lock() = Some(tx);
        *self.finish_tx.lock() = Some(finish_tx);

        let writer = BatchWriter {
            id: self.id.clone(),
            bucket: self.bucket.clone(),
            server: Arc::clone(&self.server),
            conn,
            rx,
            finish_rx,
            config,
            features: Arc::clone(&self.features),
            publisher: Arc::clone(&self.publisher),
            seqnos: Arc::clone(&self.seqnos),
            queue_len: Arc::clone(&self.queue_len),
            queue_bytes: Arc::clone(&self.queue_bytes),
            factory: Arc::clone(&self.factory),
            cluster: Arc::clone(&self.cluster),
            state: Arc::clone(&self.state),
        };
        *self.task.lock() = Some(tokio::spawn(writer.run()));
        *self.state.write() = PartState::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // closing the queue lets the writer drain what it already holds
        self.queue_tx.lock().take();
        if let Some(finish) = self.finish_tx.lock().take() {
            let _ = finish.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut state = self.state.write();
        if *state != PartState::Failed {
            *state = PartState::Stopped;
        }
        tracing::info!(part = %self.id, "xmem nozzle stopped");
        Ok(())
    }
}

struct BatchWriter {
    id: String,
    bucket: String,
    server: Arc<RwLock<String>>,
    conn: Box<dyn McConnection>,
    rx: mpsc::Receiver<Arc<MutationEvent>>,
    finish_rx: oneshot::Receiver<()>,
    config: Arc<PipelineConfig>,
    features: Arc<RwLock<HeloFeatures>>,
    publisher: Arc<EventPublisher>,
    seqnos: Arc<ThroughSeqnoTracker>,
    queue_len: Arc<AtomicUsize>,
    queue_bytes: Arc<AtomicUsize>,
    factory: Arc<dyn McConnectionFactory>,
    cluster: Arc<dyn ClusterInfoProvider>,
    state: Arc<RwLock<PartState>>,
}

/// Outcome of one wire round-trip for a batch
struct RoundTrip {
    retry: Vec<Arc<MutationEvent>>,
    topology_changed: bool,
}

impl BatchWriter {
    async fn run(mut self) {
        let mut batch: Vec<Arc<MutationEvent>> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let flush_at = deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = &mut self.finish_rx => break,
                item = self.rx.recv() => match item {
                    Some(mutation) => {
                        self.queue_len.fetch_sub(1, Ordering::SeqCst);
                        self.queue_bytes.fetch_sub(mutation.size(), Ordering::SeqCst);
                        batch_bytes += mutation.size();
                        batch.push(mutation);
                        if batch.len() >= self.config.batch_count
                            || batch_bytes >= self.config.batch_bytes
                        {
                            if self.flush(&mut batch, &mut batch_bytes, &mut deadline).await.is_err() {
                                break;
                            }
                        } else if deadline.is_none() {
                            deadline = Some(tokio::time::Instant::now() + self.config.batch_age);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    if self.flush(&mut batch, &mut batch_bytes, &mut deadline).await.is_err() {
                        break;
                    }
                }
            }
        }

        // drain the partial batch on the way out
        if !batch.is_empty() {
            let _ = self.send_batch(std::mem::take(&mut batch)).await;
        }
        self.conn.close().await;
    }

    async fn flush(
        &mut self,
        batch: &mut Vec<Arc<MutationEvent>>,
        batch_bytes: &mut usize,
        deadline: &mut Option<tokio::time::Instant>,
    ) -> Result<()> {
        *batch_bytes = 0;
        *deadline = None;
        if batch.is_empty() {
            return Ok(());
        }
        match self.send_batch(std::mem::take(batch)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.publisher.raise_error(&err);
                *self.state.write() = PartState::Failed;
                Err(err)
            }
        }
    }

    async fn send_batch(&mut self, batch: Vec<Arc<MutationEvent>>) -> Result<()> {
        let backoff = BackoffConfig::new(
            self.config.max_retry + 1,
            self.config.retry_interval,
            self.config.retry_factor,
        );
        let mut pending = batch;
        let mut attempt = 0u32;

        while !pending.is_empty() {
            let round = match self.write_and_read(&pending).await {
                Ok(round) => round,
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt > self.config.max_retry {
                        return Err(err);
                    }
                    tokio::time::sleep(backoff.delay_for(attempt)).await;
                    self.reconnect(None).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            pending = round.retry;
            if pending.is_empty() {
                break;
            }

            if round.topology_changed {
                // NOT_MY_VBUCKET: refresh the map and follow the vBucket to
                // its new owner before re-sending
                self.reroute(pending[0].vbno).await?;
            }

            attempt += 1;
            if attempt > self.config.max_retry {
                return Err(Error::transient(format!(
                    "{}: {} mutations still failing after {} retries",
                    self.id,
                    pending.len(),
                    self.config.max_retry
                )));
            }
            tokio::time::sleep(backoff.delay_for(attempt)).await;
        }
        Ok(())
    }

    async fn write_and_read(&mut self, batch: &[Arc<MutationEvent>]) -> Result<RoundTrip> {
        let features = *self.features.read();

        for (index, mutation) in batch.iter().enumerate() {
            let request = compose_with_meta(mutation, features, index as u32)?;
            self.conn.write(&request).await?;
            self.seqnos.note_sent(mutation.vbno, mutation.seqno);
        }
        self.conn.flush().await?;

        let mut round = RoundTrip {
            retry: Vec::new(),
            topology_changed: false,
        };
        for _ in 0..batch.len() {
            let response = self.conn.receive().await?;
            let index = response.opaque as usize;
            let mutation = batch.get(index).ok_or_else(|| {
                Error::protocol(format!("{}: response with unknown opaque", self.id))
            })?;

            match response.status.disposition() {
                Disposition::Success | Disposition::ConflictLoss => {
                    self.acknowledge(mutation, features);
                }
                Disposition::Retry => {
                    round.retry.push(Arc::clone(mutation));
                }
                Disposition::TopologyChanged => {
                    round.topology_changed = true;
                    round.retry.push(Arc::clone(mutation));
                }
                Disposition::Unauthorized => {
                    return Err(Error::Unauthorized(format!(
                        "{}: target rejected credentials",
                        self.id
                    )));
                }
                Disposition::Fatal => {
                    return Err(Error::fatal(format!(
                        "{}: target returned status {:#06x} for seqno {}",
                        self.id,
                        response.status.raw(),
                        mutation.seqno
                    )));
                }
            }
        }
        Ok(round)
    }

    fn acknowledge(&self, mutation: &Arc<MutationEvent>, features: HeloFeatures) {
        self.seqnos.note_acked(mutation.vbno, mutation.seqno);
        let size = compose_with_meta(mutation, features, 0)
            .map(|req| req.size())
            .unwrap_or_else(|_| mutation.size());
        self.publisher.raise(
            EventKind::DataSent,
            Some(Arc::clone(mutation)),
            EventAux {
                seqno: mutation.seqno,
                vbno: mutation.vbno,
                size,
                at: Some(Instant::now()),
                ..Default::default()
            },
        );
    }

    async fn reroute(&mut self, vbno: u16) -> Result<()> {
        let map = self.cluster.server_vbucket_map(&self.bucket).await?;
        let owner = map
            .iter()
            .find(|(_, vbs)| vbs.contains(&vbno))
            .map(|(server, _)| server.clone());

        match owner {
            Some(owner) if owner != *self.server.read() => {
                tracing::info!(
                    part = %self.id,
                    vbno,
                    new_owner = %owner,
                    "vbucket moved, re-routing connection"
                );
                self.reconnect(Some(owner)).await
            }
            Some(_) => {
                // same owner still reports NMV: topology data is stale,
                // treat as transient and let the retry loop pace us
                Ok(())
            }
            None => Err(Error::topology(format!(
                "{}: no owner for vb {} in refreshed map",
                self.id, vbno
            ))),
        }
    }

    async fn reconnect(&mut self, new_server: Option<String>) -> Result<()> {
        if let Some(server) = new_server {
            *self.server.write() = server;
        }
        let server = self.server.read().clone();
        self.conn.close().await;
        self.conn = self.factory.connect(&server, &self.bucket).await?;
        let requested = HeloFeatures {
            xattr: true,
            snappy: self.config.compression,
        };
        let negotiated = self.conn.helo(XMEM_USER_AGENT, requested).await?;
        *self.features.write() = negotiated;
        Ok(())
    }
}
