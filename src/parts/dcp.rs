//! DCP source nozzle
//!
//! Opens one DCP connection to a source kv server and streams a fixed set of
//! vBuckets from checkpoint-provided positions. The reader task preserves
//! per-vBucket DCP order and runs the router inline, so a mutation is fully
//! routed (or dropped) before the next one for its vBucket is read.

use crate::checkpoint::VBTimestamp;
use crate::pipeline::part::{
    Connector, EventAux, EventKind, EventPublisher, Part, PartState,
};
use crate::pipeline::PipelineConfig;
use crate::protocol::{DcpMessage, StreamEndReason};
use crate::service::{DcpStream, DcpStreamFactory};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Streams run to the end of time; quiescence comes from STREAM_END
const STREAM_END_SEQNO: u64 = u64::MAX;

/// Supplies the resume point after a DCP rollback demand
#[async_trait]
pub trait RollbackHandler: Send + Sync {
    /// Timestamp to restart the vBucket stream from, at or before `seqno`
    async fn rollback_point(&self, vbno: u16, seqno: u64) -> Result<VBTimestamp>;
}

/// Live stream state of one vBucket
#[derive(Debug, Clone, Copy, Default)]
pub struct VbStreamState {
    /// vBucket UUID the stream was opened against
    pub vb_uuid: u64,
    /// Current snapshot window start
    pub snapshot_start: u64,
    /// Current snapshot window end
    pub snapshot_end: u64,
    /// Last received seqno
    pub last_received: u64,
    /// Whether the producer ended the stream cleanly
    pub quiescent: bool,
}

/// Source nozzle draining one server's vBuckets over DCP
pub struct DcpNozzle {
    id: String,
    server: String,
    bucket: String,
    vbnos: Vec<u16>,
    factory: Arc<dyn DcpStreamFactory>,
    connector: RwLock<Option<Arc<dyn Connector>>>,
    rollback: RwLock<Option<Arc<dyn RollbackHandler>>>,
    publisher: Arc<EventPublisher>,
    state: Arc<RwLock<PartState>>,
    vb_state: Arc<RwLock<HashMap<u16, VbStreamState>>>,
    starts: Mutex<Option<HashMap<u16, VBTimestamp>>>,
    finish_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DcpNozzle {
    /// Nozzle for one source server and its vBuckets
    pub fn new(
        id: impl Into<String>,
        server: impl Into<String>,
        bucket: impl Into<String>,
        vbnos: Vec<u16>,
        factory: Arc<dyn DcpStreamFactory>,
    ) -> Self {
        let id = id.into();
        DcpNozzle {
            publisher: Arc::new(EventPublisher::new(id.clone())),
            id,
            server: server.into(),
            bucket: bucket.into(),
            vbnos,
            factory,
            connector: RwLock::new(None),
            rollback: RwLock::new(None),
            state: Arc::new(RwLock::new(PartState::Initial)),
            vb_state: Arc::new(RwLock::new(HashMap::new())),
            starts: Mutex::new(None),
            finish_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// vBuckets this nozzle streams
    pub fn vbnos(&self) -> &[u16] {
        &self.vbnos
    }

    /// Source server this nozzle reads from
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Attach the downstream connector
    pub fn set_connector(&self, connector: Arc<dyn Connector>) {
        *self.connector.write() = Some(connector);
    }

    /// Attach the rollback handler (the checkpoint manager)
    pub fn set_rollback_handler(&self, handler: Arc<dyn RollbackHandler>) {
        *self.rollback.write() = Some(handler);
    }

    /// Install the per-vBucket start timestamps for the next start
    pub fn set_start_timestamps(&self, starts: HashMap<u16, VBTimestamp>) {
        *self.starts.lock() = Some(starts);
    }

    /// Stream state of one vBucket, for the checkpoint manager
    pub fn stream_state(&self, vbno: u16) -> Option<VbStreamState> {
        self.vb_state.read().get(&vbno).copied()
    }

    /// Open the stream and issue a stream request per vBucket
    async fn open_streams(
        &self,
        starts: &HashMap<u16, VBTimestamp>,
    ) -> Result<Box<dyn DcpStream>> {
        let mut stream = self.factory.open(&self.server, &self.bucket).await?;
        let rollback = self.rollback.read().clone();

        for vbno in &self.vbnos {
            let mut ts = starts
                .get(vbno)
                .copied()
                .unwrap_or_else(|| VBTimestamp::zero(*vbno));
            loop {
                let result = stream
                    .stream_request(
                        *vbno,
                        ts.vb_uuid,
                        ts.seqno,
                        STREAM_END_SEQNO,
                        ts.snapshot_start,
                        ts.snapshot_end,
                    )
                    .await;
                match result {
                    Ok(()) => break,
                    Err(Error::Rollback { vbno, seqno }) => {
                        let handler = rollback.as_ref().ok_or_else(|| {
                            Error::pipeline(format!("{}: no rollback handler attached", self.id))
                        })?;
                        ts = handler.rollback_point(vbno, seqno).await?;
                        tracing::info!(
                            part = %self.id,
                            vbno,
                            seqno = ts.seqno,
                            "retrying stream request from rollback point"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            self.vb_state.write().insert(
                *vbno,
                VbStreamState {
                    vb_uuid: ts.vb_uuid,
                    snapshot_start: ts.snapshot_start,
                    snapshot_end: ts.snapshot_end,
                    last_received: ts.seqno,
                    quiescent: false,
                },
            );
        }
        Ok(stream)
    }
}

#[async_trait]
impl Part for DcpNozzle {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> PartState {
        *self.state.read()
    }

    fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    async fn start(&self, _config: Arc<PipelineConfig>) -> Result<()> {
        if *self.state.read() == PartState::Running {
            return Err(Error::pipeline(format!("{} already running", self.id)));
        }
        let starts = self
            .starts
            .lock()
            .take()
            .ok_or_else(|| Error::pipeline(format!("{}: start timestamps not installed", self.id)))?;
        let connector = self
            .connector
            .read()
            .clone()
            .ok_or_else(|| Error::pipeline(format!("{}: no connector attached", self.id)))?;

        let stream = self.open_streams(&starts).await?;
        tracing::info!(
            part = %self.id,
            server = %self.server,
            vbuckets = self.vbnos.len(),
            "dcp streams open"
        );

        let (finish_tx, finish_rx) = oneshot::channel();
        *self.finish_tx.lock() = Some(finish_tx);

        let reader = StreamReader {
            id: self.id.clone(),
            stream,
            connector,
            rollback: self.rollback.read().clone(),
            publisher: Arc::clone(&self.publisher),
            state: Arc::clone(&self.state),
            vb_state: Arc::clone(&self.vb_state),
            finish_rx,
        };
        *self.task.lock() = Some(tokio::spawn(reader.run()));
        *self.state.write() = PartState::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
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
        tracing::info!(part = %self.id, "dcp nozzle stopped");
        Ok(())
    }
}

struct StreamReader {
    id: String,
    stream: Box<dyn DcpStream>,
    connector: Arc<dyn Connector>,
    rollback: Option<Arc<dyn RollbackHandler>>,
    publisher: Arc<EventPublisher>,
    state: Arc<RwLock<PartState>>,
    vb_state: Arc<RwLock<HashMap<u16, VbStreamState>>>,
    finish_rx: oneshot::Receiver<()>,
}

impl StreamReader {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = &mut self.finish_rx => break,
                message = self.stream.next_message() => match message {
                    Ok(Some(message)) => {
                        if let Err(err) = self.handle(message).await {
                            self.fail(err);
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!(part = %self.id, "dcp producer closed the connection");
                        break;
                    }
                    Err(err) => {
                        self.fail(err);
                        break;
                    }
                }
            }
        }
        self.stream.close().await;
    }

    async fn handle(&mut self, message: DcpMessage) -> Result<()> {
        match message {
            DcpMessage::SnapshotMarker { vbno, start, end } => {
                let mut vb_state = self.vb_state.write();
                let entry = vb_state.entry(vbno).or_default();
                entry.snapshot_start = start;
                entry.snapshot_end = end;
                Ok(())
            }
            DcpMessage::Mutation(mutation) => {
                {
                    let mut vb_state = self.vb_state.write();
                    let entry = vb_state.entry(mutation.vbno).or_default();
                    entry.last_received = mutation.seqno;
                }
                self.publisher.raise(
                    EventKind::DataReceived,
                    Some(Arc::clone(&mutation)),
                    EventAux {
                        seqno: mutation.seqno,
                        vbno: mutation.vbno,
                        size: mutation.size(),
                        at: Some(Instant::now()),
                        ..Default::default()
                    },
                );
                // routing happens on this task to keep per-vBucket order
                self.connector.forward(mutation).await
            }
            DcpMessage::StreamEnd { vbno, reason } => self.handle_stream_end(vbno, reason).await,
        }
    }

    async fn handle_stream_end(&mut self, vbno: u16, reason: StreamEndReason) -> Result<()> {
        match reason {
            StreamEndReason::Ok => {
                tracing::info!(part = %self.id, vbno, "vbucket stream quiescent");
                if let Some(entry) = self.vb_state.write().get_mut(&vbno) {
                    entry.quiescent = true;
                }
                Ok(())
            }
            StreamEndReason::Rollback(seqno) => {
                let handler = self.rollback.as_ref().ok_or_else(|| {
                    Error::pipeline(format!("{}: rollback with no handler attached", self.id))
                })?;
                let ts = handler.rollback_point(vbno, seqno).await?;
                tracing::warn!(
                    part = %self.id,
                    vbno,
                    rollback_seqno = seqno,
                    restart_seqno = ts.seqno,
                    "restarting stream after rollback"
                );
                self.restart_stream(ts).await
            }
            StreamEndReason::StateChanged => {
                // vBucket moved or changed state; restart from where we are
                let ts = self.current_position(vbno);
                tracing::info!(part = %self.id, vbno, "stream state changed, re-requesting");
                self.restart_stream(ts).await
            }
            StreamEndReason::Disconnected => Err(Error::fatal(format!(
                "{}: producer disconnected stream for vb {}",
                self.id, vbno
            ))),
        }
    }

    fn current_position(&self, vbno: u16) -> VBTimestamp {
        let vb_state = self.vb_state.read();
        let state = vb_state.get(&vbno).copied().unwrap_or_default();
        VBTimestamp {
            vbno,
            vb_uuid: state.vb_uuid,
            seqno: state.last_received,
            snapshot_start: state.snapshot_start,
            snapshot_end: state.snapshot_end,
        }
    }

    async fn restart_stream(&mut self, ts: VBTimestamp) -> Result<()> {
        self.stream
            .stream_request(
                ts.vbno,
                ts.vb_uuid,
                ts.seqno,
                STREAM_END_SEQNO,
                ts.snapshot_start,
                ts.snapshot_end,
            )
            .await?;
        let mut vb_state = self.vb_state.write();
        vb_state.insert(
            ts.vbno,
            VbStreamState {
                vb_uuid: ts.vb_uuid,
                snapshot_start: ts.snapshot_start,
                snapshot_end: ts.snapshot_end,
                last_received: ts.seqno,
                quiescent: false,
            },
        );
        Ok(())
    }

    fn fail(&self, err: Error) {
        tracing::error!(part = %self.id, error = %err, "dcp nozzle failed");
        self.publisher.raise_error(&err);
        *self.state.write() = PartState::Failed;
    }
}
