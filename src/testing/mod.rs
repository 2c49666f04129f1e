//! Mock services for integration tests
//!
//! Scripted stand-ins for the external collaborators: a DCP source fed from
//! the test, a recording memcached connection with scriptable response
//! statuses, a static topology provider, an accept-all checkpoint handshake
//! and simple filter matchers. Used by the crate's `tests/` directory and
//! usable by embedders for their own harnesses.

use crate::protocol::{DcpMessage, HeloFeatures, McRequest, McResponse, Status};
use crate::service::{
    CheckpointHandshake, ClusterInfoProvider, DcpStream, DcpStreamFactory, FilterFactory,
    FilterMatcher, MassValidationResult, McConnection, McConnectionFactory,
    RemoteVBReplicationStatus,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Script surface of one mocked DCP server
pub struct DcpScript {
    tx: Mutex<Option<mpsc::UnboundedSender<DcpMessage>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DcpMessage>>>,
    failover: Mutex<HashMap<u16, Vec<(u64, u64)>>>,
    /// `(vbno, vb_uuid, start_seqno)` of every stream request issued
    pub stream_requests: Mutex<Vec<(u16, u64, u64)>>,
    /// vBuckets that demand a rollback when streamed above the given seqno
    rollbacks: Mutex<HashMap<u16, u64>>,
}

impl DcpScript {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        DcpScript {
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            failover: Mutex::new(HashMap::new()),
            stream_requests: Mutex::new(Vec::new()),
            rollbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one message to the consumer
    pub fn push(&self, message: DcpMessage) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Close the stream; the consumer sees end-of-stream after the queue drains
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Install a failover log for a vBucket
    pub fn set_failover_log(&self, vbno: u16, log: Vec<(u64, u64)>) {
        self.failover.lock().insert(vbno, log);
    }

    /// Demand a rollback to `seqno` for stream requests above it
    pub fn demand_rollback(&self, vbno: u16, seqno: u64) {
        self.rollbacks.lock().insert(vbno, seqno);
    }
}

/// DCP factory handing out streams driven by per-server scripts
#[derive(Default)]
pub struct ScriptedDcpFactory {
    scripts: Mutex<HashMap<String, Arc<DcpScript>>>,
}

impl ScriptedDcpFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Script surface for a server, created on first use
    pub fn script_for(&self, server: &str) -> Arc<DcpScript> {
        Arc::clone(
            self.scripts
                .lock()
                .entry(server.to_string())
                .or_insert_with(|| Arc::new(DcpScript::new())),
        )
    }
}

#[async_trait]
impl DcpStreamFactory for ScriptedDcpFactory {
    async fn open(&self, server: &str, _bucket: &str) -> Result<Box<dyn DcpStream>> {
        Ok(Box::new(ScriptedDcpStream {
            script: self.script_for(server),
        }))
    }
}

struct ScriptedDcpStream {
    script: Arc<DcpScript>,
}

#[async_trait]
impl DcpStream for ScriptedDcpStream {
    async fn stream_request(
        &mut self,
        vbno: u16,
        vb_uuid: u64,
        start_seqno: u64,
        _end_seqno: u64,
        _snapshot_start: u64,
        _snapshot_end: u64,
    ) -> Result<()> {
        let rollback = self.script.rollbacks.lock().get(&vbno).copied();
        if let Some(seqno) = rollback {
            if start_seqno > seqno {
                self.script.rollbacks.lock().remove(&vbno);
                return Err(Error::Rollback { vbno, seqno });
            }
        }
        self.script
            .stream_requests
            .lock()
            .push((vbno, vb_uuid, start_seqno));
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<DcpMessage>> {
        Ok(self.script.rx.lock().await.recv().await)
    }

    async fn failover_log(&mut self, vbno: u16) -> Result<Vec<(u64, u64)>> {
        Ok(self
            .script
            .failover
            .lock()
            .get(&vbno)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&mut self) {}
}

/// Script surface of one mocked target memcached server
pub struct McScript {
    /// Every request written to this server, in order
    pub requests: Mutex<Vec<McRequest>>,
    pending: Mutex<VecDeque<McRequest>>,
    scripted: Mutex<VecDeque<Status>>,
    /// Features the server grants out of those requested
    pub grants: Mutex<HeloFeatures>,
    stats: Mutex<HashMap<String, HashMap<String, String>>>,
    /// Connections opened to this server
    pub connects: AtomicUsize,
}

impl McScript {
    fn new() -> Self {
        McScript {
            requests: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            scripted: Mutex::new(VecDeque::new()),
            grants: Mutex::new(HeloFeatures {
                xattr: true,
                snappy: true,
            }),
            stats: Mutex::new(HashMap::new()),
            connects: AtomicUsize::new(0),
        }
    }

    /// Script the status of the next responses (default is Success)
    pub fn push_status(&self, status: Status) {
        self.scripted.lock().push_back(status);
    }

    /// Install a stats map for a stats group
    pub fn set_stats(&self, group: &str, map: HashMap<String, String>) {
        self.stats.lock().insert(group.to_string(), map);
    }

    /// Convenience: install `vb_N:high_seqno` entries
    pub fn set_high_seqnos(&self, entries: &[(u16, u64)]) {
        let map = entries
            .iter()
            .map(|(vbno, seqno)| (format!("vb_{}:high_seqno", vbno), seqno.to_string()))
            .collect();
        self.set_stats(crate::stats::VBUCKET_SEQNO_STAT_NAME, map);
    }

    /// Requests written so far that carry a body (meta-preserving writes)
    pub fn write_requests(&self) -> Vec<McRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|req| {
                req.opcode == crate::protocol::Opcode::SetWithMeta as u8
                    || req.opcode == crate::protocol::Opcode::DelWithMeta as u8
            })
            .cloned()
            .collect()
    }
}

/// Memcached factory handing out recording connections
#[derive(Default)]
pub struct MockMcFactory {
    servers: Mutex<HashMap<String, Arc<McScript>>>,
}

impl MockMcFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Script surface for a server, created on first use
    pub fn script_for(&self, server: &str) -> Arc<McScript> {
        Arc::clone(
            self.servers
                .lock()
                .entry(server.to_string())
                .or_insert_with(|| Arc::new(McScript::new())),
        )
    }
}

#[async_trait]
impl McConnectionFactory for MockMcFactory {
    async fn connect(&self, server: &str, _bucket: &str) -> Result<Box<dyn McConnection>> {
        let script = self.script_for(server);
        script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockMcConnection { script }))
    }
}

struct MockMcConnection {
    script: Arc<McScript>,
}

#[async_trait]
impl McConnection for MockMcConnection {
    async fn helo(&mut self, _user_agent: &str, requested: HeloFeatures) -> Result<HeloFeatures> {
        let grants = *self.script.grants.lock();
        Ok(HeloFeatures {
            xattr: requested.xattr && grants.xattr,
            snappy: requested.snappy && grants.snappy,
        })
    }

    async fn write(&mut self, request: &McRequest) -> Result<()> {
        self.script.requests.lock().push(request.clone());
        self.script.pending.lock().push_back(request.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn receive(&mut self) -> Result<McResponse> {
        let request = self
            .script
            .pending
            .lock()
            .pop_front()
            .ok_or_else(|| Error::protocol("receive with no pending request"))?;
        let status = self
            .script
            .scripted
            .lock()
            .pop_front()
            .unwrap_or(Status::Success);
        Ok(McResponse {
            opcode: request.opcode,
            status,
            opaque: request.opaque,
            cas: 1,
            body: Vec::new(),
        })
    }

    async fn stats(&mut self, group: &str) -> Result<HashMap<String, String>> {
        Ok(self.script.stats.lock().get(group).cloned().unwrap_or_default())
    }

    async fn close(&mut self) {}
}

/// Static (but swappable) topology provider
pub struct StaticClusterInfo {
    map: RwLock<HashMap<String, Vec<u16>>>,
}

impl StaticClusterInfo {
    /// Provider over a fixed server → vBuckets map
    pub fn new(map: HashMap<String, Vec<u16>>) -> Self {
        StaticClusterInfo {
            map: RwLock::new(map),
        }
    }

    /// Single-server topology owning the given vBuckets
    pub fn single(server: &str, vbnos: Vec<u16>) -> Self {
        let mut map = HashMap::new();
        map.insert(server.to_string(), vbnos);
        Self::new(map)
    }

    /// Replace the topology (simulates rebalance)
    pub fn set_map(&self, map: HashMap<String, Vec<u16>>) {
        *self.map.write() = map;
    }
}

#[async_trait]
impl ClusterInfoProvider for StaticClusterInfo {
    async fn server_list(&self, _bucket: &str) -> Result<Vec<String>> {
        let mut servers: Vec<String> = self.map.read().keys().cloned().collect();
        servers.sort();
        Ok(servers)
    }

    async fn server_vbucket_map(&self, _bucket: &str) -> Result<HashMap<String, Vec<u16>>> {
        Ok(self.map.read().clone())
    }
}

/// Handshake that accepts every known position
#[derive(Default)]
pub struct AcceptAllHandshake {
    /// `(target_seqno, current_vb_uuid)` returned by commit calls
    pub commit_response: Mutex<(u64, u64)>,
}

#[async_trait]
impl CheckpointHandshake for AcceptAllHandshake {
    async fn pre_replicate(&self, known: &RemoteVBReplicationStatus) -> Result<(bool, u64)> {
        Ok((true, known.vb_uuid))
    }

    async fn commit_for_checkpoint(&self, _vbno: u16, vb_uuid: u64) -> Result<(u64, u64)> {
        let (seqno, uuid) = *self.commit_response.lock();
        Ok((seqno, if uuid != 0 { uuid } else { vb_uuid }))
    }

    async fn mass_validate(
        &self,
        entries: &[RemoteVBReplicationStatus],
    ) -> Result<MassValidationResult> {
        Ok(MassValidationResult {
            matching: entries.iter().map(|e| e.vbno).collect(),
            mismatching: Vec::new(),
            missing: Vec::new(),
        })
    }
}

/// Filter matching documents whose key equals a fixed value
pub struct KeyEqualsFilter {
    needle: Vec<u8>,
}

impl KeyEqualsFilter {
    /// Filter passing only documents with this exact key
    pub fn new(key: &str) -> Self {
        let mut needle = Vec::new();
        needle.push(b'"');
        needle.extend_from_slice(crate::parts::router::RESERVED_KEY_FIELD);
        needle.extend_from_slice(b"\":\"");
        needle.extend_from_slice(key.as_bytes());
        needle.push(b'"');
        KeyEqualsFilter { needle }
    }
}

impl FilterMatcher for KeyEqualsFilter {
    fn matches(&self, body: &[u8]) -> Result<bool> {
        Ok(body.windows(self.needle.len()).any(|w| w == &self.needle[..]))
    }

    fn references_doc_key(&self) -> bool {
        true
    }

    fn references_xattrs(&self) -> bool {
        false
    }

    fn references_body(&self) -> bool {
        false
    }
}

/// Filter matching documents carrying a given xattr key/value pair
pub struct XattrEqualsFilter {
    needle: Vec<u8>,
}

impl XattrEqualsFilter {
    /// Filter passing documents whose xattr `key` equals the JSON `value`
    pub fn new(key: &str, value_json: &str) -> Self {
        let mut needle = Vec::new();
        needle.push(b'"');
        needle.extend_from_slice(key.as_bytes());
        needle.extend_from_slice(b"\":");
        needle.extend_from_slice(value_json.as_bytes());
        XattrEqualsFilter { needle }
    }
}

impl FilterMatcher for XattrEqualsFilter {
    fn matches(&self, body: &[u8]) -> Result<bool> {
        Ok(body.windows(self.needle.len()).any(|w| w == &self.needle[..]))
    }

    fn references_doc_key(&self) -> bool {
        false
    }

    fn references_xattrs(&self) -> bool {
        true
    }

    fn references_body(&self) -> bool {
        true
    }
}

/// Factory returning a pre-built matcher for any expression
pub struct FixedFilterFactory {
    matcher: Arc<dyn FilterMatcher>,
}

impl FixedFilterFactory {
    /// Factory always compiling to the given matcher
    pub fn new(matcher: Arc<dyn FilterMatcher>) -> Self {
        FixedFilterFactory { matcher }
    }
}

impl FilterFactory for FixedFilterFactory {
    fn compile(&self, _expression: &str) -> Result<Arc<dyn FilterMatcher>> {
        Ok(Arc::clone(&self.matcher))
    }
}
