//! Memcached transport interfaces
//!
//! The framing library and socket management are external; the engine talks
//! to a connection in terms of composed requests and decoded responses. One
//! trait covers the plain request/response connection the target nozzle and
//! statistics manager use, the other the DCP consumer the source nozzle
//! drains.

use crate::protocol::{DcpMessage, HeloFeatures, McRequest, McResponse};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// A memcached connection to one kv server for one bucket
#[async_trait]
pub trait McConnection: Send {
    /// Negotiate features; the returned set governs the wire format of
    /// subsequent writes
    async fn helo(&mut self, user_agent: &str, requested: HeloFeatures) -> Result<HeloFeatures>;

    /// Queue a request for transmission
    async fn write(&mut self, request: &McRequest) -> Result<()>;

    /// Flush queued requests to the socket
    async fn flush(&mut self) -> Result<()>;

    /// Receive the next response
    async fn receive(&mut self) -> Result<McResponse>;

    /// Run a `stats` query and return the raw key/value map
    async fn stats(&mut self, group: &str) -> Result<HashMap<String, String>>;

    /// Close the connection
    async fn close(&mut self);
}

/// Opens memcached connections
#[async_trait]
pub trait McConnectionFactory: Send + Sync {
    /// Connect to a kv server for a bucket
    async fn connect(&self, server: &str, bucket: &str) -> Result<Box<dyn McConnection>>;
}

/// An open DCP consumer connection for a set of vBuckets
#[async_trait]
pub trait DcpStream: Send {
    /// Request a stream for one vBucket from the given position
    ///
    /// A rollback demand surfaces as `Error::Rollback` carrying the seqno the
    /// producer will accept.
    async fn stream_request(
        &mut self,
        vbno: u16,
        vb_uuid: u64,
        start_seqno: u64,
        end_seqno: u64,
        snapshot_start: u64,
        snapshot_end: u64,
    ) -> Result<()>;

    /// Next message on the connection; `None` when the producer closed it
    async fn next_message(&mut self) -> Result<Option<DcpMessage>>;

    /// Failover log for a vBucket: `(vb_uuid, seqno)` rollover points,
    /// newest first
    async fn failover_log(&mut self, vbno: u16) -> Result<Vec<(u64, u64)>>;

    /// Close the connection
    async fn close(&mut self);
}

/// Opens DCP consumer connections
#[async_trait]
pub trait DcpStreamFactory: Send + Sync {
    /// Open a DCP connection to a source kv server for a bucket
    async fn open(&self, server: &str, bucket: &str) -> Result<Box<dyn DcpStream>>;
}
