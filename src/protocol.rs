//! Memcached binary protocol and DCP surface
//!
//! The transport (framing, socket management, auth) is owned by the external
//! memcached client; this module defines what the engine itself composes and
//! interprets: opcodes and status codes, datatype bits, the HELO feature
//! handshake body, `*_WITH_META` request composition, DCP stream messages and
//! the xattr section layout inside a document value.

use crate::{Error, Result};
use std::sync::Arc;

/// Request magic byte
pub const REQ_MAGIC: u8 = 0x80;
/// Response magic byte
pub const RES_MAGIC: u8 = 0x81;

/// Datatype bit: body is JSON
pub const DATATYPE_JSON: u8 = 0x01;
/// Datatype bit: body is Snappy-compressed
pub const DATATYPE_SNAPPY: u8 = 0x02;
/// Datatype bit: body carries an xattr section
pub const DATATYPE_XATTR: u8 = 0x04;

/// HELO feature code: TCP_NO_DELAY
pub const HELO_FEATURE_TCP_NO_DELAY: u16 = 0x0003;
/// HELO feature code: extended attributes
pub const HELO_FEATURE_XATTR: u16 = 0x0006;
/// HELO feature code: Snappy compression
pub const HELO_FEATURE_SNAPPY: u16 = 0x000a;
/// Bytes per feature code in a HELO body
pub const HELO_BYTES_PER_FEATURE: usize = 2;

/// Maximum document size; an xattr section claiming more than this is malformed
pub const MAX_DOC_SIZE_BYTES: u32 = 20 * 1024 * 1024;

/// Opcodes the engine composes or interprets
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Stats query
    Stat = 0x10,
    /// HELO feature negotiation
    Hello = 0x1f,
    /// DCP connection open
    DcpOpen = 0x50,
    /// DCP stream request
    DcpStreamReq = 0x53,
    /// DCP stream end
    DcpStreamEnd = 0x55,
    /// DCP snapshot marker
    DcpSnapshotMarker = 0x56,
    /// DCP mutation
    DcpMutation = 0x57,
    /// DCP deletion
    DcpDeletion = 0x58,
    /// DCP expiration
    DcpExpiration = 0x59,
    /// Meta-preserving set
    SetWithMeta = 0xa2,
    /// Meta-preserving delete
    DelWithMeta = 0xa8,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x10 => Ok(Self::Stat),
            0x1f => Ok(Self::Hello),
            0x50 => Ok(Self::DcpOpen),
            0x53 => Ok(Self::DcpStreamReq),
            0x55 => Ok(Self::DcpStreamEnd),
            0x56 => Ok(Self::DcpSnapshotMarker),
            0x57 => Ok(Self::DcpMutation),
            0x58 => Ok(Self::DcpDeletion),
            0x59 => Ok(Self::DcpExpiration),
            0xa2 => Ok(Self::SetWithMeta),
            0xa8 => Ok(Self::DelWithMeta),
            _ => Err(Error::protocol(format!("unknown opcode: {:#04x}", value))),
        }
    }
}

/// Memcached response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation succeeded
    Success,
    /// Key not found
    KeyNotFound,
    /// Key exists (conflict resolution lost)
    KeyExists,
    /// Value too large
    TooBig,
    /// Invalid arguments
    InvalidArgs,
    /// Item not stored
    NotStored,
    /// vBucket is not owned by this server
    NotMyVbucket,
    /// Stream must roll back
    Rollback,
    /// Access denied
    AccessDenied,
    /// Authentication failure
    AuthError,
    /// Unknown command
    UnknownCommand,
    /// Server out of memory
    NoMem,
    /// Operation not supported
    NotSupported,
    /// Internal server error
    InternalError,
    /// Server busy
    Busy,
    /// Temporary failure
    TempFailure,
    /// Any status not otherwise modeled
    Other(u16),
}

impl Status {
    /// Decode from the wire status field
    pub fn from_raw(raw: u16) -> Status {
        match raw {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::TooBig,
            0x04 => Status::InvalidArgs,
            0x05 => Status::NotStored,
            0x07 => Status::NotMyVbucket,
            0x23 => Status::Rollback,
            0x24 => Status::AccessDenied,
            0x20 => Status::AuthError,
            0x81 => Status::UnknownCommand,
            0x82 => Status::NoMem,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::Busy,
            0x86 => Status::TempFailure,
            other => Status::Other(other),
        }
    }

    /// Wire value of this status
    pub fn raw(&self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::TooBig => 0x03,
            Status::InvalidArgs => 0x04,
            Status::NotStored => 0x05,
            Status::NotMyVbucket => 0x07,
            Status::Rollback => 0x23,
            Status::AccessDenied => 0x24,
            Status::AuthError => 0x20,
            Status::UnknownCommand => 0x81,
            Status::NoMem => 0x82,
            Status::NotSupported => 0x83,
            Status::InternalError => 0x84,
            Status::Busy => 0x85,
            Status::TempFailure => 0x86,
            Status::Other(other) => *other,
        }
    }

    /// How a target response of this status is handled by the write path
    pub fn disposition(&self) -> Disposition {
        match self {
            Status::Success => Disposition::Success,
            // the source copy lost conflict resolution; counts as delivered
            Status::KeyExists => Disposition::ConflictLoss,
            Status::TempFailure | Status::NoMem | Status::Busy => Disposition::Retry,
            Status::NotMyVbucket => Disposition::TopologyChanged,
            Status::AccessDenied | Status::AuthError => Disposition::Unauthorized,
            _ => Disposition::Fatal,
        }
    }
}

/// Write-path handling class for a target response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge and advance
    Success,
    /// Treated as success: target kept its own copy
    ConflictLoss,
    /// Retry in place with backoff
    Retry,
    /// Refresh topology and re-route
    TopologyChanged,
    /// Propagate to the supervisor
    Unauthorized,
    /// Propagate to the supervisor
    Fatal,
}

/// A memcached binary request as handed to the transport
#[derive(Debug, Clone, Default)]
pub struct McRequest {
    /// Operation opcode (raw so the transport stays oblivious)
    pub opcode: u8,
    /// Datatype bits
    pub datatype: u8,
    /// Target vBucket
    pub vbucket: u16,
    /// Caller correlation token, echoed in the response
    pub opaque: u32,
    /// Compare-and-swap token
    pub cas: u64,
    /// Extras section
    pub extras: Vec<u8>,
    /// Document key
    pub key: Vec<u8>,
    /// Document body
    pub body: Vec<u8>,
}

impl McRequest {
    /// Total wire size: 24-byte header plus extras, key and body
    pub fn size(&self) -> usize {
        24 + self.extras.len() + self.key.len() + self.body.len()
    }
}

/// A memcached binary response as handed back by the transport
#[derive(Debug, Clone)]
pub struct McResponse {
    /// Operation opcode
    pub opcode: u8,
    /// Response status
    pub status: Status,
    /// Correlation token from the request
    pub opaque: u32,
    /// CAS assigned by the server
    pub cas: u64,
    /// Response body
    pub body: Vec<u8>,
}

/// Feature set negotiated through HELO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeloFeatures {
    /// Extended attributes enabled
    pub xattr: bool,
    /// Snappy-compressed values enabled
    pub snappy: bool,
}

impl HeloFeatures {
    /// Number of optional features requested beyond TCP_NO_DELAY
    pub fn activated(&self) -> usize {
        usize::from(self.xattr) + usize::from(self.snappy)
    }
}

/// Compose a HELO request advertising TCP_NO_DELAY plus the requested features
///
/// The body is a sequence of 2-byte big-endian feature codes; the key is the
/// connecting agent's name.
pub fn compose_helo(user_agent: &str, features: HeloFeatures) -> McRequest {
    let mut body = Vec::with_capacity(HELO_BYTES_PER_FEATURE * (features.activated() + 1));
    body.extend_from_slice(&HELO_FEATURE_TCP_NO_DELAY.to_be_bytes());
    if features.xattr {
        body.extend_from_slice(&HELO_FEATURE_XATTR.to_be_bytes());
    }
    if features.snappy {
        body.extend_from_slice(&HELO_FEATURE_SNAPPY.to_be_bytes());
    }

    McRequest {
        opcode: Opcode::Hello as u8,
        key: user_agent.as_bytes().to_vec(),
        body,
        ..Default::default()
    }
}

/// Parse the feature list out of a HELO response body
///
/// The body must hold an even number of bytes; features the engine does not
/// know are ignored.
pub fn parse_helo_features(body: &[u8]) -> Result<HeloFeatures> {
    if body.len() % 2 != 0 {
        return Err(Error::protocol(
            "HELO response body has an odd number of bytes",
        ));
    }
    let mut features = HeloFeatures::default();
    for chunk in body.chunks_exact(2) {
        match u16::from_be_bytes([chunk[0], chunk[1]]) {
            HELO_FEATURE_XATTR => features.xattr = true,
            HELO_FEATURE_SNAPPY => features.snappy = true,
            _ => {}
        }
    }
    Ok(features)
}

/// Kind of a document change on a DCP stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Document set or replace
    Mutation,
    /// Explicit delete
    Deletion,
    /// TTL expiry
    Expiration,
}

/// A document change flowing through the pipeline
///
/// Shared by reference (`Arc`) between parts and event listeners; the value
/// bytes are never copied on the event path.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// Change kind
    pub kind: MutationKind,
    /// Source vBucket
    pub vbno: u16,
    /// Sequence number within the vBucket
    pub seqno: u64,
    /// Revision sequence number
    pub rev_seqno: u64,
    /// Source CAS
    pub cas: u64,
    /// Document flags
    pub flags: u32,
    /// Expiry timestamp
    pub expiry: u32,
    /// Datatype bitset (JSON / SNAPPY / XATTR)
    pub datatype: u8,
    /// Document key
    pub key: Vec<u8>,
    /// Document value (possibly compressed, possibly xattr-prefixed)
    pub value: Vec<u8>,
}

impl MutationEvent {
    /// Whether the value is flagged as JSON
    pub fn is_json(&self) -> bool {
        self.datatype & DATATYPE_JSON != 0
    }

    /// Whether the value is Snappy-compressed
    pub fn is_snappy(&self) -> bool {
        self.datatype & DATATYPE_SNAPPY != 0
    }

    /// Whether the value carries an xattr section
    pub fn has_xattr(&self) -> bool {
        self.datatype & DATATYPE_XATTR != 0
    }

    /// Approximate replicated size: header plus key plus value
    pub fn size(&self) -> usize {
        24 + self.key.len() + self.value.len()
    }
}

/// Why a DCP stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// Stream is quiescent; not an error
    Ok,
    /// vBucket state changed; retry after a topology refresh
    StateChanged,
    /// Producer disconnected; fatal for this stream
    Disconnected,
    /// Producer demands rollback to the carried seqno before restreaming
    Rollback(u64),
}

/// A message received on a DCP connection
#[derive(Debug, Clone)]
pub enum DcpMessage {
    /// Snapshot window update for a vBucket
    SnapshotMarker {
        /// vBucket
        vbno: u16,
        /// Snapshot start seqno
        start: u64,
        /// Snapshot end seqno
        end: u64,
    },
    /// Document change (mutation, deletion or expiration)
    Mutation(Arc<MutationEvent>),
    /// Stream terminated for a vBucket
    StreamEnd {
        /// vBucket
        vbno: u16,
        /// Termination reason
        reason: StreamEndReason,
    },
}

/// Extras layout for `SET_WITH_META` / `DEL_WITH_META`:
/// flags(4) expiry(4) rev_seqno(8) cas(8), all big-endian
pub const WITH_META_EXTRAS_LEN: usize = 24;

/// Compose a meta-preserving write for a mutation
///
/// The body honors the negotiated target features: the xattr section is
/// stripped when XATTR was declined, and a compressed body is inflated when
/// SNAPPY was declined (or when stripping required inflation first).
pub fn compose_with_meta(
    event: &MutationEvent,
    features: HeloFeatures,
    opaque: u32,
) -> Result<McRequest> {
    let opcode = match event.kind {
        MutationKind::Mutation => Opcode::SetWithMeta,
        MutationKind::Deletion | MutationKind::Expiration => Opcode::DelWithMeta,
    };

    let mut datatype = event.datatype;
    let mut body = event.value.clone();

    let must_strip_xattr = event.has_xattr() && !features.xattr;
    let must_inflate = event.is_snappy() && (!features.snappy || must_strip_xattr);

    if must_inflate {
        body = inflate(&body)?;
        datatype &= !DATATYPE_SNAPPY;
    }
    if must_strip_xattr {
        let (_, rest) = split_xattr(&body)?;
        body = rest.to_vec();
        datatype &= !DATATYPE_XATTR;
    }

    let mut extras = Vec::with_capacity(WITH_META_EXTRAS_LEN);
    extras.extend_from_slice(&event.flags.to_be_bytes());
    extras.extend_from_slice(&event.expiry.to_be_bytes());
    extras.extend_from_slice(&event.rev_seqno.to_be_bytes());
    extras.extend_from_slice(&event.cas.to_be_bytes());

    Ok(McRequest {
        opcode: opcode as u8,
        datatype,
        vbucket: event.vbno,
        opaque,
        cas: 0,
        extras,
        key: event.key.clone(),
        body,
    })
}

/// Inflate a Snappy-compressed body
pub fn inflate(body: &[u8]) -> Result<Vec<u8>> {
    let len = snap::raw::decompress_len(body)
        .map_err(|e| Error::invalid_input(format!("unable to decode snappy length: {}", e)))?;
    let mut out = vec![0u8; len];
    snap::raw::Decoder::new()
        .decompress(body, &mut out)
        .map_err(|e| Error::invalid_input(format!("unable to inflate snappy body: {}", e)))?;
    Ok(out)
}

/// Compress a body with raw Snappy framing
pub fn deflate(body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; snap::raw::max_compress_len(body.len())];
    let n = snap::raw::Encoder::new()
        .compress(body, &mut out)
        .expect("snappy compression of an in-memory buffer cannot fail");
    out.truncate(n);
    out
}

/// Split an uncompressed value into its xattr section and the document body
///
/// The section starts with a 4-byte big-endian total size (not counting the
/// prefix itself). Returns `(section including prefix, body)`.
pub fn split_xattr(value: &[u8]) -> Result<(&[u8], &[u8])> {
    if value.len() < 4 {
        return Err(Error::invalid_input(
            "value too short to carry an xattr size prefix",
        ));
    }
    let total = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
    if total > MAX_DOC_SIZE_BYTES {
        return Err(Error::invalid_input(format!(
            "xattr section claims {} bytes, above the document size limit",
            total
        )));
    }
    let end = 4 + total as usize;
    if end > value.len() {
        return Err(Error::invalid_input(
            "xattr section size exceeds the value length",
        ));
    }
    Ok((&value[..end], &value[end..]))
}

/// Iterate the `(key, value)` entries of an xattr section (prefix included)
///
/// Each entry is a 4-byte big-endian entry size followed by a NUL-terminated
/// key and a NUL-terminated value.
pub fn xattr_entries(section: &[u8]) -> XattrEntries<'_> {
    XattrEntries {
        section,
        pos: 4.min(section.len()),
    }
}

/// Iterator over xattr section entries
pub struct XattrEntries<'a> {
    section: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for XattrEntries<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.section.len() {
            return None;
        }
        if self.pos + 4 > self.section.len() {
            self.pos = self.section.len();
            return Some(Err(Error::invalid_input(
                "xattr entry truncated before its size field",
            )));
        }
        // skip the entry size field; keys and values are NUL-delimited
        self.pos += 4;

        let key_start = self.pos;
        let key_end = match find_nul(self.section, key_start) {
            Some(end) => end,
            None => {
                self.pos = self.section.len();
                return Some(Err(Error::invalid_input("unterminated xattr key")));
            }
        };
        let value_start = key_end + 1;
        let value_end = match find_nul(self.section, value_start) {
            Some(end) => end,
            None => {
                self.pos = self.section.len();
                return Some(Err(Error::invalid_input("unterminated xattr value")));
            }
        };
        self.pos = value_end + 1;
        Some(Ok((
            &self.section[key_start..key_end],
            &self.section[value_start..value_end],
        )))
    }
}

fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|b| *b == 0).map(|i| from + i)
}

/// Build an xattr section from `(key, value)` entries, prefix included
pub fn build_xattr_section(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut section = vec![0u8; 4];
    for (key, value) in entries {
        let entry_len = (key.len() + value.len() + 2) as u32;
        section.extend_from_slice(&entry_len.to_be_bytes());
        section.extend_from_slice(key);
        section.push(0);
        section.extend_from_slice(value);
        section.push(0);
    }
    let total = (section.len() - 4) as u32;
    section[..4].copy_from_slice(&total.to_be_bytes());
    section
}
