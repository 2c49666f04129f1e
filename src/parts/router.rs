//! Router/filter connector
//!
//! Runs inline on the DCP reader task: for every mutation it decides which
//! target nozzle owns the vBucket, applies the filter expression, and either
//! forwards or drops. Filtering may have to inflate a Snappy body, re-frame
//! an xattr section into a synthetic JSON object and inject the document key
//! as a reserved field; all scratch buffers come from the byte pool and are
//! released on every exit path.
//!
//! A malformed body fails only its own mutation: the mutation is dropped,
//! the failure counted, and the pipeline keeps running.

use crate::parts::xmem::XmemNozzle;
use crate::pipeline::part::{Connector, EventAux, EventKind, EventPublisher};
use crate::pool::{BytePool, PooledBuf};
use crate::protocol::{split_xattr, xattr_entries, MutationEvent};
use crate::service::FilterMatcher;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Reserved top-level field carrying the document key for key-aware filters
pub const RESERVED_KEY_FIELD: &[u8] = b"[$%ReservedDocKey%$]";

/// Reserved top-level field carrying re-framed xattrs for xattr-aware filters
pub const RESERVED_XATTR_FIELD: &[u8] = b"[$%ReservedXattrs%$]";

/// Scratch headroom reserved beyond the body for injected fields
const FILTER_EXTRA_BYTES: usize = 64;

/// Which document facets the filter expression references
#[derive(Debug, Clone, Copy)]
struct FilterRefs {
    key: bool,
    xattrs: bool,
    body: bool,
}

impl FilterRefs {
    fn of(matcher: &dyn FilterMatcher) -> Self {
        FilterRefs {
            key: matcher.references_doc_key(),
            xattrs: matcher.references_xattrs(),
            body: matcher.references_body(),
        }
    }

    fn key_only(&self) -> bool {
        self.key && !self.body && !self.xattrs
    }
}

/// Filter verdict for one mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    Drop,
}

/// Routes mutations from one DCP nozzle to the target nozzles
pub struct Router {
    id: String,
    targets: HashMap<u16, Arc<XmemNozzle>>,
    filter: Option<Arc<dyn FilterMatcher>>,
    pool: Arc<BytePool>,
    publisher: EventPublisher,
}

impl Router {
    /// Router over a vBucket → target-nozzle map
    pub fn new(
        id: impl Into<String>,
        targets: HashMap<u16, Arc<XmemNozzle>>,
        filter: Option<Arc<dyn FilterMatcher>>,
        pool: Arc<BytePool>,
    ) -> Self {
        let id = id.into();
        Router {
            publisher: EventPublisher::new(id.clone()),
            id,
            targets,
            filter,
            pool,
        }
    }

    /// Evaluate the filter against a mutation
    fn apply_filter(&self, mutation: &MutationEvent, matcher: &dyn FilterMatcher) -> Result<Verdict> {
        let refs = FilterRefs::of(matcher);

        let need_body = !refs.key_only() && (mutation.has_xattr() || mutation.is_json());
        let mut body: Option<PooledBuf> = None;

        if need_body {
            let inflated = self.body_for_filtering(mutation)?;
            body = Some(if mutation.has_xattr() {
                self.process_xattr(&inflated, !refs.xattrs)?
            } else {
                inflated
            });
        }

        if refs.key {
            body = Some(match body {
                None => self.key_only_body(&mutation.key),
                Some(buf) => inject_key(buf, &mutation.key)?,
            });
        }

        match body {
            // non-JSON value and the filter touches neither body nor key:
            // nothing to evaluate, let it through
            None => Ok(Verdict::Pass),
            Some(buf) => {
                if matcher.matches(&buf)? {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Drop)
                }
            }
        }
    }

    /// Uncompressed value in a pooled buffer, JSON shape pre-checked
    fn body_for_filtering(&self, mutation: &MutationEvent) -> Result<PooledBuf> {
        let mut buf;
        if mutation.is_snappy() {
            let len = snap::raw::decompress_len(&mutation.value).map_err(|e| {
                Error::invalid_input(format!("unable to decode snappy length: {}", e))
            })?;
            buf = self.pool.acquire(len + mutation.key.len() + FILTER_EXTRA_BYTES);
            buf.resize(len, 0);
            snap::raw::Decoder::new()
                .decompress(&mutation.value, &mut buf)
                .map_err(|e| Error::invalid_input(format!("unable to inflate body: {}", e)))?;
        } else {
            buf = self
                .pool
                .acquire(mutation.value.len() + mutation.key.len() + FILTER_EXTRA_BYTES);
            buf.extend_from_slice(&mutation.value);
        }

        // an xattr-bearing value gets its JSON check after the section is
        // split off; a bare value must already end in a brace
        if !mutation.has_xattr() && buf.last() != Some(&b'}') {
            return Err(Error::invalid_input("document body is not JSON"));
        }
        Ok(buf)
    }

    /// Split the xattr section off, either discarding it or re-framing it as
    /// a synthetic object under the reserved field
    fn process_xattr(&self, value: &[u8], strip: bool) -> Result<PooledBuf> {
        let (section, rest) = split_xattr(value)?;
        if !rest.is_empty() && rest.last() != Some(&b'}') {
            return Err(Error::invalid_input("document body after xattrs is not JSON"));
        }

        if strip {
            let mut buf = self.pool.acquire(rest.len().max(2) + FILTER_EXTRA_BYTES);
            if rest.is_empty() {
                buf.extend_from_slice(b"{}");
            } else {
                buf.extend_from_slice(rest);
            }
            return Ok(buf);
        }

        if !rest.is_empty() && rest[0] != b'{' {
            return Err(Error::invalid_input("document body after xattrs is not an object"));
        }

        let mut buf = self.pool.acquire(value.len() + RESERVED_XATTR_FIELD.len() + FILTER_EXTRA_BYTES);
        buf.push(b'{');
        push_quoted(&mut buf, RESERVED_XATTR_FIELD);
        buf.push(b':');
        buf.push(b'{');
        let mut first = true;
        for entry in xattr_entries(section) {
            let (key, value) = entry?;
            if !first {
                buf.push(b',');
            }
            first = false;
            push_quoted(&mut buf, key);
            buf.push(b':');
            buf.extend_from_slice(value);
        }
        buf.push(b'}');
        if rest.len() > 1 {
            buf.push(b',');
            buf.extend_from_slice(&rest[1..]);
        } else {
            buf.push(b'}');
        }
        Ok(buf)
    }

    /// Body for a key-only filter: the key as the sole reserved field
    fn key_only_body(&self, key: &[u8]) -> PooledBuf {
        let mut buf = self
            .pool
            .acquire(key.len() + RESERVED_KEY_FIELD.len() + FILTER_EXTRA_BYTES);
        buf.push(b'{');
        push_quoted(&mut buf, RESERVED_KEY_FIELD);
        buf.push(b':');
        push_quoted(&mut buf, key);
        buf.push(b'}');
        buf
    }
}

/// Append the reserved key field to an existing JSON body
fn inject_key(mut buf: PooledBuf, key: &[u8]) -> Result<PooledBuf> {
    if buf.last() != Some(&b'}') {
        return Err(Error::invalid_input("cannot inject key into a non-JSON body"));
    }
    buf.pop();
    if buf.len() > 1 {
        buf.push(b',');
    }
    push_quoted(&mut buf, RESERVED_KEY_FIELD);
    buf.push(b':');
    push_quoted(&mut buf, key);
    buf.push(b'}');
    Ok(buf)
}

fn push_quoted(buf: &mut Vec<u8>, raw: &[u8]) {
    buf.push(b'"');
    buf.extend_from_slice(raw);
    buf.push(b'"');
}

#[async_trait]
impl Connector for Router {
    fn id(&self) -> &str {
        &self.id
    }

    fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    async fn forward(&self, mutation: Arc<MutationEvent>) -> Result<()> {
        if let Some(matcher) = &self.filter {
            match self.apply_filter(&mutation, matcher.as_ref()) {
                Ok(Verdict::Pass) => {}
                Ok(Verdict::Drop) => {
                    self.publisher.raise(
                        EventKind::DataFiltered,
                        Some(mutation),
                        EventAux {
                            at: Some(Instant::now()),
                            ..Default::default()
                        },
                    );
                    return Ok(());
                }
                Err(err) => {
                    // a malformed mutation fails alone
                    tracing::warn!(
                        part = %self.id,
                        seqno = mutation.seqno,
                        vbno = mutation.vbno,
                        error = %err,
                        "dropping mutation that could not be filtered"
                    );
                    self.publisher.raise(
                        EventKind::DataFiltered,
                        Some(mutation),
                        EventAux {
                            error: Some(err.to_string()),
                            at: Some(Instant::now()),
                            ..Default::default()
                        },
                    );
                    return Ok(());
                }
            }
        }

        let target = self.targets.get(&mutation.vbno).ok_or_else(|| {
            Error::fatal(format!(
                "{}: no target nozzle routes vb {}",
                self.id, mutation.vbno
            ))
        })?;
        target.accept(mutation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        build_xattr_section, deflate, MutationKind, DATATYPE_JSON, DATATYPE_SNAPPY, DATATYPE_XATTR,
    };

    struct TestMatcher {
        refs: (bool, bool, bool), // key, xattrs, body
        expect: Vec<u8>,
    }

    impl FilterMatcher for TestMatcher {
        fn matches(&self, body: &[u8]) -> Result<bool> {
            Ok(windows_contain(body, &self.expect))
        }

        fn references_doc_key(&self) -> bool {
            self.refs.0
        }

        fn references_xattrs(&self) -> bool {
            self.refs.1
        }

        fn references_body(&self) -> bool {
            self.refs.2
        }
    }

    fn windows_contain(haystack: &[u8], needle: &[u8]) -> bool {
        !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn router(filter: Option<Arc<dyn FilterMatcher>>) -> Router {
        Router::new("router_0", HashMap::new(), filter, Arc::new(BytePool::new()))
    }

    fn mutation(datatype: u8, key: &[u8], value: Vec<u8>) -> MutationEvent {
        MutationEvent {
            kind: MutationKind::Mutation,
            vbno: 0,
            seqno: 1,
            rev_seqno: 1,
            cas: 1,
            flags: 0,
            expiry: 0,
            datatype,
            key: key.to_vec(),
            value,
        }
    }

    #[test]
    fn test_body_filter_pass_and_drop() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, false, true),
            expect: br#""a":1"#.to_vec(),
        };

        let hit = mutation(DATATYPE_JSON, b"k", br#"{"a":1}"#.to_vec());
        assert_eq!(r.apply_filter(&hit, &matcher).unwrap(), Verdict::Pass);

        let miss = mutation(DATATYPE_JSON, b"k", br#"{"b":2}"#.to_vec());
        assert_eq!(r.apply_filter(&miss, &matcher).unwrap(), Verdict::Drop);
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_filter_outcome_independent_of_snappy_framing() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, false, true),
            expect: br#""a":1"#.to_vec(),
        };
        let body = br#"{"a":1}"#;

        let plain = mutation(DATATYPE_JSON, b"k", body.to_vec());
        let compressed = mutation(DATATYPE_JSON | DATATYPE_SNAPPY, b"k", deflate(body));

        assert_eq!(
            r.apply_filter(&plain, &matcher).unwrap(),
            r.apply_filter(&compressed, &matcher).unwrap()
        );
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_non_json_body_is_invalid_input() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, false, true),
            expect: b"x".to_vec(),
        };
        let raw = mutation(DATATYPE_JSON, b"k", b"not json".to_vec());
        let err = r.apply_filter(&raw, &matcher).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_key_injection() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (true, false, true),
            expect: br#"[$%ReservedDocKey%$]":"keep"#.to_vec(),
        };
        let keep = mutation(DATATYPE_JSON, b"keep", br#"{"x":1}"#.to_vec());
        assert_eq!(r.apply_filter(&keep, &matcher).unwrap(), Verdict::Pass);

        let drop = mutation(DATATYPE_JSON, b"drop", br#"{"x":1}"#.to_vec());
        assert_eq!(r.apply_filter(&drop, &matcher).unwrap(), Verdict::Drop);
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_key_only_filter_skips_body_parsing() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (true, false, false),
            expect: br#""keep""#.to_vec(),
        };
        // value is not JSON at all; key-only filtering must not care
        let raw = mutation(0, b"keep", b"\x01\x02binary".to_vec());
        assert_eq!(r.apply_filter(&raw, &matcher).unwrap(), Verdict::Pass);
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_non_json_without_key_or_body_refs_passes_through() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, false, true),
            expect: b"never".to_vec(),
        };
        // datatype=0: no JSON, no xattr; body filter has nothing to evaluate
        let raw = mutation(0, b"k", b"binary".to_vec());
        assert_eq!(r.apply_filter(&raw, &matcher).unwrap(), Verdict::Pass);
    }

    #[test]
    fn test_xattr_reframed_for_xattr_filter() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, true, true),
            expect: br#""src":"a""#.to_vec(),
        };
        let section = build_xattr_section(&[(b"src", br#""a""#)]);
        let mut value = section;
        value.extend_from_slice(br#"{"x":1}"#);
        let m = mutation(DATATYPE_JSON | DATATYPE_XATTR, b"k", value);
        assert_eq!(r.apply_filter(&m, &matcher).unwrap(), Verdict::Pass);
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_xattr_stripped_for_body_filter() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, false, true),
            expect: br#""src""#.to_vec(),
        };
        let section = build_xattr_section(&[(b"src", br#""a""#)]);
        let mut value = section;
        value.extend_from_slice(br#"{"x":1}"#);
        let m = mutation(DATATYPE_JSON | DATATYPE_XATTR, b"k", value);
        // xattrs are stripped, so the xattr key must not match
        assert_eq!(r.apply_filter(&m, &matcher).unwrap(), Verdict::Drop);
    }

    #[test]
    fn test_zero_byte_body_with_xattr_filters_as_empty_object() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, false, true),
            expect: b"{}".to_vec(),
        };
        let value = build_xattr_section(&[(b"src", br#""a""#)]);
        let m = mutation(DATATYPE_XATTR, b"k", value);
        assert_eq!(r.apply_filter(&m, &matcher).unwrap(), Verdict::Pass);
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[test]
    fn test_oversized_xattr_section_is_error_not_crash() {
        let r = router(None);
        let matcher = TestMatcher {
            refs: (false, true, true),
            expect: b"x".to_vec(),
        };
        let mut value = Vec::new();
        value.extend_from_slice(&(crate::protocol::MAX_DOC_SIZE_BYTES + 1).to_be_bytes());
        value.extend_from_slice(b"{}");
        let m = mutation(DATATYPE_JSON | DATATYPE_XATTR, b"k", value);
        assert!(matches!(
            r.apply_filter(&m, &matcher),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(r.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_forward_drop_raises_data_filtered() {
        use crate::pipeline::part::{ComponentEvent, EventListener};
        use parking_lot::Mutex;

        struct Recorder {
            count: Mutex<usize>,
        }
        impl EventListener for Recorder {
            fn on_event(&self, event: &ComponentEvent) {
                assert_eq!(event.kind, EventKind::DataFiltered);
                *self.count.lock() += 1;
            }
        }

        let matcher: Arc<dyn FilterMatcher> = Arc::new(TestMatcher {
            refs: (false, false, true),
            expect: b"never-present".to_vec(),
        });
        let r = router(Some(matcher));
        let recorder = Arc::new(Recorder {
            count: Mutex::new(0),
        });
        r.publisher
            .register_listener(EventKind::DataFiltered, recorder.clone());

        let m = Arc::new(mutation(DATATYPE_JSON, b"k", br#"{"a":1}"#.to_vec()));
        r.forward(m).await.unwrap();
        assert_eq!(*recorder.count.lock(), 1);
    }

    #[tokio::test]
    async fn test_invalid_input_drops_without_stopping() {
        let matcher: Arc<dyn FilterMatcher> = Arc::new(TestMatcher {
            refs: (false, false, true),
            expect: b"x".to_vec(),
        });
        let r = router(Some(matcher));
        let m = Arc::new(mutation(DATATYPE_JSON, b"k", b"garbage".to_vec()));
        // the mutation is dropped, not escalated
        r.forward(m).await.unwrap();
        assert_eq!(r.pool.outstanding(), 0);
    }
}
