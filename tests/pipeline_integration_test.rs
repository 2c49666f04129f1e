//! End-to-end pipeline tests over scripted transports
//!
//! Each test drives a full pipeline (DCP nozzle → router → XMEM nozzle plus
//! checkpoint and statistics managers) with scripted DCP input and a
//! recording target, and asserts on the wire output and published telemetry.

use replistream::checkpoint::{CheckpointRecord, CheckpointsDoc, CHECKPOINT_SCHEMA_VERSION};
use replistream::metadata::{self, ReplicationSpecification};
use replistream::protocol::{
    build_xattr_section, DcpMessage, MutationEvent, MutationKind, Status, DATATYPE_JSON,
    DATATYPE_XATTR,
};
use replistream::service::{FilterMatcher, MetadataService, MemMetadataService};
use replistream::stats;
use replistream::testing::{
    AcceptAllHandshake, FixedFilterFactory, KeyEqualsFilter, MockMcFactory, ScriptedDcpFactory,
    StaticClusterInfo, XattrEqualsFilter,
};
use replistream::{Pipeline, PipelineServices, PipelineState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SOURCE_SERVER: &str = "source-kv-1:11210";
const TARGET_SERVER: &str = "target-kv-1:11210";

struct Harness {
    services: PipelineServices,
    metadata_svc: Arc<MemMetadataService>,
    dcp: Arc<ScriptedDcpFactory>,
    mc: Arc<MockMcFactory>,
    target_cluster: Arc<StaticClusterInfo>,
}

fn harness(vbnos: Vec<u16>, filter: Option<Arc<dyn FilterMatcher>>) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let metadata_svc = Arc::new(MemMetadataService::new());
    let dcp = Arc::new(ScriptedDcpFactory::new());
    let mc = Arc::new(MockMcFactory::new());
    let source_cluster = Arc::new(StaticClusterInfo::single(SOURCE_SERVER, vbnos.clone()));
    let target_cluster = Arc::new(StaticClusterInfo::single(TARGET_SERVER, vbnos));

    let services = PipelineServices {
        metadata: metadata_svc.clone(),
        source_cluster,
        target_cluster: target_cluster.clone(),
        dcp_factory: dcp.clone(),
        mc_factory: mc.clone(),
        handshake: Arc::new(AcceptAllHandshake::default()),
        filter_factory: filter.map(|m| Arc::new(FixedFilterFactory::new(m)) as _),
    };
    Harness {
        services,
        metadata_svc,
        dcp,
        mc,
        target_cluster,
    }
}

fn spec_with(settings: &[(&str, serde_json::Value)]) -> ReplicationSpecification {
    let mut spec = ReplicationSpecification::new("travel", "remote-uuid", "travel-backup");
    let updates: HashMap<String, serde_json::Value> = settings
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    let (_, errors) = spec.settings.update_from_map(&updates, &Default::default());
    assert!(errors.is_empty(), "settings rejected: {:?}", errors);
    spec
}

fn mutation(vbno: u16, seqno: u64, key: &[u8], datatype: u8, value: Vec<u8>) -> DcpMessage {
    DcpMessage::Mutation(Arc::new(MutationEvent {
        kind: MutationKind::Mutation,
        vbno,
        seqno,
        rev_seqno: 1,
        cas: 0x1122_3344_5566_7788,
        flags: 0x2000,
        expiry: 0,
        datatype,
        key: key.to_vec(),
        value,
    }))
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_happy_path_single_mutation() {
    let h = harness(vec![0, 1, 2, 3], None);
    let spec = spec_with(&[
        (metadata::BATCH_COUNT, serde_json::json!(1)),
        (metadata::PUBLISH_INTERVAL, serde_json::json!(100)),
    ]);

    // one mutation outstanding on the source
    h.mc.script_for(SOURCE_SERVER)
        .set_high_seqnos(&[(0, 1), (1, 0), (2, 0), (3, 0)]);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Replicating);

    let script = h.dcp.script_for(SOURCE_SERVER);
    script.push(DcpMessage::SnapshotMarker {
        vbno: 0,
        start: 0,
        end: 42,
    });
    script.push(mutation(
        0,
        42,
        b"k",
        DATATYPE_JSON,
        br#"{"a":1}"#.to_vec(),
    ));

    let target = h.mc.script_for(TARGET_SERVER);
    wait_until("target write", || !target.write_requests().is_empty()).await;

    let writes = target.write_requests();
    assert_eq!(writes.len(), 1);
    let write = &writes[0];
    assert_eq!(write.key, b"k");
    assert_eq!(write.body, br#"{"a":1}"#);
    assert_eq!(write.vbucket, 0);
    // source cas and flags ride in the extras
    assert_eq!(&write.extras[0..4], &0x2000u32.to_be_bytes());
    assert_eq!(&write.extras[16..24], &0x1122_3344_5566_7788u64.to_be_bytes());

    // one publish interval later the overview reflects the write
    wait_until("overview", || {
        pipeline
            .stats()
            .overview()
            .map(|o| o[stats::DOCS_WRITTEN_METRIC] == serde_json::json!(1))
            .unwrap_or(false)
    })
    .await;
    let overview = pipeline.stats().overview().unwrap();
    assert_eq!(overview[stats::DOCS_FILTERED_METRIC], serde_json::json!(0));
    assert_eq!(overview[stats::CHANGES_LEFT_METRIC], serde_json::json!(0));

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[tokio::test]
async fn test_filter_drops_non_matching_key() {
    let h = harness(
        vec![0],
        Some(Arc::new(KeyEqualsFilter::new("keep")) as Arc<dyn FilterMatcher>),
    );
    let spec = spec_with(&[
        (metadata::BATCH_COUNT, serde_json::json!(1)),
        (metadata::PUBLISH_INTERVAL, serde_json::json!(100)),
        (
            metadata::FILTER_EXPRESSION,
            serde_json::json!("META().id=\"keep\""),
        ),
    ]);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    let script = h.dcp.script_for(SOURCE_SERVER);
    script.push(mutation(
        0,
        7,
        b"drop",
        DATATYPE_JSON,
        br#"{"a":1}"#.to_vec(),
    ));

    wait_until("docs_filtered", || {
        pipeline
            .stats()
            .overview()
            .map(|o| o[stats::DOCS_FILTERED_METRIC] == serde_json::json!(1))
            .unwrap_or(false)
    })
    .await;
    assert!(h.mc.script_for(TARGET_SERVER).write_requests().is_empty());

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_xattr_filter_passes_and_strips_declined_framing() {
    let h = harness(
        vec![0],
        Some(Arc::new(XattrEqualsFilter::new("src", "\"a\"")) as Arc<dyn FilterMatcher>),
    );
    let spec = spec_with(&[
        (metadata::BATCH_COUNT, serde_json::json!(1)),
        (
            metadata::FILTER_EXPRESSION,
            serde_json::json!("META().xattrs.src=\"a\""),
        ),
    ]);

    // target declines the xattr feature
    h.mc.script_for(TARGET_SERVER).grants.lock().xattr = false;

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    let mut value = build_xattr_section(&[(b"src", br#""a""#)]);
    value.extend_from_slice(br#"{"x":1}"#);
    h.dcp.script_for(SOURCE_SERVER).push(mutation(
        0,
        9,
        b"k",
        DATATYPE_JSON | DATATYPE_XATTR,
        value,
    ));

    let target = h.mc.script_for(TARGET_SERVER);
    wait_until("target write", || !target.write_requests().is_empty()).await;

    // the filter saw the xattr, but the write omits the declined framing
    let writes = target.write_requests();
    assert_eq!(writes[0].body, br#"{"x":1}"#);
    assert_eq!(writes[0].datatype & DATATYPE_XATTR, 0);

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_rollback_restarts_stream_at_demanded_seqno() {
    let h = harness(vec![0], None);
    let spec = spec_with(&[(metadata::BATCH_COUNT, serde_json::json!(1))]);
    let topic = spec.id.clone();

    // persisted checkpoint: vb 0 at seqno 100 under source uuid U1
    const U1: u64 = 0xABCD;
    let doc = CheckpointsDoc {
        version: CHECKPOINT_SCHEMA_VERSION,
        records: vec![CheckpointRecord {
            target_vb_uuid: 1,
            target_seqno: 100,
            source_vb_uuid: U1,
            source_seqno: 100,
            snapshot_start: 100,
            snapshot_end: 100,
            failover_uuid: U1,
            failover_seqno: 100,
        }],
    };
    h.metadata_svc
        .add(
            &format!("ckpt/{}/0", topic),
            serde_json::to_vec(&doc).unwrap(),
        )
        .await
        .unwrap();

    let script = h.dcp.script_for(SOURCE_SERVER);
    script.set_failover_log(0, vec![(U1, 150)]);
    // producer only accepts seqno <= 50
    script.demand_rollback(0, 50);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    let requests = script.stream_requests.lock().clone();
    assert!(
        requests.contains(&(0, U1, 50)),
        "expected restart at (U1, 50), got {:?}",
        requests
    );
    // the demoted checkpoint may not exceed the rollback point
    let record = pipeline.checkpoints().latest_record(0).unwrap();
    assert!(record.source_seqno <= 50);

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_not_my_vbucket_reroutes_to_new_owner() {
    const TARGET_SERVER_2: &str = "target-kv-2:11210";
    let h = harness(vec![7], None);
    let spec = spec_with(&[
        (metadata::BATCH_COUNT, serde_json::json!(1)),
        (metadata::PUBLISH_INTERVAL, serde_json::json!(100)),
        (metadata::RETRY_INTERVAL, serde_json::json!(1)),
    ]);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    // vb 7 moves to the second server; the old owner answers NMV once
    let mut new_map = HashMap::new();
    new_map.insert(TARGET_SERVER_2.to_string(), vec![7u16]);
    h.target_cluster.set_map(new_map);
    h.mc.script_for(TARGET_SERVER)
        .push_status(Status::NotMyVbucket);

    h.dcp.script_for(SOURCE_SERVER).push(mutation(
        7,
        3,
        b"moved",
        DATATYPE_JSON,
        br#"{"m":1}"#.to_vec(),
    ));

    let new_owner = h.mc.script_for(TARGET_SERVER_2);
    wait_until("write on new owner", || {
        !new_owner.write_requests().is_empty()
    })
    .await;
    assert_eq!(new_owner.write_requests()[0].key, b"moved");

    // the mutation was acknowledged exactly once
    wait_until("docs_written", || {
        pipeline
            .stats()
            .overview()
            .map(|o| o[stats::DOCS_WRITTEN_METRIC] == serde_json::json!(1))
            .unwrap_or(false)
    })
    .await;

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_batch_flushes_on_bytes_before_count() {
    let h = harness(vec![0], None);
    // large count, small byte cap, long age: bytes must trigger the flush
    let spec = spec_with(&[
        (metadata::BATCH_COUNT, serde_json::json!(1000)),
        (metadata::BATCH_SIZE, serde_json::json!(10)), // 10 KB
        (metadata::MAX_BATCH_AGE, serde_json::json!(60000)),
    ]);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    let script = h.dcp.script_for(SOURCE_SERVER);
    let big_value = format!(r#"{{"pad":"{}"}}"#, "x".repeat(4000)).into_bytes();
    for seqno in 1..=3u64 {
        script.push(mutation(0, seqno, b"big", DATATYPE_JSON, big_value.clone()));
    }

    let target = h.mc.script_for(TARGET_SERVER);
    wait_until("byte-triggered flush", || {
        target.write_requests().len() == 3
    })
    .await;

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_seqno_ordering_invariant() {
    let h = harness(vec![0], None);
    let spec = spec_with(&[(metadata::BATCH_COUNT, serde_json::json!(1))]);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    let script = h.dcp.script_for(SOURCE_SERVER);
    for seqno in 1..=5u64 {
        script.push(mutation(0, seqno, b"k", DATATYPE_JSON, br#"{"a":1}"#.to_vec()));
    }

    let target = pipeline.targets()[0].clone();
    wait_until("acks", || target.seqno_tracker().through_seqno(0) == 5).await;

    pipeline.checkpoints().checkpoint_once().await.unwrap();
    let record = pipeline.checkpoints().latest_record(0).unwrap();
    let progress = target.seqno_tracker().progress(0);

    assert!(record.source_seqno <= progress.last_acked);
    assert!(progress.last_acked <= progress.last_sent);
    assert!(progress.last_sent <= progress.last_received);

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_settings_survive_json_round_trip_with_float_collapse() {
    let metadata_svc = Arc::new(MemMetadataService::new());
    let specs = replistream::SpecService::new(metadata_svc.clone());

    let mut settings = metadata::default_replication_settings();
    let mut updates = HashMap::new();
    updates.insert(
        metadata::PUBLISH_INTERVAL.to_string(),
        serde_json::json!(250),
    );
    settings.update_from_map(&updates, &Default::default());
    specs.set_default_settings(&settings, None).await.unwrap();

    // overwrite the persisted value with the float a lossy encoder produces
    let (raw, rev) = metadata_svc
        .get(metadata::DEFAULT_REPLICATION_SETTINGS_KEY)
        .await
        .unwrap();
    let mut value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    value["values"][metadata::PUBLISH_INTERVAL] = serde_json::json!(250.0);
    metadata_svc
        .set(
            metadata::DEFAULT_REPLICATION_SETTINGS_KEY,
            serde_json::to_vec(&value).unwrap(),
            Some(rev),
        )
        .await
        .unwrap();

    let reloaded = specs.default_settings().await.unwrap();
    assert_eq!(reloaded.get_int(metadata::PUBLISH_INTERVAL), 250);
}

#[tokio::test]
async fn test_transient_target_failure_retries_in_place() {
    let h = harness(vec![0], None);
    let spec = spec_with(&[
        (metadata::BATCH_COUNT, serde_json::json!(1)),
        (metadata::RETRY_INTERVAL, serde_json::json!(1)),
    ]);

    let target = h.mc.script_for(TARGET_SERVER);
    target.push_status(Status::TempFailure);
    target.push_status(Status::TempFailure);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    h.dcp.script_for(SOURCE_SERVER).push(mutation(
        0,
        1,
        b"k",
        DATATYPE_JSON,
        br#"{"a":1}"#.to_vec(),
    ));

    // two TMPFAILs then success: three writes on the wire, one ack
    wait_until("retried write", || target.write_requests().len() == 3).await;
    let nozzle = pipeline.targets()[0].clone();
    wait_until("ack", || nozzle.seqno_tracker().through_seqno(0) == 1).await;
    assert_eq!(pipeline.state(), PipelineState::Replicating);

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_conflict_loss_counts_as_delivered() {
    let h = harness(vec![0], None);
    let spec = spec_with(&[(metadata::BATCH_COUNT, serde_json::json!(1))]);

    let target = h.mc.script_for(TARGET_SERVER);
    target.push_status(Status::KeyExists);

    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    h.dcp.script_for(SOURCE_SERVER).push(mutation(
        0,
        4,
        b"k",
        DATATYPE_JSON,
        br#"{"a":1}"#.to_vec(),
    ));

    let nozzle = pipeline.targets()[0].clone();
    wait_until("conflict-loss ack", || {
        nozzle.seqno_tracker().through_seqno(0) == 4
    })
    .await;
    // no retry happened
    assert_eq!(target.write_requests().len(), 1);

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_resume_after_restart() {
    let h = harness(vec![0], None);
    let spec = spec_with(&[(metadata::BATCH_COUNT, serde_json::json!(1))]);

    let script = h.dcp.script_for(SOURCE_SERVER);
    script.set_failover_log(0, vec![(0x77, 900)]);

    // first run: replicate three mutations and cut a checkpoint
    {
        let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
        pipeline.start().await.unwrap();
        script.push(DcpMessage::SnapshotMarker {
            vbno: 0,
            start: 0,
            end: 3,
        });
        for seqno in 1..=3u64 {
            script.push(mutation(0, seqno, b"k", DATATYPE_JSON, br#"{"a":1}"#.to_vec()));
        }
        let nozzle = pipeline.targets()[0].clone();
        wait_until("acks", || nozzle.seqno_tracker().through_seqno(0) == 3).await;
        pipeline.stop().await.unwrap();
    }

    // second run resumes past the replicated prefix
    script.stream_requests.lock().clear();
    let pipeline = Pipeline::build(&spec, h.services.clone()).await.unwrap();
    pipeline.start().await.unwrap();

    let requests = script.stream_requests.lock().clone();
    assert!(
        requests.iter().any(|(vbno, _, start)| *vbno == 0 && *start == 3),
        "expected resume from seqno 3, got {:?}",
        requests
    );
    pipeline.stop().await.unwrap();
}
