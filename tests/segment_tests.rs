//! Segment lifecycle end to end: registration from the segment channel,
//! seal-and-flush on time ticks, flush completion, and index fan-out.

mod common;

use common::{base, start_master, vector_schema, wait_for, TestMaster};
use lodestar::api::{
    CreateCollectionRequest, CreateIndexRequest, DescribeIndexRequest, DescribeSegmentRequest,
    DropIndexRequest, ErrorCode, ShowSegmentsRequest,
};
use lodestar::meta::{KeyValue, SegmentInfo, SegmentState};
use lodestar::msgstream::Msg;
use lodestar::UniqueId;
use std::time::Duration;

async fn setup_collection(tm: &TestMaster, name: &str, ts: u64) -> (UniqueId, UniqueId) {
    let status = tm
        .master
        .create_collection(&tm.ctx, CreateCollectionRequest {
            base: base(ts),
            db_name: "testDb".to_string(),
            collection_name: name.to_string(),
            schema: vector_schema(name),
        })
        .await;
    assert!(status.is_success(), "{}", status.reason);

    let coll = tm.master.meta().get_collection_by_name(name).await.unwrap();
    (coll.id, coll.partition_ids[0])
}

#[tokio::test]
async fn test_segment_registration_and_flush() {
    let tm = start_master().await;
    let (coll_id, part_id) = setup_collection(&tm, "testColl", 100).await;

    tm.publish_segment(SegmentInfo::growing(1000, coll_id, part_id, "ch-0", 5));
    assert!(
        wait_for(|| async {
            tm.master
                .meta()
                .get_partition_by_id(part_id)
                .await
                .map(|p| p.segment_ids.contains(&1000))
                .unwrap_or(false)
        })
        .await,
        "segment 1000 not registered"
    );

    let rsp = tm
        .master
        .show_segments(&tm.ctx, ShowSegmentsRequest {
            base: base(170),
            collection_id: coll_id,
            partition_id: part_id,
        })
        .await;
    assert!(rsp.status.is_success(), "{}", rsp.status.reason);
    assert_eq!(rsp.segment_ids, vec![1000]);

    tm.publish_flush_completed(1000, 175);
    assert!(
        wait_for(|| async {
            tm.master.meta().segment_state(1000).await == Some(SegmentState::Flushed)
        })
        .await,
        "segment 1000 not flushed"
    );

    // no index bindings yet, so nothing was built
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tm.index.build_calls.lock().is_empty());

    tm.master.stop().await;
}

#[tokio::test]
async fn test_duplicate_segment_event_ignored() {
    let tm = start_master().await;
    let (coll_id, part_id) = setup_collection(&tm, "testColl", 100).await;

    let seg = SegmentInfo::growing(1000, coll_id, part_id, "ch-0", 5);
    tm.publish_segment(seg.clone());
    tm.publish_segment(seg);

    assert!(
        wait_for(|| async {
            tm.master
                .meta()
                .get_partition_by_id(part_id)
                .await
                .map(|p| p.segment_ids.contains(&1000))
                .unwrap_or(false)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let part = tm.master.meta().get_partition_by_id(part_id).await.unwrap();
    assert_eq!(
        part.segment_ids.iter().filter(|id| **id == 1000).count(),
        1,
        "duplicate event must be ignored"
    );

    tm.master.stop().await;
}

#[tokio::test]
async fn test_create_index_fan_out() {
    let tm = start_master().await;
    let (coll_id, part_id) = setup_collection(&tm, "testColl", 100).await;

    tm.publish_segment(SegmentInfo::growing(1000, coll_id, part_id, "ch-0", 5));
    tm.publish_flush_completed(1000, 175);
    assert!(
        wait_for(|| async {
            tm.master.meta().segment_state(1000).await == Some(SegmentState::Flushed)
        })
        .await
    );

    let coll = tm.master.meta().get_collection_by_name("testColl").await.unwrap();
    assert!(coll.field_indexes.is_empty());

    let status = tm
        .master
        .create_index(&tm.ctx, CreateIndexRequest {
            base: base(180),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "vector".to_string(),
            extra_params: vec![KeyValue::new("ik1", "iv1")],
        })
        .await;
    assert!(status.is_success(), "{}", status.reason);

    let coll = tm.master.meta().get_collection_by_name("testColl").await.unwrap();
    assert_eq!(coll.field_indexes.len(), 1, "exactly one binding expected");

    assert!(
        wait_for(|| async { tm.index.build_calls.lock().len() == 1 }).await,
        "exactly one build call expected"
    );
    {
        let calls = tm.index.build_calls.lock();
        assert_eq!(calls[0].data_paths, vec!["file1", "file2", "file3"]);
        assert_eq!(calls[0].index_name, tm.config.default_index_name);
        assert_eq!(calls[0].index_id, coll.field_indexes[0].index_id);
    }

    // the build lands as an enabled segment index
    assert!(
        wait_for(|| async {
            tm.master
                .meta()
                .get_segment_index_info(1000, -1, "")
                .await
                .map(|info| info.enable_index && info.build_id == 2000)
                .unwrap_or(false)
        })
        .await
    );

    let rsp = tm
        .master
        .describe_segment(&tm.ctx, DescribeSegmentRequest {
            base: base(190),
            collection_id: coll_id,
            segment_id: 1000,
        })
        .await;
    assert!(rsp.status.is_success(), "{}", rsp.status.reason);
    assert!(rsp.enable_index);
    assert_eq!(rsp.build_id, 2000);

    let rsp = tm
        .master
        .describe_index(&tm.ctx, DescribeIndexRequest {
            base: base(200),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "vector".to_string(),
            index_name: String::new(),
        })
        .await;
    assert!(rsp.status.is_success());
    assert_eq!(rsp.index_descriptions.len(), 1);
    assert_eq!(
        rsp.index_descriptions[0].index_name,
        tm.config.default_index_name
    );

    // an identical CreateIndex is a no-op
    let status = tm
        .master
        .create_index(&tm.ctx, CreateIndexRequest {
            base: base(205),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "vector".to_string(),
            extra_params: vec![KeyValue::new("ik1", "iv1")],
        })
        .await;
    assert!(status.is_success(), "{}", status.reason);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tm.index.build_calls.lock().len(), 1);
    let coll = tm.master.meta().get_collection_by_name("testColl").await.unwrap();
    assert_eq!(coll.field_indexes.len(), 1);

    // an unknown field fails
    let status = tm
        .master
        .create_index(&tm.ctx, CreateIndexRequest {
            base: base(210),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "no field".to_string(),
            extra_params: vec![KeyValue::new("ik1", "iv1")],
        })
        .await;
    assert_ne!(status.error_code, ErrorCode::Success);

    tm.master.stop().await;
}

#[tokio::test]
async fn test_flush_completion_fans_out_builds() {
    let tm = start_master().await;
    let (coll_id, part_id) = setup_collection(&tm, "testColl", 100).await;

    tm.publish_segment(SegmentInfo::growing(1000, coll_id, part_id, "ch-0", 5));
    tm.publish_flush_completed(1000, 175);
    assert!(
        wait_for(|| async {
            tm.master.meta().segment_state(1000).await == Some(SegmentState::Flushed)
        })
        .await
    );

    tm.master
        .create_index(&tm.ctx, CreateIndexRequest {
            base: base(180),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "vector".to_string(),
            extra_params: vec![KeyValue::new("ik1", "iv1")],
        })
        .await;
    assert!(wait_for(|| async { tm.index.build_calls.lock().len() == 1 }).await);

    // a later segment picks its build up from the flush-completed event
    tm.publish_segment(SegmentInfo::growing(1001, coll_id, part_id, "ch-0", 6));
    assert!(
        wait_for(|| async {
            tm.master
                .meta()
                .get_partition_by_id(part_id)
                .await
                .map(|p| p.segment_ids.contains(&1001))
                .unwrap_or(false)
        })
        .await
    );
    tm.publish_flush_completed(1001, 211);

    assert!(
        wait_for(|| async { tm.index.build_calls.lock().len() == 2 }).await,
        "flush completion must schedule a build for the existing binding"
    );
    assert!(
        wait_for(|| async {
            tm.master
                .meta()
                .get_segment_index_info(1001, -1, "")
                .await
                .map(|info| info.enable_index)
                .unwrap_or(false)
        })
        .await
    );

    tm.master.stop().await;
}

#[tokio::test]
async fn test_drop_index() {
    let tm = start_master().await;
    let (coll_id, part_id) = setup_collection(&tm, "testColl", 100).await;

    tm.publish_segment(SegmentInfo::growing(1000, coll_id, part_id, "ch-0", 5));
    tm.publish_flush_completed(1000, 175);
    assert!(
        wait_for(|| async {
            tm.master.meta().segment_state(1000).await == Some(SegmentState::Flushed)
        })
        .await
    );

    tm.master
        .create_index(&tm.ctx, CreateIndexRequest {
            base: base(180),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "vector".to_string(),
            extra_params: vec![KeyValue::new("ik1", "iv1")],
        })
        .await;
    assert!(wait_for(|| async { tm.index.build_calls.lock().len() == 1 }).await);

    let bound = tm
        .master
        .meta()
        .get_indexes_by_name("testColl", "vector", &tm.config.default_index_name)
        .await
        .unwrap();
    assert_eq!(bound.len(), 1);
    let index_id = bound[0].index_id;

    let status = tm
        .master
        .drop_index(&tm.ctx, DropIndexRequest {
            base: base(215),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "vector".to_string(),
            index_name: tm.config.default_index_name.clone(),
        })
        .await;
    assert!(status.is_success(), "{}", status.reason);

    // exactly one drop RPC carrying the allocated index id
    assert_eq!(*tm.index.dropped.lock(), vec![index_id]);

    let rsp = tm
        .master
        .describe_index(&tm.ctx, DescribeIndexRequest {
            base: base(216),
            db_name: String::new(),
            collection_name: "testColl".to_string(),
            field_name: "vector".to_string(),
            index_name: String::new(),
        })
        .await;
    assert_eq!(rsp.status.error_code, ErrorCode::IndexNotExist);
    assert!(rsp.index_descriptions.is_empty());

    tm.master.stop().await;
}

#[tokio::test]
async fn test_time_tick_seals_and_flushes_idle_segment() {
    let tm = start_master().await;
    let (coll_id, part_id) = setup_collection(&tm, "testColl", 100).await;

    let mut tick_rx = tm.bus.consumer(&tm.config.time_tick_channel, "tick-observer");
    let mut dd_rx = tm.bus.consumer(&tm.config.ddl_channel, "dd-observer");

    let seg_alloc = tm.master.segment_allocator();
    let (seg_id, granted, expire_ts) = seg_alloc
        .alloc_rows(coll_id, part_id, "ch-0", 10)
        .await
        .unwrap();
    assert_eq!(granted, 10);

    tm.publish_proxy_tick(expire_ts);

    assert!(
        wait_for(|| async { !tm.data.flush_calls.lock().is_empty() }).await,
        "flush must be dispatched after the reservation expires"
    );
    assert_eq!(*tm.data.flush_calls.lock(), vec![(coll_id, vec![seg_id])]);
    assert_eq!(
        tm.master.meta().segment_state(seg_id).await,
        Some(SegmentState::Sealed)
    );
    assert!(seg_alloc.segment_status(seg_id).await.is_none());

    // the tick is mirrored on the master tick channel and the DDL channel
    for rx in [&mut tick_rx, &mut dd_rx] {
        let pack = tokio::time::timeout(Duration::from_secs(1), rx.consume())
            .await
            .expect("tick within 1s")
            .expect("channel open");
        match &pack.msgs[0] {
            Msg::TimeTick(tick) => assert_eq!(tick.timestamp, expire_ts),
            other => panic!("expected TimeTick, got {other:?}"),
        }
    }

    // the data node confirms persistence
    tm.publish_flush_completed(seg_id, expire_ts + 1);
    assert!(
        wait_for(|| async {
            tm.master.meta().segment_state(seg_id).await == Some(SegmentState::Flushed)
        })
        .await
    );

    tm.master.stop().await;
}

#[tokio::test]
async fn test_explicit_flush_seals_collection() {
    let tm = start_master().await;
    let (coll_id, part_id) = setup_collection(&tm, "testColl", 100).await;

    let seg_alloc = tm.master.segment_allocator();
    let (seg_id, _, expire_ts) = seg_alloc
        .alloc_rows(coll_id, part_id, "ch-0", 10)
        .await
        .unwrap();

    let status = tm.master.flush_collection(coll_id).await;
    assert!(status.is_success());

    let sealed = seg_alloc.sealed_segments().await;
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].segment_id, seg_id);

    // the pending reservation still gates the flush until it expires
    tm.publish_proxy_tick(expire_ts - 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tm.data.flush_calls.lock().is_empty());

    tm.publish_proxy_tick(expire_ts);
    assert!(wait_for(|| async { !tm.data.flush_calls.lock().is_empty() }).await);

    tm.master.stop().await;
}
