//! DDL task execution
//!
//! Each operation validates against the meta table, allocates ids for new
//! entities, mutates the catalog, emits the matching DDL message, and fires
//! best-effort downstream notifications.

use super::{DdlContext, DdlReply, DdlRequest};
use crate::api::{
    CreateCollectionRequest, CreateIndexRequest, CreatePartitionRequest,
    DescribeCollectionRequest, DescribeIndexRequest, DescribeSegmentRequest, DropCollectionRequest,
    DropIndexRequest, DropPartitionRequest, IndexDescription, ShowPartitionsRequest,
    ShowSegmentsRequest,
};
use crate::flush::IndexBuildTask;
use crate::meta::{
    CollectionInfo, DataType, FieldSchema, IndexInfo, PartitionInfo, ROW_ID_FIELD_ID,
    ROW_ID_FIELD_NAME, START_OF_USER_FIELD_ID, TIMESTAMP_FIELD_ID, TIMESTAMP_FIELD_NAME,
};
use crate::msgstream::{
    CreateCollectionMsg, CreatePartitionMsg, DropCollectionMsg, DropPartitionMsg,
};
use crate::{Error, Result, Timestamp};
use std::collections::HashSet;
use tracing::{debug, warn};

pub(crate) async fn execute(ctx: &DdlContext, request: DdlRequest, ts: Timestamp) -> Result<DdlReply> {
    match request {
        DdlRequest::CreateCollection(req) => create_collection(ctx, req, ts).await,
        DdlRequest::DropCollection(req) => drop_collection(ctx, req, ts).await,
        DdlRequest::HasCollection(req) => {
            Ok(DdlReply::Bool(ctx.meta.has_collection(&req.collection_name).await))
        }
        DdlRequest::DescribeCollection(req) => describe_collection(ctx, req).await,
        DdlRequest::ShowCollections(_) => {
            Ok(DdlReply::CollectionNames(ctx.meta.list_collections().await))
        }
        DdlRequest::CreatePartition(req) => create_partition(ctx, req, ts).await,
        DdlRequest::DropPartition(req) => drop_partition(ctx, req, ts).await,
        DdlRequest::HasPartition(req) => {
            let coll = ctx.meta.get_collection_by_name(&req.collection_name).await?;
            Ok(DdlReply::Bool(
                ctx.meta.has_partition(coll.id, &req.partition_name).await,
            ))
        }
        DdlRequest::ShowPartitions(req) => show_partitions(ctx, req).await,
        DdlRequest::CreateIndex(req) => create_index(ctx, req).await,
        DdlRequest::DescribeIndex(req) => describe_index(ctx, req).await,
        DdlRequest::DropIndex(req) => drop_index(ctx, req).await,
        DdlRequest::DescribeSegment(req) => describe_segment(ctx, req).await,
        DdlRequest::ShowSegments(req) => show_segments(ctx, req).await,
    }
}

async fn create_collection(
    ctx: &DdlContext,
    req: CreateCollectionRequest,
    ts: Timestamp,
) -> Result<DdlReply> {
    let mut schema = req.schema;
    if req.collection_name != schema.name {
        return Err(Error::InvalidDdl(format!(
            "collection name = {}, schema name = {}",
            req.collection_name, schema.name
        )));
    }

    let mut seen = HashSet::new();
    for field in &schema.fields {
        if field.name == ROW_ID_FIELD_NAME || field.name == TIMESTAMP_FIELD_NAME {
            return Err(Error::InvalidDdl(format!(
                "field name {} is reserved",
                field.name
            )));
        }
        if !seen.insert(field.name.clone()) {
            return Err(Error::InvalidDdl(format!(
                "duplicate field name {}",
                field.name
            )));
        }
    }

    // user fields are renumbered from the reserved floor, then the two
    // system columns are appended
    for (offset, field) in schema.fields.iter_mut().enumerate() {
        field.field_id = START_OF_USER_FIELD_ID + offset as i64;
    }
    schema.fields.push(system_field(ROW_ID_FIELD_ID, ROW_ID_FIELD_NAME, "row id"));
    schema.fields.push(system_field(
        TIMESTAMP_FIELD_ID,
        TIMESTAMP_FIELD_NAME,
        "time stamp",
    ));

    let coll_id = ctx.id_alloc.alloc_one().await?;
    let partition_id = ctx.id_alloc.alloc_one().await?;

    let coll = CollectionInfo {
        id: coll_id,
        schema: schema.clone(),
        create_time: ts,
        partition_ids: Vec::new(),
        field_indexes: Vec::new(),
    };
    let part = PartitionInfo {
        partition_name: ctx.config.default_partition_name.clone(),
        partition_id,
        segment_ids: Vec::new(),
    };
    ctx.meta.add_collection(coll, part, Vec::new()).await?;

    ctx.emitter
        .create_collection(CreateCollectionMsg {
            timestamp: ts,
            db_name: req.db_name.clone(),
            collection_name: req.collection_name.clone(),
            collection_id: coll_id,
            schema,
        })
        .await?;

    // the implicit default partition follows at ts + 1 so consumers observe
    // the two events in a fixed order
    ctx.emitter
        .create_partition(CreatePartitionMsg {
            timestamp: ts + 1,
            db_name: req.db_name,
            collection_name: req.collection_name,
            partition_name: ctx.config.default_partition_name.clone(),
            collection_id: coll_id,
            partition_id,
        })
        .await?;

    Ok(DdlReply::Done)
}

fn system_field(field_id: i64, name: &str, description: &str) -> FieldSchema {
    FieldSchema {
        field_id,
        name: name.to_string(),
        is_primary_key: false,
        description: description.to_string(),
        data_type: DataType::Int64,
        type_params: Vec::new(),
        index_params: Vec::new(),
    }
}

async fn drop_collection(
    ctx: &DdlContext,
    req: DropCollectionRequest,
    ts: Timestamp,
) -> Result<DdlReply> {
    let coll = ctx.meta.get_collection_by_name(&req.collection_name).await?;

    ctx.proxy
        .invalidate_collection_meta_cache(ts, &req.db_name, &req.collection_name)
        .await
        .map_err(|e| Error::External(format!("invalidate collection meta cache: {e}")))?;

    ctx.meta.delete_collection(coll.id).await?;

    ctx.emitter
        .drop_collection(DropCollectionMsg {
            timestamp: ts,
            db_name: req.db_name,
            collection_name: req.collection_name,
            collection_id: coll.id,
        })
        .await?;

    // releasing cached query state is best effort; the catalog is already
    // the source of truth
    let query = ctx.query.clone();
    let shutdown = ctx.shutdown.clone();
    let coll_id = coll.id;
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = query.release_collection(ts, 0, coll_id) => {
                if let Err(e) = result {
                    warn!(collection_id = coll_id, error = %e, "release collection failed");
                }
            }
        }
    });

    Ok(DdlReply::Done)
}

async fn describe_collection(
    ctx: &DdlContext,
    req: DescribeCollectionRequest,
) -> Result<DdlReply> {
    let coll = if req.collection_name.is_empty() {
        ctx.meta.get_collection_by_id(req.collection_id).await?
    } else {
        ctx.meta.get_collection_by_name(&req.collection_name).await?
    };

    let mut schema = coll.schema;
    schema
        .fields
        .retain(|field| field.field_id >= START_OF_USER_FIELD_ID);
    Ok(DdlReply::CollectionDescription {
        schema,
        collection_id: coll.id,
    })
}

async fn create_partition(
    ctx: &DdlContext,
    req: CreatePartitionRequest,
    ts: Timestamp,
) -> Result<DdlReply> {
    let coll = ctx.meta.get_collection_by_name(&req.collection_name).await?;
    let partition_id = ctx.id_alloc.alloc_one().await?;
    ctx.meta
        .add_partition(coll.id, &req.partition_name, partition_id)
        .await?;

    ctx.emitter
        .create_partition(CreatePartitionMsg {
            timestamp: ts,
            db_name: req.db_name.clone(),
            collection_name: req.collection_name.clone(),
            partition_name: req.partition_name,
            collection_id: coll.id,
            partition_id,
        })
        .await?;

    if let Err(e) = ctx
        .proxy
        .invalidate_collection_meta_cache(ts, &req.db_name, &req.collection_name)
        .await
    {
        warn!(collection = %req.collection_name, error = %e, "cache invalidation failed");
    }
    Ok(DdlReply::Done)
}

async fn drop_partition(
    ctx: &DdlContext,
    req: DropPartitionRequest,
    ts: Timestamp,
) -> Result<DdlReply> {
    let coll = ctx.meta.get_collection_by_name(&req.collection_name).await?;
    let partition_id = ctx
        .meta
        .delete_partition(coll.id, &req.partition_name)
        .await?;

    ctx.emitter
        .drop_partition(DropPartitionMsg {
            timestamp: ts,
            db_name: req.db_name.clone(),
            collection_name: req.collection_name.clone(),
            partition_name: req.partition_name,
            collection_id: coll.id,
            partition_id,
        })
        .await?;

    if let Err(e) = ctx
        .proxy
        .invalidate_collection_meta_cache(ts, &req.db_name, &req.collection_name)
        .await
    {
        warn!(collection = %req.collection_name, error = %e, "cache invalidation failed");
    }

    let query = ctx.query.clone();
    let shutdown = ctx.shutdown.clone();
    let coll_id = coll.id;
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = query.release_partitions(ts, 0, coll_id, vec![partition_id]) => {
                if let Err(e) = result {
                    warn!(partition_id, error = %e, "release partitions failed");
                }
            }
        }
    });

    Ok(DdlReply::Done)
}

async fn show_partitions(ctx: &DdlContext, req: ShowPartitionsRequest) -> Result<DdlReply> {
    let coll = if req.collection_name.is_empty() {
        ctx.meta.get_collection_by_id(req.collection_id).await?
    } else {
        ctx.meta.get_collection_by_name(&req.collection_name).await?
    };

    let mut names = Vec::with_capacity(coll.partition_ids.len());
    let mut ids = Vec::with_capacity(coll.partition_ids.len());
    for part_id in &coll.partition_ids {
        let part = ctx.meta.get_partition_by_id(*part_id).await?;
        names.push(part.partition_name);
        ids.push(part.partition_id);
    }
    Ok(DdlReply::Partitions { names, ids })
}

async fn create_index(ctx: &DdlContext, req: CreateIndexRequest) -> Result<DdlReply> {
    let field = ctx
        .meta
        .get_field_schema(&req.collection_name, &req.field_name)
        .await?;
    if !field.data_type.is_vector() {
        return Err(Error::InvalidDdl(format!(
            "field name = {}, data type = {:?} is not indexable",
            req.field_name, field.data_type
        )));
    }

    let index_id = ctx.id_alloc.alloc_one().await?;
    let mut idx_info = IndexInfo {
        index_name: ctx.config.default_index_name.clone(),
        index_id,
        index_params: req.extra_params.clone(),
    };
    let (segments, field) = ctx
        .meta
        .get_not_indexed_segments(&req.collection_name, &req.field_name, &mut idx_info)
        .await?;

    for seg_id in segments {
        let task = IndexBuildTask {
            segment_id: seg_id,
            index_name: idx_info.index_name.clone(),
            index_id: idx_info.index_id,
            field: field.clone(),
            index_params: req.extra_params.clone(),
            from_flush_channel: false,
        };
        if ctx.index_tx.send(task).await.is_err() {
            return Err(Error::CoreStopped);
        }
        debug!(segment_id = seg_id, "index build task enqueued");
    }
    Ok(DdlReply::Done)
}

async fn describe_index(ctx: &DdlContext, req: DescribeIndexRequest) -> Result<DdlReply> {
    let found = ctx
        .meta
        .get_indexes_by_name(&req.collection_name, &req.field_name, &req.index_name)
        .await?;
    let descriptions = found
        .into_iter()
        .map(|idx| IndexDescription {
            index_name: idx.index_name,
            index_id: idx.index_id,
            params: idx.index_params,
        })
        .collect();
    Ok(DdlReply::IndexDescriptions(descriptions))
}

async fn drop_index(ctx: &DdlContext, req: DropIndexRequest) -> Result<DdlReply> {
    let found = ctx
        .meta
        .get_indexes_by_name(&req.collection_name, &req.field_name, &req.index_name)
        .await?;
    if found.is_empty() {
        return Ok(DdlReply::Done);
    }
    if found.len() != 1 {
        return Err(Error::Internal(format!(
            "{} indexes match name {}",
            found.len(),
            req.index_name
        )));
    }

    ctx.index_service
        .drop_index(found[0].index_id)
        .await
        .map_err(|e| Error::External(format!("drop index: {e}")))?;
    ctx.meta
        .drop_index(&req.collection_name, &req.field_name, &req.index_name)
        .await?;
    Ok(DdlReply::Done)
}

async fn describe_segment(ctx: &DdlContext, req: DescribeSegmentRequest) -> Result<DdlReply> {
    let coll = ctx.meta.get_collection_by_id(req.collection_id).await?;
    let mut belongs = false;
    for part_id in &coll.partition_ids {
        let part = ctx.meta.get_partition_by_id(*part_id).await?;
        if part.segment_ids.contains(&req.segment_id) {
            belongs = true;
            break;
        }
    }
    if !belongs {
        return Err(Error::InvalidDdl(format!(
            "segment id {} does not belong to collection id {}",
            req.segment_id, req.collection_id
        )));
    }

    let info = ctx
        .meta
        .get_segment_index_info(req.segment_id, -1, "")
        .await?;
    Ok(DdlReply::SegmentDescription {
        index_id: info.index_id,
        build_id: info.build_id,
        enable_index: info.enable_index,
    })
}

async fn show_segments(ctx: &DdlContext, req: ShowSegmentsRequest) -> Result<DdlReply> {
    let coll = ctx.meta.get_collection_by_id(req.collection_id).await?;
    if !coll.partition_ids.contains(&req.partition_id) {
        return Err(Error::InvalidDdl(format!(
            "partition id = {} does not belong to collection id = {}",
            req.partition_id, req.collection_id
        )));
    }
    let part = ctx.meta.get_partition_by_id(req.partition_id).await?;
    Ok(DdlReply::SegmentIds(part.segment_ids))
}
