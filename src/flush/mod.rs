//! Flush and index pipeline
//!
//! Two coupled flows drive a sealed segment to durability and onward to an
//! index build. On every proxy time tick the pipeline collects sealed
//! segments whose reservations ran out and hands them to the data service
//! for persistence; when a data node reports a completed flush the segment
//! is promoted to Flushed and a build task is scheduled for every index
//! binding on the owning collection.

use crate::config::MasterConfig;
use crate::meta::{
    field_schema_by_id, FieldSchema, KeyValue, MetaTable, SegmentIndexInfo, SegmentState,
};
use crate::segment::SegmentAllocator;
use crate::services::{DataService, IndexService};
use crate::{Error, Result, Timestamp, UniqueId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Base delay of the bounded retry backoff
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// One segment's pending index build
#[derive(Debug, Clone)]
pub(crate) struct IndexBuildTask {
    pub segment_id: UniqueId,
    pub index_name: String,
    pub index_id: UniqueId,
    pub field: FieldSchema,
    pub index_params: Vec<KeyValue>,
    /// True when triggered by a flush-completed event rather than CreateIndex
    pub from_flush_channel: bool,
}

/// Executes index builds against the index service
pub(crate) struct IndexBuilder {
    meta: Arc<MetaTable>,
    data: Arc<dyn DataService>,
    index: Arc<dyn IndexService>,
    min_rows: i64,
    retries: usize,
}

impl IndexBuilder {
    pub fn new(
        config: &MasterConfig,
        meta: Arc<MetaTable>,
        data: Arc<dyn DataService>,
        index: Arc<dyn IndexService>,
    ) -> Self {
        Self {
            meta,
            data,
            index,
            min_rows: config.min_segment_rows_to_enable_index,
            retries: config.index_build_retries.max(1),
        }
    }

    /// Run one build task to completion
    ///
    /// Already-satisfied tasks return immediately; segments below the row
    /// threshold record a disabled index row and skip the builder call.
    pub async fn build(&self, task: &IndexBuildTask) -> Result<()> {
        if self
            .meta
            .is_segment_indexed(task.segment_id, &task.field, &task.index_params)
            .await
        {
            return Ok(());
        }

        let rows = self.num_rows(task).await?;
        let (build_id, enable_index) = if rows < self.min_rows {
            debug!(
                segment_id = task.segment_id,
                rows, "row count below index threshold"
            );
            (0, false)
        } else {
            let paths = self.field_binlog_paths(task).await?;
            let build_id = self.dispatch_build(task, paths).await?;
            (build_id, true)
        };

        self.meta
            .add_segment_index(SegmentIndexInfo {
                segment_id: task.segment_id,
                field_id: task.field.field_id,
                index_id: task.index_id,
                build_id,
                enable_index,
            })
            .await
    }

    async fn num_rows(&self, task: &IndexBuildTask) -> Result<i64> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        let infos = loop {
            match self.data.get_segment_info(vec![task.segment_id]).await {
                Ok(infos) => break infos,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retries {
                        return Err(e);
                    }
                    warn!(segment_id = task.segment_id, error = %e, "get segment info failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        };

        if infos.len() != 1 {
            debug!(segment_id = task.segment_id, "segment info empty");
            return Ok(0);
        }
        if !task.from_flush_channel && infos[0].state != SegmentState::Flushed {
            debug!(segment_id = task.segment_id, "segment not flushed yet");
            return Ok(0);
        }
        Ok(infos[0].num_rows)
    }

    async fn field_binlog_paths(&self, task: &IndexBuildTask) -> Result<Vec<String>> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        let per_field = loop {
            match self.data.get_insert_binlog_paths(task.segment_id).await {
                Ok(paths) => break paths,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retries {
                        return Err(e);
                    }
                    warn!(segment_id = task.segment_id, error = %e, "get binlog paths failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        };

        per_field
            .into_iter()
            .find(|f| f.field_id == task.field.field_id)
            .map(|f| f.paths)
            .ok_or_else(|| {
                Error::External(format!(
                    "binlog files missing, segment id = {}, field id = {}",
                    task.segment_id, task.field.field_id
                ))
            })
    }

    async fn dispatch_build(&self, task: &IndexBuildTask, paths: Vec<String>) -> Result<UniqueId> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match self
                .index
                .build_index(
                    paths.clone(),
                    task.field.type_params.clone(),
                    task.index_params.clone(),
                    task.index_id,
                    task.index_name.clone(),
                )
                .await
            {
                Ok(build_id) => return Ok(build_id),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retries {
                        return Err(e);
                    }
                    warn!(segment_id = task.segment_id, error = %e, "build index failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

/// Drives sealed segments into flush and flushed segments into index builds
pub(crate) struct FlushPipeline {
    meta: Arc<MetaTable>,
    seg_alloc: Arc<SegmentAllocator>,
    data: Arc<dyn DataService>,
    index_tx: mpsc::Sender<IndexBuildTask>,
}

impl FlushPipeline {
    pub fn new(
        meta: Arc<MetaTable>,
        seg_alloc: Arc<SegmentAllocator>,
        data: Arc<dyn DataService>,
        index_tx: mpsc::Sender<IndexBuildTask>,
    ) -> Self {
        Self {
            meta,
            seg_alloc,
            data,
            index_tx,
        }
    }

    /// Seal-and-flush step, run on every proxy time tick
    pub async fn on_time_tick(&self, ts: Timestamp) {
        self.seg_alloc.expire_allocations(ts).await;

        let mut by_collection: HashMap<UniqueId, Vec<UniqueId>> = HashMap::new();
        for sealed in self.seg_alloc.sealed_segments().await {
            if self
                .seg_alloc
                .is_allocations_expired(sealed.segment_id, ts)
                .await
            {
                by_collection
                    .entry(sealed.collection_id)
                    .or_default()
                    .push(sealed.segment_id);
            }
        }

        for (collection_id, segment_ids) in by_collection {
            self.meta.mark_segments_sealed(&segment_ids).await;
            match self.data.flush(collection_id, segment_ids.clone()).await {
                Ok(()) => {
                    debug!(collection_id, ?segment_ids, "flush dispatched");
                    for seg_id in segment_ids {
                        self.seg_alloc.drop_segment(seg_id).await;
                    }
                }
                // keep the segments; the next tick retries
                Err(e) => warn!(collection_id, error = %e, "flush dispatch failed"),
            }
        }
    }

    /// Flush-completion step: promote the segment and fan index builds out
    pub async fn on_flush_completed(&self, seg_id: UniqueId) -> Result<()> {
        let coll = self.meta.get_collection_by_segment_id(seg_id).await?;
        self.meta.add_flushed_segment(seg_id).await?;

        for binding in &coll.field_indexes {
            let idx = match self.meta.get_index_by_id(binding.index_id).await {
                Ok(idx) => idx,
                Err(_) => {
                    warn!(index_id = binding.index_id, "index binding has no meta");
                    continue;
                }
            };
            let Some(field) = field_schema_by_id(&coll, binding.field_id) else {
                warn!(field_id = binding.field_id, "field not found in schema");
                continue;
            };
            let task = IndexBuildTask {
                segment_id: seg_id,
                index_name: idx.index_name,
                index_id: idx.index_id,
                field: field.clone(),
                index_params: idx.index_params,
                from_flush_channel: true,
            };
            if self.index_tx.send(task).await.is_err() {
                warn!("index task queue closed");
                break;
            }
        }
        Ok(())
    }
}
