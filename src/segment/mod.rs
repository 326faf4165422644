//! Growing-segment assignment
//!
//! Owns the Growing to Sealed transition. Row allocations are reservations
//! against a per-segment capacity budget with an expiration timestamp; a
//! segment seals when its capacity is exhausted, when its reservations age
//! out against the proxy time-tick stream, or when the owning collection is
//! explicitly flushed. At most one growing segment exists per
//! (collection, partition, channel) triple.

use crate::allocator::{compose_ts, GlobalIdAllocator, TimestampOracle};
use crate::config::MasterConfig;
use crate::meta::{MetaTable, SegmentInfo};
use crate::{Result, Timestamp, UniqueId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct RowAllocation {
    rows: i64,
    expire_ts: Timestamp,
}

/// Allocator-side record of one growing or sealed segment
#[derive(Debug, Clone)]
pub struct SegmentStatus {
    pub segment_id: UniqueId,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub insert_channel: String,
    pub total_rows: i64,
    pub sealed: bool,
    allocations: Vec<RowAllocation>,
    last_expire_ts: Timestamp,
}

/// Identity of a sealed segment handed to the flush pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedSegment {
    pub segment_id: UniqueId,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
}

#[derive(Debug, Default)]
struct AllocatorInner {
    segments: HashMap<UniqueId, SegmentStatus>,
    by_triple: HashMap<(UniqueId, UniqueId, String), UniqueId>,
}

/// Per-(collection, partition, channel) growing-segment assignment
pub struct SegmentAllocator {
    meta: Arc<MetaTable>,
    id_alloc: Arc<GlobalIdAllocator>,
    tso: Arc<TimestampOracle>,
    max_rows_per_segment: i64,
    ttl_shift: Timestamp,
    inner: Mutex<AllocatorInner>,
}

impl SegmentAllocator {
    pub fn new(
        config: &MasterConfig,
        meta: Arc<MetaTable>,
        id_alloc: Arc<GlobalIdAllocator>,
        tso: Arc<TimestampOracle>,
    ) -> Self {
        let budget = config.segment_size_budget as f64 * config.segment_fill_factor;
        let max_rows = (budget / config.average_record_size as f64).max(1.0) as i64;
        Self {
            meta,
            id_alloc,
            tso,
            max_rows_per_segment: max_rows,
            ttl_shift: compose_ts(config.segment_ttl.as_millis() as i64, 0),
            inner: Mutex::new(AllocatorInner::default()),
        }
    }

    /// Register a segment that was created elsewhere, in Growing state
    pub async fn open_segment(&self, info: &SegmentInfo) {
        let mut inner = self.inner.lock().await;
        if inner.segments.contains_key(&info.id) {
            return;
        }
        let triple = (
            info.collection_id,
            info.partition_id,
            info.insert_channel.clone(),
        );
        match inner.by_triple.get(&triple) {
            Some(existing) => {
                warn!(
                    segment_id = info.id,
                    existing = existing,
                    "second growing segment announced for an occupied channel"
                );
            }
            None => {
                inner.by_triple.insert(triple, info.id);
            }
        }
        inner.segments.insert(
            info.id,
            SegmentStatus {
                segment_id: info.id,
                collection_id: info.collection_id,
                partition_id: info.partition_id,
                insert_channel: info.insert_channel.clone(),
                total_rows: info.num_rows,
                sealed: false,
                allocations: Vec::new(),
                last_expire_ts: info.open_time + self.ttl_shift,
            },
        );
    }

    /// Reserve room for `count` rows on the triple's growing segment,
    /// opening a new segment when none can take them
    ///
    /// Returns (segment id, granted row count, reservation expiry).
    pub async fn alloc_rows(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
        channel: &str,
        count: i64,
    ) -> Result<(UniqueId, i64, Timestamp)> {
        let now = self.tso.alloc_one().await?;
        let expire_ts = now + self.ttl_shift;
        let mut inner = self.inner.lock().await;
        let triple = (collection_id, partition_id, channel.to_string());

        let AllocatorInner {
            segments,
            by_triple,
        } = &mut *inner;
        if let Some(&seg_id) = by_triple.get(&triple) {
            let status = segments
                .get_mut(&seg_id)
                .expect("triple index points at a live status");
            if status.total_rows + count <= self.max_rows_per_segment {
                status.total_rows += count;
                status.allocations.push(RowAllocation {
                    rows: count,
                    expire_ts,
                });
                status.last_expire_ts = expire_ts;
                if status.total_rows >= self.max_rows_per_segment {
                    status.sealed = true;
                    by_triple.remove(&triple);
                }
                return Ok((seg_id, count, expire_ts));
            }
            // capacity policy fires: close the segment and open a new one
            debug!(segment_id = seg_id, rows = status.total_rows, "sealing full segment");
            status.sealed = true;
            by_triple.remove(&triple);
        }

        let seg_id = self.id_alloc.alloc_one().await?;
        let open_time = self.tso.alloc_one().await?;
        let info = SegmentInfo::growing(seg_id, collection_id, partition_id, channel, open_time);
        self.meta.add_segment(&info).await?;

        let mut status = SegmentStatus {
            segment_id: seg_id,
            collection_id,
            partition_id,
            insert_channel: channel.to_string(),
            total_rows: count,
            sealed: false,
            allocations: vec![RowAllocation {
                rows: count,
                expire_ts,
            }],
            last_expire_ts: expire_ts,
        };
        if status.total_rows >= self.max_rows_per_segment {
            status.sealed = true;
        } else {
            inner.by_triple.insert(triple, seg_id);
        }
        inner.segments.insert(seg_id, status);
        Ok((seg_id, count, expire_ts))
    }

    /// Release reservations whose expiry is at or before `ts`, sealing
    /// growing segments whose lifetime ran out without fresh allocations
    pub async fn expire_allocations(&self, ts: Timestamp) {
        let mut inner = self.inner.lock().await;
        let mut freed = Vec::new();
        for status in inner.segments.values_mut() {
            status.allocations.retain(|alloc| alloc.expire_ts > ts);
            if !status.sealed
                && status.allocations.is_empty()
                && status.last_expire_ts <= ts
            {
                debug!(segment_id = status.segment_id, "sealing idle segment");
                status.sealed = true;
                freed.push((
                    status.collection_id,
                    status.partition_id,
                    status.insert_channel.clone(),
                ));
            }
        }
        for triple in freed {
            inner.by_triple.remove(&triple);
        }
    }

    /// True when the segment holds no live reservation and its latest
    /// reservation expired at or before `ts`
    pub async fn is_allocations_expired(&self, seg_id: UniqueId, ts: Timestamp) -> bool {
        let inner = self.inner.lock().await;
        match inner.segments.get(&seg_id) {
            Some(status) => status.allocations.is_empty() && status.last_expire_ts <= ts,
            None => false,
        }
    }

    /// Every segment currently in Sealed state
    pub async fn sealed_segments(&self) -> Vec<SealedSegment> {
        let inner = self.inner.lock().await;
        inner
            .segments
            .values()
            .filter(|status| status.sealed)
            .map(|status| SealedSegment {
                segment_id: status.segment_id,
                collection_id: status.collection_id,
                partition_id: status.partition_id,
            })
            .collect()
    }

    /// Seal every growing segment of a collection (explicit flush)
    pub async fn seal_collection(&self, collection_id: UniqueId) {
        let mut inner = self.inner.lock().await;
        let mut freed = Vec::new();
        for status in inner.segments.values_mut() {
            if status.collection_id == collection_id && !status.sealed {
                status.sealed = true;
                freed.push((
                    status.collection_id,
                    status.partition_id,
                    status.insert_channel.clone(),
                ));
            }
        }
        for triple in freed {
            inner.by_triple.remove(&triple);
        }
    }

    /// Forget a segment once the flush pipeline has taken it over
    pub async fn drop_segment(&self, seg_id: UniqueId) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.segments.remove(&seg_id) {
            let triple = (
                status.collection_id,
                status.partition_id,
                status.insert_channel,
            );
            if inner.by_triple.get(&triple) == Some(&seg_id) {
                inner.by_triple.remove(&triple);
            }
        }
    }

    /// Allocator view of one segment, if it still tracks it
    pub async fn segment_status(&self, seg_id: UniqueId) -> Option<SegmentStatus> {
        self.inner.lock().await.segments.get(&seg_id).cloned()
    }
}
