//! Typed interfaces to external services
//!
//! The master is a client of the data service, the index builder, the query
//! service, and the proxies. Each dependency is a narrow async trait so the
//! dependency graph stays explicit and test doubles are one impl block.

use crate::meta::{KeyValue, SegmentInfo};
use crate::{Result, Timestamp, UniqueId};
use async_trait::async_trait;

/// Binlog paths persisted for one field of a segment
#[derive(Debug, Clone)]
pub struct FieldBinlogPaths {
    pub field_id: i64,
    pub paths: Vec<String>,
}

/// State of an index build reported by the index service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBuildState {
    Unissued,
    InProgress,
    Finished,
    Failed,
}

/// Per-build state row from `get_index_states`
#[derive(Debug, Clone)]
pub struct IndexStateInfo {
    pub build_id: UniqueId,
    pub state: IndexBuildState,
    pub reason: String,
}

/// Client view of the data-service cluster
#[async_trait]
pub trait DataService: Send + Sync {
    /// Binlog paths for every field of a persisted segment
    async fn get_insert_binlog_paths(&self, segment_id: UniqueId) -> Result<Vec<FieldBinlogPaths>>;

    /// Current data-service view of the given segments
    async fn get_segment_info(&self, segment_ids: Vec<UniqueId>) -> Result<Vec<SegmentInfo>>;

    /// Insert channels serving a collection
    async fn get_insert_channels(&self, collection_id: UniqueId) -> Result<Vec<String>>;

    /// Row-count style statistics for a collection
    async fn get_collection_statistics(&self, collection_id: UniqueId) -> Result<Vec<KeyValue>>;

    /// Ask the data nodes to persist the given sealed segments
    async fn flush(&self, collection_id: UniqueId, segment_ids: Vec<UniqueId>) -> Result<()>;

    /// Name of the channel carrying segment lifecycle events
    async fn get_segment_info_channel(&self) -> Result<String>;
}

/// Client view of the index-builder service
#[async_trait]
pub trait IndexService: Send + Sync {
    /// Kick off an index build over the given binlog files; returns the
    /// opaque build id
    async fn build_index(
        &self,
        data_paths: Vec<String>,
        type_params: Vec<KeyValue>,
        index_params: Vec<KeyValue>,
        index_id: UniqueId,
        index_name: String,
    ) -> Result<UniqueId>;

    /// Drop every build belonging to an index id
    async fn drop_index(&self, index_id: UniqueId) -> Result<()>;

    /// Build states for the given build ids
    async fn get_index_states(&self, build_ids: Vec<UniqueId>) -> Result<Vec<IndexStateInfo>>;
}

/// Client view of the query service
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn release_collection(&self, ts: Timestamp, db_id: UniqueId, collection_id: UniqueId)
        -> Result<()>;

    async fn release_partitions(
        &self,
        ts: Timestamp,
        db_id: UniqueId,
        collection_id: UniqueId,
        partition_ids: Vec<UniqueId>,
    ) -> Result<()>;

    async fn load_collection(&self, ts: Timestamp, db_id: UniqueId, collection_id: UniqueId)
        -> Result<()>;

    async fn load_partitions(
        &self,
        ts: Timestamp,
        db_id: UniqueId,
        collection_id: UniqueId,
        partition_ids: Vec<UniqueId>,
    ) -> Result<()>;
}

/// Client view of the proxy fleet
#[async_trait]
pub trait ProxyService: Send + Sync {
    /// Tell proxies to forget cached metadata for a collection
    async fn invalidate_collection_meta_cache(
        &self,
        ts: Timestamp,
        db_name: &str,
        collection_name: &str,
    ) -> Result<()>;
}
