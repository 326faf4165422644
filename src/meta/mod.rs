//! Catalog entities
//!
//! The relational view the master coordinates: collections with typed
//! schemas, partitions, segments, index definitions, and the per-segment
//! index realizations. All entities are serde-encoded for the catalog store.

mod table;

pub use table::MetaTable;

use crate::{Timestamp, UniqueId};
use serde::{Deserialize, Serialize};

/// Field id of the system-managed row id column
pub const ROW_ID_FIELD_ID: i64 = 0;
/// Field id of the system-managed timestamp column
pub const TIMESTAMP_FIELD_ID: i64 = 1;
/// First field id available to user-declared fields
pub const START_OF_USER_FIELD_ID: i64 = 100;

/// Name of the system-managed row id column
pub const ROW_ID_FIELD_NAME: &str = "row_id";
/// Name of the system-managed timestamp column
pub const TIMESTAMP_FIELD_NAME: &str = "timestamp";

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    String,
    FloatVector,
    BinaryVector,
}

impl DataType {
    /// True for vector-typed columns, the only indexable kind
    pub fn is_vector(&self) -> bool {
        matches!(self, DataType::FloatVector | DataType::BinaryVector)
    }
}

/// A string key-value parameter, used for type and index parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Compare two parameter lists as unordered key/value sets
pub fn params_equal(a: &[KeyValue], b: &[KeyValue]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|pair| {
        b.iter()
            .any(|other| other.key == pair.key && other.value == pair.value)
    })
}

/// A typed column of a collection schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field_id: i64,
    pub name: String,
    pub is_primary_key: bool,
    pub description: String,
    pub data_type: DataType,
    pub type_params: Vec<KeyValue>,
    pub index_params: Vec<KeyValue>,
}

/// Ordered schema of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub description: String,
    pub auto_id: bool,
    pub fields: Vec<FieldSchema>,
}

/// Binding of a field to an index definition, stored on the collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub field_id: i64,
    pub index_id: UniqueId,
}

/// Catalog record of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: UniqueId,
    pub schema: CollectionSchema,
    pub create_time: Timestamp,
    pub partition_ids: Vec<UniqueId>,
    pub field_indexes: Vec<FieldIndex>,
}

/// Catalog record of a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_name: String,
    pub partition_id: UniqueId,
    pub segment_ids: Vec<UniqueId>,
}

/// Segment lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Accepting row allocations
    Growing,
    /// Write-closed, waiting for the data nodes to persist
    Sealed,
    /// Durably persisted as binlog files
    Flushed,
}

/// Position in a message stream, recorded on segment boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub channel: String,
    pub offset: u64,
    pub timestamp: Timestamp,
}

/// A unit of physical storage within a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: UniqueId,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub insert_channel: String,
    pub state: SegmentState,
    pub num_rows: i64,
    pub mem_size: u64,
    pub open_time: Timestamp,
    pub sealed_time: Timestamp,
    pub flushed_time: Timestamp,
    pub start_position: Option<StreamPosition>,
    pub end_position: Option<StreamPosition>,
}

impl SegmentInfo {
    /// A freshly opened growing segment
    pub fn growing(
        id: UniqueId,
        collection_id: UniqueId,
        partition_id: UniqueId,
        insert_channel: impl Into<String>,
        open_time: Timestamp,
    ) -> Self {
        Self {
            id,
            collection_id,
            partition_id,
            insert_channel: insert_channel.into(),
            state: SegmentState::Growing,
            num_rows: 0,
            mem_size: 0,
            open_time,
            sealed_time: 0,
            flushed_time: 0,
            start_position: None,
            end_position: None,
        }
    }
}

/// A named index parameter set, not yet bound to any segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub index_name: String,
    pub index_id: UniqueId,
    pub index_params: Vec<KeyValue>,
}

/// Realization of an index on one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentIndexInfo {
    pub segment_id: UniqueId,
    pub field_id: i64,
    pub index_id: UniqueId,
    pub build_id: UniqueId,
    pub enable_index: bool,
}

/// Tenant registration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantMeta {
    pub id: UniqueId,
    pub num_query_nodes: i64,
    pub insert_channels: Vec<String>,
    pub query_channel: String,
}

/// Proxy registration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyMeta {
    pub id: UniqueId,
    pub address: String,
    pub result_channels: Vec<String>,
}

/// Look a field up by id in a collection schema
pub fn field_schema_by_id(coll: &CollectionInfo, field_id: i64) -> Option<&FieldSchema> {
    coll.schema.fields.iter().find(|f| f.field_id == field_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_equal_ignores_order() {
        let a = vec![KeyValue::new("m", "16"), KeyValue::new("ef", "200")];
        let b = vec![KeyValue::new("ef", "200"), KeyValue::new("m", "16")];
        assert!(params_equal(&a, &b));
    }

    #[test]
    fn test_params_equal_detects_differences() {
        let a = vec![KeyValue::new("m", "16")];
        let b = vec![KeyValue::new("m", "32")];
        assert!(!params_equal(&a, &b));
        assert!(!params_equal(&a, &[]));
    }

    #[test]
    fn test_vector_types() {
        assert!(DataType::FloatVector.is_vector());
        assert!(DataType::BinaryVector.is_vector());
        assert!(!DataType::Int64.is_vector());
    }
}
