//! Public RPC surface types
//!
//! Request and response shapes for every externally visible master method.
//! Every response carries a `Status` envelope with a closed error-code enum;
//! failures surface as `UnexpectedError` plus a human-readable reason rather
//! than a dropped connection.

use crate::meta::{CollectionSchema, KeyValue};
use crate::{Error, Timestamp, UniqueId};
use std::fmt;

/// Closed set of wire-visible error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    UnexpectedError,
    CollectionNotExist,
    IndexNotExist,
}

/// Response envelope
#[derive(Debug, Clone)]
pub struct Status {
    pub error_code: ErrorCode,
    pub reason: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            error_code: ErrorCode::Success,
            reason: String::new(),
        }
    }

    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self {
            error_code: ErrorCode::UnexpectedError,
            reason: reason.into(),
        }
    }

    pub fn index_not_exist(reason: impl Into<String>) -> Self {
        Self {
            error_code: ErrorCode::IndexNotExist,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == ErrorCode::Success
    }

    /// Shape an internal error into its wire status
    pub fn from_error(context: &str, err: &Error) -> Self {
        let code = match err {
            Error::CollectionNotFound(_) | Error::CollectionIdNotFound(_) => {
                ErrorCode::CollectionNotExist
            }
            Error::IndexNotFound(_) => ErrorCode::IndexNotExist,
            _ => ErrorCode::UnexpectedError,
        };
        Self {
            error_code: code,
            reason: format!("{context}: {err}"),
        }
    }
}

/// Component lifecycle states reported by `get_component_states`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCode {
    Initializing,
    Healthy,
    Abnormal,
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateCode::Initializing => "Initializing",
            StateCode::Healthy => "Healthy",
            StateCode::Abnormal => "Abnormal",
        };
        f.write_str(name)
    }
}

/// Common request header
#[derive(Debug, Clone, Default)]
pub struct MsgBase {
    pub msg_id: i64,
    pub timestamp: Timestamp,
    pub source_id: i64,
}

#[derive(Debug, Clone)]
pub struct CreateCollectionRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub schema: CollectionSchema,
}

#[derive(Debug, Clone)]
pub struct DropCollectionRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
}

#[derive(Debug, Clone)]
pub struct HasCollectionRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
}

#[derive(Debug, Clone)]
pub struct DescribeCollectionRequest {
    pub base: MsgBase,
    pub db_name: String,
    /// Lookup by name when non-empty, by `collection_id` otherwise
    pub collection_name: String,
    pub collection_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct ShowCollectionsRequest {
    pub base: MsgBase,
    pub db_name: String,
}

#[derive(Debug, Clone)]
pub struct CreatePartitionRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub partition_name: String,
}

#[derive(Debug, Clone)]
pub struct DropPartitionRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub partition_name: String,
}

#[derive(Debug, Clone)]
pub struct HasPartitionRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub partition_name: String,
}

#[derive(Debug, Clone)]
pub struct ShowPartitionsRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub collection_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct CreateIndexRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub field_name: String,
    pub extra_params: Vec<KeyValue>,
}

#[derive(Debug, Clone)]
pub struct DescribeIndexRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub field_name: String,
    /// Empty matches every index on the field
    pub index_name: String,
}

#[derive(Debug, Clone)]
pub struct DropIndexRequest {
    pub base: MsgBase,
    pub db_name: String,
    pub collection_name: String,
    pub field_name: String,
    pub index_name: String,
}

#[derive(Debug, Clone)]
pub struct DescribeSegmentRequest {
    pub base: MsgBase,
    pub collection_id: UniqueId,
    pub segment_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct ShowSegmentsRequest {
    pub base: MsgBase,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct BoolResponse {
    pub status: Status,
    pub value: bool,
}

#[derive(Debug, Clone)]
pub struct StringResponse {
    pub status: Status,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct DescribeCollectionResponse {
    pub status: Status,
    pub schema: Option<CollectionSchema>,
    pub collection_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct ShowCollectionsResponse {
    pub status: Status,
    pub collection_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ShowPartitionsResponse {
    pub status: Status,
    pub partition_names: Vec<String>,
    pub partition_ids: Vec<UniqueId>,
}

#[derive(Debug, Clone)]
pub struct IndexDescription {
    pub index_name: String,
    pub index_id: UniqueId,
    pub params: Vec<KeyValue>,
}

#[derive(Debug, Clone)]
pub struct DescribeIndexResponse {
    pub status: Status,
    pub index_descriptions: Vec<IndexDescription>,
}

#[derive(Debug, Clone)]
pub struct DescribeSegmentResponse {
    pub status: Status,
    pub index_id: UniqueId,
    pub build_id: UniqueId,
    pub enable_index: bool,
}

#[derive(Debug, Clone)]
pub struct ShowSegmentsResponse {
    pub status: Status,
    pub segment_ids: Vec<UniqueId>,
}

#[derive(Debug, Clone)]
pub struct AllocTimestampResponse {
    pub status: Status,
    pub timestamp: Timestamp,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct AllocIdResponse {
    pub status: Status,
    pub id: UniqueId,
    pub count: u32,
}

/// One component's identity and state
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub node_id: u64,
    pub role: String,
    pub state_code: StateCode,
}

#[derive(Debug, Clone)]
pub struct ComponentStates {
    pub state: ComponentInfo,
    pub subcomponent_states: Vec<ComponentInfo>,
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let status = Status::from_error("lookup", &Error::CollectionNotFound("x".to_string()));
        assert_eq!(status.error_code, ErrorCode::CollectionNotExist);

        let status = Status::from_error("lookup", &Error::IndexNotFound("x".to_string()));
        assert_eq!(status.error_code, ErrorCode::IndexNotExist);

        let status = Status::from_error(
            "gate",
            &Error::TimestampRegression { input: 1, last: 2 },
        );
        assert_eq!(status.error_code, ErrorCode::UnexpectedError);
        assert!(status
            .reason
            .contains("input timestamp = 1, last dd time stamp = 2"));
    }
}
