//! Error types for lodestar

/// Result type alias for lodestar operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for lodestar
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Catalog store rejected the operation; the in-memory view must reload
    #[error("store error: {0}")]
    Store(String),
    /// Catalog store temporarily unreachable (retryable)
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Collection lookup by name failed
    #[error("collection {0} not found")]
    CollectionNotFound(String),
    /// Collection lookup by id failed
    #[error("collection id {0} not found")]
    CollectionIdNotFound(i64),
    /// Collection name collision
    #[error("collection {0} already exists")]
    CollectionExists(String),
    /// Partition lookup by name failed
    #[error("partition {0} not found")]
    PartitionNotFound(String),
    /// Partition lookup by id failed
    #[error("partition id {0} not found")]
    PartitionIdNotFound(i64),
    /// Segment lookup failed
    #[error("segment {0} not found")]
    SegmentNotFound(i64),
    /// Field lookup failed
    #[error("field {0} not found")]
    FieldNotFound(String),
    /// Index lookup failed
    #[error("index {0} not found")]
    IndexNotFound(String),
    /// Semantic DDL validation failure
    #[error("invalid ddl: {0}")]
    InvalidDdl(String),
    /// A DDL timestamp did not advance past the last materialized one
    #[error("input timestamp = {input}, last dd time stamp = {last}")]
    TimestampRegression { input: u64, last: u64 },
    /// The master's root context was cancelled
    #[error("core context done")]
    CoreStopped,
    /// The caller's request context was cancelled
    #[error("request context done")]
    RequestCancelled,
    /// Operation timed out
    #[error("operation timed out")]
    Timeout,
    /// Downstream service call failed
    #[error("downstream error: {0}")]
    External(String),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
