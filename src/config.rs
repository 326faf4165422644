//! Master configuration
//!
//! One explicit configuration struct threaded through every component
//! constructor. Channel names are plain strings so tests can isolate
//! themselves by suffixing a random value.

use std::time::Duration;

/// Configuration for the master core
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Node id stamped into emitted messages
    pub node_id: u64,
    /// Catalog key prefix for all metadata
    pub meta_root: String,
    /// Catalog key prefix for allocator counters
    pub kv_root: String,
    /// Channel the master publishes its own time ticks on
    pub time_tick_channel: String,
    /// Channel carrying ordered DDL events (and mirrored ticks)
    pub ddl_channel: String,
    /// Channel name reported for statistics consumers
    pub statistics_channel: String,
    /// Channel the proxy publishes time ticks on
    pub proxy_time_tick_channel: String,
    /// Channel carrying segment-created and flush-completed events
    pub segment_channel: String,
    /// Subscription name used for all consumer registrations
    pub subscription_name: String,
    /// Maximum partitions per collection (the implicit default included)
    pub max_partition_num: usize,
    /// Name of the partition created implicitly with every collection
    pub default_partition_name: String,
    /// Index name used when a request leaves it blank
    pub default_index_name: String,
    /// Segments below this row count get a disabled index record, no build
    pub min_segment_rows_to_enable_index: i64,
    /// Capacity budget of a growing segment, in bytes
    pub segment_size_budget: u64,
    /// Fraction of the budget at which a segment seals
    pub segment_fill_factor: f64,
    /// Fallback per-row size estimate when the schema gives no better one
    pub average_record_size: u64,
    /// Idle lifetime of a growing segment before TTL sealing, in timestamp time
    pub segment_ttl: Duration,
    /// Bound of the DDL scheduler queue
    pub ddl_queue_size: usize,
    /// Bound of the index-build task queue
    pub index_queue_size: usize,
    /// Interval of the allocator window refill loop
    pub allocator_update_interval: Duration,
    /// Upper bound on waiting for a scheduled task to finish
    pub rpc_timeout: Duration,
    /// Local retries for each index-build step
    pub index_build_retries: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            meta_root: "master-service".to_string(),
            kv_root: "master-kv".to_string(),
            time_tick_channel: "master-time-tick".to_string(),
            ddl_channel: "master-ddl".to_string(),
            statistics_channel: "master-statistics".to_string(),
            proxy_time_tick_channel: "proxy-time-tick".to_string(),
            segment_channel: "data-segment-info".to_string(),
            subscription_name: "master-sub".to_string(),
            max_partition_num: 4096,
            default_partition_name: "_default".to_string(),
            default_index_name: "_default_idx".to_string(),
            min_segment_rows_to_enable_index: 1024,
            segment_size_budget: 512 * 1024 * 1024,
            segment_fill_factor: 0.75,
            average_record_size: 1024,
            segment_ttl: Duration::from_secs(2),
            ddl_queue_size: 1024,
            index_queue_size: 1024,
            allocator_update_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(10),
            index_build_retries: 3,
        }
    }
}
