//! Hybrid-logical timestamp oracle
//!
//! Timestamps pack physical milliseconds into the upper bits and an 18-bit
//! logical counter into the lower bits, so ordering survives bursts of
//! allocations inside one millisecond.

use super::id::load_counter;
use crate::kv::KvStore;
use crate::{Result, Timestamp};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Width of the logical counter
const LOGICAL_BITS: u32 = 18;

/// How far ahead of the wall clock each reservation reaches, in ms
const TSO_RESERVE_AHEAD_MS: i64 = 3_000;

/// Compose a hybrid timestamp from physical milliseconds and a logical count
pub fn compose_ts(physical_ms: i64, logical: u64) -> Timestamp {
    ((physical_ms as u64) << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1))
}

/// Physical millisecond component of a hybrid timestamp
pub fn physical_ms(ts: Timestamp) -> i64 {
    (ts >> LOGICAL_BITS) as i64
}

/// Logical counter component of a hybrid timestamp
pub fn logical_part(ts: Timestamp) -> u64 {
    ts & ((1 << LOGICAL_BITS) - 1)
}

#[derive(Debug)]
struct TsWindow {
    next: Timestamp,
    limit: Timestamp,
}

/// Monotone hybrid-logical timestamp allocator backed by the catalog store
///
/// The persisted counter is the exclusive upper bound of every timestamp
/// this oracle may ever have handed out, so a restarted oracle can never
/// repeat or regress.
pub struct TimestampOracle {
    kv: Arc<dyn KvStore>,
    key: String,
    window: Mutex<TsWindow>,
}

impl TimestampOracle {
    /// Open the oracle, resuming above whatever was last reserved
    pub async fn new(kv: Arc<dyn KvStore>, kv_root: &str) -> Result<Self> {
        let key = format!("{kv_root}/tso");
        let saved = load_counter(kv.as_ref(), &key).await? as Timestamp;
        Ok(Self {
            kv,
            key,
            window: Mutex::new(TsWindow {
                next: saved,
                limit: saved,
            }),
        })
    }

    /// Allocate `count` consecutive timestamps, returning the first
    pub async fn alloc(&self, count: u32) -> Result<Timestamp> {
        let count = u64::from(count);
        let mut window = self.window.lock().await;
        let wall = compose_ts(Utc::now().timestamp_millis(), 0);
        if wall > window.next {
            window.next = wall;
        }
        if window.next + count > window.limit {
            let reserved = reserve_target(window.next + count);
            self.kv.put(&self.key, &reserved.to_string()).await?;
            debug!(limit = reserved, "reserved timestamp window");
            window.limit = reserved;
        }
        let start = window.next;
        window.next += count;
        Ok(start)
    }

    /// Allocate a single timestamp
    pub async fn alloc_one(&self) -> Result<Timestamp> {
        self.alloc(1).await
    }

    /// Keep the persisted window ahead of the wall clock
    pub async fn update(&self) -> Result<()> {
        let mut window = self.window.lock().await;
        let target = reserve_target(compose_ts(Utc::now().timestamp_millis(), 0));
        if target > window.limit {
            self.kv.put(&self.key, &target.to_string()).await?;
            window.limit = target;
        }
        Ok(())
    }
}

fn reserve_target(at_least: Timestamp) -> Timestamp {
    let ahead = compose_ts(Utc::now().timestamp_millis() + TSO_RESERVE_AHEAD_MS, 0);
    ahead.max(at_least)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn test_compose_round_trip() {
        let ts = compose_ts(1_234_567, 42);
        assert_eq!(physical_ms(ts), 1_234_567);
        assert_eq!(logical_part(ts), 42);
    }

    #[tokio::test]
    async fn test_strictly_increasing() {
        let kv = Arc::new(MemoryKv::new());
        let oracle = TimestampOracle::new(kv, "kv").await.unwrap();

        let mut prev = 0;
        for _ in 0..1000 {
            let ts = oracle.alloc_one().await.unwrap();
            assert!(ts > prev, "timestamps must be strictly increasing");
            prev = ts;
        }
    }

    #[tokio::test]
    async fn test_block_is_consecutive() {
        let kv = Arc::new(MemoryKv::new());
        let oracle = TimestampOracle::new(kv, "kv").await.unwrap();

        let first = oracle.alloc(4).await.unwrap();
        let next = oracle.alloc_one().await.unwrap();
        assert!(next >= first + 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_are_unique() {
        use std::collections::HashSet;
        use tokio::task::JoinSet;

        let kv = Arc::new(MemoryKv::new());
        let oracle = Arc::new(TimestampOracle::new(kv, "kv").await.unwrap());

        let mut tasks = JoinSet::new();
        for _ in 0..4 {
            let oracle = oracle.clone();
            tasks.spawn(async move {
                let mut got = Vec::with_capacity(250);
                for _ in 0..250 {
                    got.push(oracle.alloc_one().await.unwrap());
                }
                got
            });
        }

        let mut all = HashSet::new();
        while let Some(result) = tasks.join_next().await {
            for ts in result.unwrap() {
                assert!(all.insert(ts), "timestamp {ts} handed out twice");
            }
        }
        assert_eq!(all.len(), 1000);
    }

    #[tokio::test]
    async fn test_restart_never_regresses() {
        let kv = Arc::new(MemoryKv::new());
        let first = TimestampOracle::new(kv.clone(), "kv").await.unwrap();
        let handed_out = first.alloc(8).await.unwrap() + 7;
        drop(first);

        let second = TimestampOracle::new(kv, "kv").await.unwrap();
        let ts = second.alloc_one().await.unwrap();
        assert!(ts > handed_out);
    }
}
