//! Block-reserving unique id allocator

use crate::kv::KvStore;
use crate::{Error, Result, UniqueId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Ids reserved per catalog round trip
const ID_RESERVE_STEP: i64 = 10_000;

#[derive(Debug)]
struct IdWindow {
    next: i64,
    limit: i64,
}

/// Monotone unique id allocator backed by the catalog store
///
/// `alloc(n)` returns a contiguous block `[start, start + n)`. The persisted
/// counter is the exclusive upper bound of everything ever reserved.
pub struct GlobalIdAllocator {
    kv: Arc<dyn KvStore>,
    key: String,
    window: Mutex<IdWindow>,
}

impl GlobalIdAllocator {
    /// Open the allocator, resuming above whatever was last reserved
    pub async fn new(kv: Arc<dyn KvStore>, kv_root: &str) -> Result<Self> {
        let key = format!("{kv_root}/gid");
        let saved = load_counter(kv.as_ref(), &key).await?;
        Ok(Self {
            kv,
            key,
            window: Mutex::new(IdWindow {
                next: saved,
                limit: saved,
            }),
        })
    }

    /// Allocate a contiguous block of `count` ids, returning `[start, end)`
    pub async fn alloc(&self, count: u32) -> Result<(UniqueId, UniqueId)> {
        let count = i64::from(count);
        let mut window = self.window.lock().await;
        if window.next + count > window.limit {
            let new_limit = window.next + count.max(ID_RESERVE_STEP);
            self.kv.put(&self.key, &new_limit.to_string()).await?;
            debug!(limit = new_limit, "reserved id block");
            window.limit = new_limit;
        }
        let start = window.next;
        window.next += count;
        Ok((start, start + count))
    }

    /// Allocate a single id
    pub async fn alloc_one(&self) -> Result<UniqueId> {
        let (start, _) = self.alloc(1).await?;
        Ok(start)
    }

    /// Top the window up so the next allocations stay off the catalog path
    pub async fn update(&self) -> Result<()> {
        let mut window = self.window.lock().await;
        if window.limit - window.next < ID_RESERVE_STEP / 2 {
            let new_limit = window.next + ID_RESERVE_STEP;
            self.kv.put(&self.key, &new_limit.to_string()).await?;
            window.limit = new_limit;
        }
        Ok(())
    }
}

pub(super) async fn load_counter(kv: &dyn KvStore, key: &str) -> Result<i64> {
    match kv.get(key).await? {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|e| Error::Store(format!("corrupt counter at {key}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn test_blocks_are_contiguous_and_disjoint() {
        let kv = Arc::new(MemoryKv::new());
        let alloc = GlobalIdAllocator::new(kv, "kv").await.unwrap();

        let (s1, e1) = alloc.alloc(10).await.unwrap();
        let (s2, e2) = alloc.alloc(5).await.unwrap();
        assert_eq!(e1 - s1, 10);
        assert_eq!(s2, e1);
        assert_eq!(e2 - s2, 5);
    }

    #[tokio::test]
    async fn test_restart_starts_above_reserved_max() {
        let kv = Arc::new(MemoryKv::new());
        let first = GlobalIdAllocator::new(kv.clone(), "kv").await.unwrap();
        let (_, handed_out) = first.alloc(3).await.unwrap();
        drop(first);

        let second = GlobalIdAllocator::new(kv, "kv").await.unwrap();
        let (start, _) = second.alloc(1).await.unwrap();
        // the whole reserved block is burned, not just the 3 used ids
        assert!(start >= handed_out);
        assert!(start >= ID_RESERVE_STEP);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_blocks_never_overlap() {
        use tokio::task::JoinSet;

        let kv = Arc::new(MemoryKv::new());
        let alloc = Arc::new(GlobalIdAllocator::new(kv, "kv").await.unwrap());

        let mut tasks = JoinSet::new();
        for _ in 0..4 {
            let alloc = alloc.clone();
            tasks.spawn(async move {
                let mut blocks = Vec::with_capacity(50);
                for _ in 0..50 {
                    blocks.push(alloc.alloc(7).await.unwrap());
                }
                blocks
            });
        }

        let mut blocks = Vec::new();
        while let Some(result) = tasks.join_next().await {
            blocks.extend(result.unwrap());
        }
        blocks.sort();
        for pair in blocks.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "blocks {pair:?} overlap");
        }
    }

    #[tokio::test]
    async fn test_oversized_request_extends_window() {
        let kv = Arc::new(MemoryKv::new());
        let alloc = GlobalIdAllocator::new(kv, "kv").await.unwrap();

        let want = (ID_RESERVE_STEP * 3) as u32;
        let (start, end) = alloc.alloc(want).await.unwrap();
        assert_eq!(end - start, i64::from(want));
    }
}
