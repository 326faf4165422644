//! Catalog store abstraction
//!
//! The master persists every piece of metadata through this transactional
//! key-value view. Keys are slash-delimited paths under a configured root;
//! values are text-encoded entities. Multi-operations are atomic: either
//! every put/delete becomes observable or none does.
//!
//! Prefixes match whole path components: a prefix selects a key when the two
//! are equal or the key continues with `/`. `a/b/1` therefore never matches
//! keys under `a/b/10`.

mod memory;

pub use memory::MemoryKv;

use crate::Result;
use async_trait::async_trait;

/// Transactional key-value store interface
///
/// This trait abstracts the catalog backend, allowing different
/// implementations (in-memory for dev and tests, an etcd-like service in
/// production deployments).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a single value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Put a single key-value pair
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a single key (absent keys are fine)
    async fn delete(&self, key: &str) -> Result<()>;

    /// Load all pairs whose key starts with `prefix`, sorted by key
    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Atomically put multiple pairs
    async fn multi_put(&self, kvs: Vec<(String, String)>) -> Result<()>;

    /// Atomically delete multiple keys
    async fn multi_delete(&self, keys: Vec<String>) -> Result<()>;

    /// Atomically put `puts` and delete everything under each prefix in
    /// `delete_prefixes`, in one transaction
    async fn multi_put_and_delete_with_prefix(
        &self,
        puts: Vec<(String, String)>,
        delete_prefixes: Vec<String>,
    ) -> Result<()>;
}
