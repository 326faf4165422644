//! In-memory catalog store for development and testing

use super::KvStore;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// In-memory catalog store
///
/// Keeps all pairs in a single ordered map so prefix scans are range
/// queries. Every multi-operation runs under one write lock, which makes it
/// trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

/// Component-boundary prefix match: equal, or continuing with `/`
fn key_in_prefix(key: &str, prefix: &str) -> bool {
    match key.strip_prefix(prefix) {
        None => false,
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
    }
}

impl MemoryKv {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no keys are stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn remove_prefix(entries: &mut BTreeMap<String, String>, prefix: &str) {
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| key_in_prefix(k, prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| key_in_prefix(k, prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn multi_put(&self, kvs: Vec<(String, String)>) -> Result<()> {
        let mut entries = self.entries.write();
        for (k, v) in kvs {
            entries.insert(k, v);
        }
        Ok(())
    }

    async fn multi_delete(&self, keys: Vec<String>) -> Result<()> {
        let mut entries = self.entries.write();
        for k in keys {
            entries.remove(&k);
        }
        Ok(())
    }

    async fn multi_put_and_delete_with_prefix(
        &self,
        puts: Vec<(String, String)>,
        delete_prefixes: Vec<String>,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        for prefix in &delete_prefixes {
            Self::remove_prefix(&mut entries, prefix);
        }
        for (k, v) in puts {
            entries.insert(k, v);
        }
        Ok(())
    }
}
