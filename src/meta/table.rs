//! The in-memory relational view over the catalog store
//!
//! Every mutation validates under a single writer lock, persists one
//! transaction to the catalog store, and only then updates the in-memory
//! maps. On a persistence failure the table reloads itself wholesale, so a
//! partially applied transaction can never be observed.

use super::{
    params_equal, CollectionInfo, FieldSchema, IndexInfo, PartitionInfo, ProxyMeta, SegmentIndexInfo,
    SegmentInfo, SegmentState, TenantMeta,
};
use crate::config::MasterConfig;
use crate::kv::KvStore;
use crate::{Error, Result, UniqueId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};

#[derive(Debug, Default)]
struct MetaInner {
    tenants: HashMap<UniqueId, TenantMeta>,
    proxies: HashMap<UniqueId, ProxyMeta>,
    collections: HashMap<UniqueId, CollectionInfo>,
    coll_name_to_id: HashMap<String, UniqueId>,
    partitions: HashMap<UniqueId, PartitionInfo>,
    partition_to_coll: HashMap<UniqueId, UniqueId>,
    segment_to_coll: HashMap<UniqueId, UniqueId>,
    segment_to_partition: HashMap<UniqueId, UniqueId>,
    segment_states: HashMap<UniqueId, SegmentState>,
    /// Flat (segment id, index id) keying; iteration order is deterministic
    segment_indexes: BTreeMap<(UniqueId, UniqueId), SegmentIndexInfo>,
    indexes: HashMap<UniqueId, IndexInfo>,
}

/// The authoritative metadata table
pub struct MetaTable {
    kv: Arc<dyn KvStore>,
    root: String,
    max_partition_num: usize,
    default_partition_name: String,
    default_index_name: String,
    inner: RwLock<MetaInner>,
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Store(format!("corrupt {what} record in catalog: {e}")))
}

impl MetaTable {
    /// Open the table, loading the full catalog from the store
    pub async fn new(kv: Arc<dyn KvStore>, config: &MasterConfig) -> Result<Self> {
        let table = Self {
            kv,
            root: config.meta_root.clone(),
            max_partition_num: config.max_partition_num,
            default_partition_name: config.default_partition_name.clone(),
            default_index_name: config.default_index_name.clone(),
            inner: RwLock::new(MetaInner::default()),
        };
        {
            let mut inner = table.inner.write().await;
            reload_inner(table.kv.as_ref(), &table.root, &mut inner).await?;
        }
        Ok(table)
    }

    fn collection_key(&self, coll: UniqueId) -> String {
        format!("{}/collection/{}", self.root, coll)
    }

    fn partition_key(&self, coll: UniqueId, part: UniqueId) -> String {
        format!("{}/partition/{}/{}", self.root, coll, part)
    }

    fn segment_index_key(
        &self,
        coll: UniqueId,
        index: UniqueId,
        part: UniqueId,
        seg: UniqueId,
    ) -> String {
        format!("{}/segment-index/{}/{}/{}/{}", self.root, coll, index, part, seg)
    }

    fn index_key(&self, coll: UniqueId, index: UniqueId) -> String {
        format!("{}/index/{}/{}", self.root, coll, index)
    }

    fn tenant_key(&self, id: UniqueId) -> String {
        format!("{}/tenant/{}", self.root, id)
    }

    fn proxy_key(&self, id: UniqueId) -> String {
        format!("{}/proxy/{}", self.root, id)
    }

    /// Reload a failed writer's view and hand the original error back
    async fn recover(&self, inner: &mut MetaInner, err: Error) -> Error {
        warn!(error = %err, "catalog write failed, reloading meta table");
        if let Err(reload_err) = reload_inner(self.kv.as_ref(), &self.root, inner).await {
            error!(error = %reload_err, "meta table reload failed");
        }
        err
    }

    /// Register a tenant
    pub async fn add_tenant(&self, tenant: TenantMeta) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = self.tenant_key(tenant.id);
        let value = encode(&tenant)?;
        if let Err(e) = self.kv.put(&key, &value).await {
            return Err(self.recover(&mut inner, e).await);
        }
        inner.tenants.insert(tenant.id, tenant);
        Ok(())
    }

    /// Register a proxy
    pub async fn add_proxy(&self, proxy: ProxyMeta) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = self.proxy_key(proxy.id);
        let value = encode(&proxy)?;
        if let Err(e) = self.kv.put(&key, &value).await {
            return Err(self.recover(&mut inner, e).await);
        }
        inner.proxies.insert(proxy.id, proxy);
        Ok(())
    }

    /// Create a collection together with its default partition and any index
    /// definitions declared up front
    pub async fn add_collection(
        &self,
        mut coll: CollectionInfo,
        part: PartitionInfo,
        indexes: Vec<IndexInfo>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        if !part.segment_ids.is_empty() {
            return Err(Error::InvalidDdl(
                "segments should be empty when creating collection".to_string(),
            ));
        }
        if !coll.partition_ids.is_empty() {
            return Err(Error::InvalidDdl(
                "partitions should be empty when creating collection".to_string(),
            ));
        }
        if inner.coll_name_to_id.contains_key(&coll.schema.name) {
            return Err(Error::CollectionExists(coll.schema.name.clone()));
        }
        if coll.field_indexes.len() != indexes.len() {
            return Err(Error::InvalidDdl(
                "incorrect index info count when creating collection".to_string(),
            ));
        }

        coll.partition_ids.push(part.partition_id);

        let mut puts = vec![
            (self.collection_key(coll.id), encode(&coll)?),
            (self.partition_key(coll.id, part.partition_id), encode(&part)?),
        ];
        for idx in &indexes {
            puts.push((self.index_key(coll.id, idx.index_id), encode(idx)?));
        }

        if let Err(e) = self.kv.multi_put(puts).await {
            return Err(self.recover(&mut inner, e).await);
        }

        inner.coll_name_to_id.insert(coll.schema.name.clone(), coll.id);
        inner.partition_to_coll.insert(part.partition_id, coll.id);
        inner.partitions.insert(part.partition_id, part);
        for idx in indexes {
            inner.indexes.insert(idx.index_id, idx);
        }
        inner.collections.insert(coll.id, coll);
        Ok(())
    }

    /// Drop a collection and everything scoped under it
    pub async fn delete_collection(&self, coll_id: UniqueId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let coll = inner
            .collections
            .get(&coll_id)
            .ok_or(Error::CollectionIdNotFound(coll_id))?
            .clone();

        let prefixes = vec![
            self.collection_key(coll_id),
            format!("{}/partition/{}", self.root, coll_id),
            format!("{}/segment-index/{}", self.root, coll_id),
            format!("{}/index/{}", self.root, coll_id),
        ];
        if let Err(e) = self
            .kv
            .multi_put_and_delete_with_prefix(vec![], prefixes)
            .await
        {
            return Err(self.recover(&mut inner, e).await);
        }

        inner.collections.remove(&coll_id);
        inner.coll_name_to_id.remove(&coll.schema.name);
        for part_id in &coll.partition_ids {
            let Some(part) = inner.partitions.remove(part_id) else {
                warn!(partition_id = part_id, "partition meta missing during drop");
                continue;
            };
            inner.partition_to_coll.remove(part_id);
            for seg_id in part.segment_ids {
                inner.segment_to_coll.remove(&seg_id);
                inner.segment_to_partition.remove(&seg_id);
                inner.segment_states.remove(&seg_id);
            }
        }
        let MetaInner {
            segment_indexes,
            segment_to_coll,
            ..
        } = &mut *inner;
        segment_indexes.retain(|_, row| segment_to_coll.contains_key(&row.segment_id));
        for binding in &coll.field_indexes {
            inner.indexes.remove(&binding.index_id);
        }
        Ok(())
    }

    /// True when a collection with this name exists
    pub async fn has_collection(&self, name: &str) -> bool {
        self.inner.read().await.coll_name_to_id.contains_key(name)
    }

    /// Fetch a collection by name
    pub async fn get_collection_by_name(&self, name: &str) -> Result<CollectionInfo> {
        let inner = self.inner.read().await;
        let id = inner
            .coll_name_to_id
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;
        inner
            .collections
            .get(id)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Fetch a collection by id
    pub async fn get_collection_by_id(&self, coll_id: UniqueId) -> Result<CollectionInfo> {
        self.inner
            .read()
            .await
            .collections
            .get(&coll_id)
            .cloned()
            .ok_or(Error::CollectionIdNotFound(coll_id))
    }

    /// Fetch the collection owning a segment
    pub async fn get_collection_by_segment_id(&self, seg_id: UniqueId) -> Result<CollectionInfo> {
        let inner = self.inner.read().await;
        let coll_id = inner
            .segment_to_coll
            .get(&seg_id)
            .ok_or(Error::SegmentNotFound(seg_id))?;
        inner
            .collections
            .get(coll_id)
            .cloned()
            .ok_or(Error::CollectionIdNotFound(*coll_id))
    }

    /// Names of every collection
    pub async fn list_collections(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .coll_name_to_id
            .keys()
            .cloned()
            .collect()
    }

    /// Add a partition to an existing collection
    pub async fn add_partition(
        &self,
        coll_id: UniqueId,
        partition_name: &str,
        partition_id: UniqueId,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let coll = inner
            .collections
            .get(&coll_id)
            .ok_or(Error::CollectionIdNotFound(coll_id))?;

        if coll.partition_ids.len() >= self.max_partition_num {
            return Err(Error::InvalidDdl(format!(
                "maximum partition count {} reached",
                self.max_partition_num
            )));
        }
        for part_id in &coll.partition_ids {
            let Some(part) = inner.partitions.get(part_id) else {
                warn!(partition_id = part_id, "partition meta missing");
                continue;
            };
            if part.partition_name == partition_name {
                return Err(Error::InvalidDdl(format!(
                    "partition name = {partition_name} already exists"
                )));
            }
            if part.partition_id == partition_id {
                return Err(Error::InvalidDdl(format!(
                    "partition id = {partition_id} already exists"
                )));
            }
        }

        let part = PartitionInfo {
            partition_name: partition_name.to_string(),
            partition_id,
            segment_ids: Vec::new(),
        };
        let mut coll = coll.clone();
        coll.partition_ids.push(partition_id);

        let puts = vec![
            (self.collection_key(coll_id), encode(&coll)?),
            (self.partition_key(coll_id, partition_id), encode(&part)?),
        ];
        if let Err(e) = self.kv.multi_put(puts).await {
            return Err(self.recover(&mut inner, e).await);
        }

        inner.partitions.insert(partition_id, part);
        inner.partition_to_coll.insert(partition_id, coll_id);
        inner.collections.insert(coll_id, coll);
        Ok(())
    }

    /// True when the collection has a partition with this name
    pub async fn has_partition(&self, coll_id: UniqueId, partition_name: &str) -> bool {
        let inner = self.inner.read().await;
        let Some(coll) = inner.collections.get(&coll_id) else {
            return false;
        };
        coll.partition_ids.iter().any(|part_id| {
            inner
                .partitions
                .get(part_id)
                .is_some_and(|p| p.partition_name == partition_name)
        })
    }

    /// Drop a partition by name, cascading over its segments
    ///
    /// The default partition is protected. Returns the dropped partition id.
    pub async fn delete_partition(
        &self,
        coll_id: UniqueId,
        partition_name: &str,
    ) -> Result<UniqueId> {
        let mut inner = self.inner.write().await;

        if partition_name == self.default_partition_name {
            return Err(Error::InvalidDdl(
                "default partition cannot be deleted".to_string(),
            ));
        }
        let coll = inner
            .collections
            .get(&coll_id)
            .ok_or(Error::CollectionIdNotFound(coll_id))?;

        let mut doomed: Option<PartitionInfo> = None;
        let mut kept = Vec::with_capacity(coll.partition_ids.len());
        for part_id in &coll.partition_ids {
            match inner.partitions.get(part_id) {
                Some(part) if part.partition_name == partition_name => {
                    doomed = Some(part.clone());
                }
                _ => kept.push(*part_id),
            }
        }
        let doomed =
            doomed.ok_or_else(|| Error::PartitionNotFound(partition_name.to_string()))?;

        let mut coll = coll.clone();
        coll.partition_ids = kept;

        let puts = vec![(self.collection_key(coll_id), encode(&coll)?)];
        let mut prefixes = vec![self.partition_key(coll_id, doomed.partition_id)];
        for binding in &coll.field_indexes {
            prefixes.push(format!(
                "{}/segment-index/{}/{}/{}",
                self.root, coll_id, binding.index_id, doomed.partition_id
            ));
        }
        if let Err(e) = self.kv.multi_put_and_delete_with_prefix(puts, prefixes).await {
            return Err(self.recover(&mut inner, e).await);
        }

        inner.partitions.remove(&doomed.partition_id);
        inner.partition_to_coll.remove(&doomed.partition_id);
        for seg_id in &doomed.segment_ids {
            inner.segment_to_coll.remove(seg_id);
            inner.segment_to_partition.remove(seg_id);
            inner.segment_states.remove(seg_id);
        }
        inner
            .segment_indexes
            .retain(|_, row| !doomed.segment_ids.contains(&row.segment_id));
        inner.collections.insert(coll_id, coll);
        Ok(doomed.partition_id)
    }

    /// Fetch a partition by id
    pub async fn get_partition_by_id(&self, partition_id: UniqueId) -> Result<PartitionInfo> {
        self.inner
            .read()
            .await
            .partitions
            .get(&partition_id)
            .cloned()
            .ok_or(Error::PartitionIdNotFound(partition_id))
    }

    /// Record a newly created segment into its partition
    pub async fn add_segment(&self, seg: &SegmentInfo) -> Result<()> {
        let mut inner = self.inner.write().await;
        let coll = inner
            .collections
            .get(&seg.collection_id)
            .ok_or(Error::CollectionIdNotFound(seg.collection_id))?;
        if !coll.partition_ids.contains(&seg.partition_id) {
            return Err(Error::InvalidDdl(format!(
                "partition id = {}, not belong to collection id = {}",
                seg.partition_id, seg.collection_id
            )));
        }
        let part = inner
            .partitions
            .get(&seg.partition_id)
            .ok_or(Error::PartitionIdNotFound(seg.partition_id))?;
        if part.segment_ids.contains(&seg.id) {
            return Err(Error::InvalidDdl(format!("segment id = {} exists", seg.id)));
        }

        let mut part = part.clone();
        part.segment_ids.push(seg.id);

        let key = self.partition_key(seg.collection_id, seg.partition_id);
        let value = encode(&part)?;
        if let Err(e) = self.kv.put(&key, &value).await {
            return Err(self.recover(&mut inner, e).await);
        }

        inner.partitions.insert(seg.partition_id, part);
        inner.segment_to_coll.insert(seg.id, seg.collection_id);
        inner.segment_to_partition.insert(seg.id, seg.partition_id);
        inner.segment_states.insert(seg.id, seg.state);
        Ok(())
    }

    /// Transition segments to Sealed; unknown ids are logged and skipped
    pub async fn mark_segments_sealed(&self, seg_ids: &[UniqueId]) {
        let mut inner = self.inner.write().await;
        for seg_id in seg_ids {
            match inner.segment_states.get_mut(seg_id) {
                Some(state) => {
                    if *state == SegmentState::Growing {
                        *state = SegmentState::Sealed;
                    }
                }
                None => warn!(segment_id = seg_id, "sealing unknown segment"),
            }
        }
    }

    /// Record that the data nodes finished persisting a segment
    ///
    /// A second call for the same segment is rejected.
    pub async fn add_flushed_segment(&self, seg_id: UniqueId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.segment_states.get(&seg_id) == Some(&SegmentState::Flushed) {
            return Err(Error::InvalidDdl(format!(
                "segment id = {seg_id} already flushed"
            )));
        }
        inner.segment_states.insert(seg_id, SegmentState::Flushed);
        Ok(())
    }

    /// Current lifecycle state of a segment, if known
    pub async fn segment_state(&self, seg_id: UniqueId) -> Option<SegmentState> {
        self.inner.read().await.segment_states.get(&seg_id).copied()
    }

    /// Record an index realization for a flushed segment
    pub async fn add_segment_index(&self, row: SegmentIndexInfo) -> Result<()> {
        let mut inner = self.inner.write().await;
        let coll_id = *inner
            .segment_to_coll
            .get(&row.segment_id)
            .ok_or(Error::SegmentNotFound(row.segment_id))?;
        let part_id = *inner
            .segment_to_partition
            .get(&row.segment_id)
            .ok_or(Error::SegmentNotFound(row.segment_id))?;
        if inner.segment_states.get(&row.segment_id) != Some(&SegmentState::Flushed) {
            return Err(Error::InvalidDdl(format!(
                "segment id = {} is not flushed",
                row.segment_id
            )));
        }
        let coll = inner
            .collections
            .get(&coll_id)
            .ok_or(Error::CollectionIdNotFound(coll_id))?;
        if !coll
            .field_indexes
            .iter()
            .any(|binding| binding.index_id == row.index_id)
        {
            return Err(Error::IndexNotFound(format!("id {}", row.index_id)));
        }
        if inner
            .segment_indexes
            .contains_key(&(row.segment_id, row.index_id))
        {
            return Err(Error::InvalidDdl(format!(
                "index id = {} already exists on segment {}",
                row.index_id, row.segment_id
            )));
        }

        let key = self.segment_index_key(coll_id, row.index_id, part_id, row.segment_id);
        let value = encode(&row)?;
        if let Err(e) = self.kv.put(&key, &value).await {
            return Err(self.recover(&mut inner, e).await);
        }

        inner
            .segment_indexes
            .insert((row.segment_id, row.index_id), row);
        Ok(())
    }

    /// Remove a field's index binding by name
    ///
    /// Returns the dropped index id and whether anything was dropped.
    pub async fn drop_index(
        &self,
        coll_name: &str,
        field_name: &str,
        index_name: &str,
    ) -> Result<(UniqueId, bool)> {
        let mut inner = self.inner.write().await;
        let coll_id = *inner
            .coll_name_to_id
            .get(coll_name)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?;
        let coll = inner
            .collections
            .get(&coll_id)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?;
        let field = find_field(coll, field_name)?.clone();

        let mut drop_idx_id: Option<UniqueId> = None;
        let mut kept = Vec::with_capacity(coll.field_indexes.len());
        for binding in &coll.field_indexes {
            if binding.field_id != field.field_id {
                kept.push(*binding);
                continue;
            }
            match inner.indexes.get(&binding.index_id) {
                Some(meta) if meta.index_name == index_name && drop_idx_id.is_none() => {
                    drop_idx_id = Some(binding.index_id);
                }
                Some(_) => kept.push(*binding),
                None => {
                    warn!(index_id = binding.index_id, "index binding has no meta");
                    kept.push(*binding);
                }
            }
        }
        let Some(drop_idx_id) = drop_idx_id else {
            warn!(
                collection = coll_name,
                field = field_name,
                index = index_name,
                "drop index: index not found"
            );
            return Ok((0, false));
        };

        let mut coll = coll.clone();
        coll.field_indexes = kept;

        let puts = vec![(self.collection_key(coll_id), encode(&coll)?)];
        let prefixes = vec![
            format!("{}/segment-index/{}/{}", self.root, coll_id, drop_idx_id),
            self.index_key(coll_id, drop_idx_id),
        ];
        if let Err(e) = self.kv.multi_put_and_delete_with_prefix(puts, prefixes).await {
            return Err(self.recover(&mut inner, e).await);
        }

        inner.indexes.remove(&drop_idx_id);
        inner
            .segment_indexes
            .retain(|_, row| row.index_id != drop_idx_id);
        inner.collections.insert(coll_id, coll);
        Ok((drop_idx_id, true))
    }

    /// Index realization recorded for a segment
    ///
    /// An empty index name with field id -1 asks for the default index; a
    /// segment without any realization yields a disabled placeholder row.
    pub async fn get_segment_index_info(
        &self,
        seg_id: UniqueId,
        field_id: i64,
        index_name: &str,
    ) -> Result<SegmentIndexInfo> {
        let inner = self.inner.read().await;
        if inner.segment_states.get(&seg_id) != Some(&SegmentState::Flushed) {
            return Err(Error::InvalidDdl(format!(
                "segment id = {seg_id} is not flushed, no index meta"
            )));
        }
        let rows: Vec<&SegmentIndexInfo> = inner
            .segment_indexes
            .range((seg_id, UniqueId::MIN)..=(seg_id, UniqueId::MAX))
            .map(|(_, row)| row)
            .collect();
        if rows.is_empty() {
            return Ok(SegmentIndexInfo {
                segment_id: seg_id,
                field_id,
                index_id: 0,
                build_id: 0,
                enable_index: false,
            });
        }

        if field_id == -1 && index_name.is_empty() {
            // prefer the default-named index, otherwise the first realization
            for row in &rows {
                if inner
                    .indexes
                    .get(&row.index_id)
                    .is_some_and(|meta| meta.index_name == self.default_index_name)
                {
                    return Ok((*row).clone());
                }
            }
            return Ok(rows[0].clone());
        } else {
            for row in &rows {
                let Some(meta) = inner.indexes.get(&row.index_id) else {
                    continue;
                };
                if meta.index_name == index_name && row.field_id == field_id {
                    return Ok((*row).clone());
                }
            }
        }
        Err(Error::IndexNotFound(format!(
            "{index_name} on segment {seg_id} with field id {field_id}"
        )))
    }

    /// Look a field schema up by collection and field name
    pub async fn get_field_schema(&self, coll_name: &str, field_name: &str) -> Result<FieldSchema> {
        let inner = self.inner.read().await;
        let coll_id = inner
            .coll_name_to_id
            .get(coll_name)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?;
        let coll = inner
            .collections
            .get(coll_id)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?;
        Ok(find_field(coll, field_name)?.clone())
    }

    /// True when the segment already carries an index on this field whose
    /// parameters match
    pub async fn is_segment_indexed(
        &self,
        seg_id: UniqueId,
        field: &FieldSchema,
        index_params: &[super::KeyValue],
    ) -> bool {
        let inner = self.inner.read().await;
        segment_indexed(&inner, seg_id, field, index_params)
    }

    /// Segments of the collection not yet indexed with the given parameters
    ///
    /// Upserts the field's index binding as a side effect: a missing binding
    /// is added, and a binding for the same (field, name) pair with different
    /// parameters is renamed with a `_bak` suffix instead of being replaced.
    /// When an equivalent binding already exists its id is written back into
    /// `idx_info`.
    pub async fn get_not_indexed_segments(
        &self,
        coll_name: &str,
        field_name: &str,
        idx_info: &mut IndexInfo,
    ) -> Result<(Vec<UniqueId>, FieldSchema)> {
        let mut inner = self.inner.write().await;
        let coll_id = *inner
            .coll_name_to_id
            .get(coll_name)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?;
        let coll = inner
            .collections
            .get(&coll_id)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?
            .clone();
        let field = find_field(&coll, field_name)?.clone();

        // an older binding under the same name but different parameters
        let dup_idx = coll
            .field_indexes
            .iter()
            .filter(|binding| binding.field_id == field.field_id)
            .find(|binding| {
                inner
                    .indexes
                    .get(&binding.index_id)
                    .is_some_and(|meta| meta.index_name == idx_info.index_name)
            })
            .map(|binding| binding.index_id);

        // a binding on the field with no backing meta is a corrupt catalog
        let mut existing: Option<IndexInfo> = None;
        for binding in &coll.field_indexes {
            if binding.field_id != field.field_id {
                continue;
            }
            let meta = inner
                .indexes
                .get(&binding.index_id)
                .ok_or_else(|| Error::IndexNotFound(format!("id {}", binding.index_id)))?;
            if params_equal(&meta.index_params, &idx_info.index_params) {
                existing = Some(meta.clone());
                break;
            }
        }

        match existing {
            None => {
                let mut coll = coll.clone();
                coll.field_indexes.push(super::FieldIndex {
                    field_id: field.field_id,
                    index_id: idx_info.index_id,
                });
                let mut puts = vec![
                    (self.collection_key(coll_id), encode(&coll)?),
                    (
                        self.index_key(coll_id, idx_info.index_id),
                        encode(idx_info)?,
                    ),
                ];
                let renamed = match dup_idx {
                    Some(dup) if dup != idx_info.index_id => {
                        let mut dup_info = inner
                            .indexes
                            .get(&dup)
                            .cloned()
                            .ok_or_else(|| Error::IndexNotFound(format!("id {dup}")))?;
                        dup_info.index_name.push_str("_bak");
                        puts.push((self.index_key(coll_id, dup), encode(&dup_info)?));
                        Some(dup_info)
                    }
                    _ => None,
                };
                if let Err(e) = self.kv.multi_put(puts).await {
                    return Err(self.recover(&mut inner, e).await);
                }
                if let Some(dup_info) = renamed {
                    inner.indexes.insert(dup_info.index_id, dup_info);
                }
                inner.indexes.insert(idx_info.index_id, idx_info.clone());
                inner.collections.insert(coll_id, coll);
            }
            Some(mut exist_info) => {
                idx_info.index_id = exist_info.index_id;
                if exist_info.index_name != idx_info.index_name {
                    exist_info.index_name = idx_info.index_name.clone();
                    let mut puts = vec![(
                        self.index_key(coll_id, exist_info.index_id),
                        encode(&exist_info)?,
                    )];
                    let renamed = match dup_idx {
                        Some(dup) if dup != exist_info.index_id => {
                            let mut dup_info = inner
                                .indexes
                                .get(&dup)
                                .cloned()
                                .ok_or_else(|| Error::IndexNotFound(format!("id {dup}")))?;
                            dup_info.index_name.push_str("_bak");
                            puts.push((self.index_key(coll_id, dup), encode(&dup_info)?));
                            Some(dup_info)
                        }
                        _ => None,
                    };
                    if let Err(e) = self.kv.multi_put(puts).await {
                        return Err(self.recover(&mut inner, e).await);
                    }
                    if let Some(dup_info) = renamed {
                        inner.indexes.insert(dup_info.index_id, dup_info);
                    }
                    inner.indexes.insert(exist_info.index_id, exist_info);
                }
            }
        }

        let coll = inner
            .collections
            .get(&coll_id)
            .ok_or(Error::CollectionIdNotFound(coll_id))?;
        let mut not_indexed = Vec::new();
        for part_id in &coll.partition_ids {
            let Some(part) = inner.partitions.get(part_id) else {
                continue;
            };
            for seg_id in &part.segment_ids {
                if !segment_indexed(&inner, *seg_id, &field, &idx_info.index_params) {
                    not_indexed.push(*seg_id);
                }
            }
        }
        Ok((not_indexed, field))
    }

    /// Index definitions bound to a field; an empty name matches all
    pub async fn get_indexes_by_name(
        &self,
        coll_name: &str,
        field_name: &str,
        index_name: &str,
    ) -> Result<Vec<IndexInfo>> {
        let inner = self.inner.read().await;
        let coll_id = inner
            .coll_name_to_id
            .get(coll_name)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?;
        let coll = inner
            .collections
            .get(coll_id)
            .ok_or_else(|| Error::CollectionNotFound(coll_name.to_string()))?;
        let field = find_field(coll, field_name)?;

        let mut result = Vec::new();
        for binding in &coll.field_indexes {
            if binding.field_id != field.field_id {
                continue;
            }
            let meta = inner
                .indexes
                .get(&binding.index_id)
                .ok_or_else(|| Error::IndexNotFound(format!("id {}", binding.index_id)))?;
            if index_name.is_empty() || meta.index_name == index_name {
                result.push(meta.clone());
            }
        }
        Ok(result)
    }

    /// Fetch an index definition by id
    pub async fn get_index_by_id(&self, index_id: UniqueId) -> Result<IndexInfo> {
        self.inner
            .read()
            .await
            .indexes
            .get(&index_id)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(format!("id {index_id}")))
    }
}

fn find_field<'a>(coll: &'a CollectionInfo, field_name: &str) -> Result<&'a FieldSchema> {
    coll.schema
        .fields
        .iter()
        .find(|f| f.name == field_name)
        .ok_or_else(|| Error::FieldNotFound(field_name.to_string()))
}

fn segment_indexed(
    inner: &MetaInner,
    seg_id: UniqueId,
    field: &FieldSchema,
    index_params: &[super::KeyValue],
) -> bool {
    inner
        .segment_indexes
        .range((seg_id, UniqueId::MIN)..=(seg_id, UniqueId::MAX))
        .any(|(_, row)| {
            row.field_id == field.field_id
                && inner
                    .indexes
                    .get(&row.index_id)
                    .is_some_and(|meta| params_equal(index_params, &meta.index_params))
        })
}

async fn reload_inner(kv: &dyn KvStore, root: &str, inner: &mut MetaInner) -> Result<()> {
    let mut fresh = MetaInner::default();

    for (_, raw) in kv.load_with_prefix(&format!("{root}/tenant")).await? {
        let tenant: TenantMeta = decode(&raw, "tenant")?;
        fresh.tenants.insert(tenant.id, tenant);
    }
    for (_, raw) in kv.load_with_prefix(&format!("{root}/proxy")).await? {
        let proxy: ProxyMeta = decode(&raw, "proxy")?;
        fresh.proxies.insert(proxy.id, proxy);
    }
    for (_, raw) in kv.load_with_prefix(&format!("{root}/collection")).await? {
        let coll: CollectionInfo = decode(&raw, "collection")?;
        fresh
            .coll_name_to_id
            .insert(coll.schema.name.clone(), coll.id);
        for part_id in &coll.partition_ids {
            fresh.partition_to_coll.insert(*part_id, coll.id);
        }
        fresh.collections.insert(coll.id, coll);
    }
    for (_, raw) in kv.load_with_prefix(&format!("{root}/partition")).await? {
        let part: PartitionInfo = decode(&raw, "partition")?;
        let Some(coll_id) = fresh.partition_to_coll.get(&part.partition_id).copied() else {
            warn!(
                partition_id = part.partition_id,
                "partition does not belong to any collection"
            );
            continue;
        };
        for seg_id in &part.segment_ids {
            fresh.segment_to_coll.insert(*seg_id, coll_id);
            fresh.segment_to_partition.insert(*seg_id, part.partition_id);
            // only flushed segments survive a restart; growing ones are the
            // segment allocator's business
            fresh.segment_states.insert(*seg_id, SegmentState::Flushed);
        }
        fresh.partitions.insert(part.partition_id, part);
    }
    for (_, raw) in kv.load_with_prefix(&format!("{root}/segment-index")).await? {
        let row: SegmentIndexInfo = decode(&raw, "segment index")?;
        fresh
            .segment_indexes
            .insert((row.segment_id, row.index_id), row);
    }
    for (_, raw) in kv.load_with_prefix(&format!("{root}/index")).await? {
        let idx: IndexInfo = decode(&raw, "index")?;
        fresh.indexes.insert(idx.index_id, idx);
    }

    *inner = fresh;
    Ok(())
}
