//! Shared harness: a running master over an in-memory catalog store with
//! recording stubs for every external service.

#![allow(dead_code)]

use async_trait::async_trait;
use lodestar::api::MsgBase;
use lodestar::kv::MemoryKv;
use lodestar::meta::{
    CollectionSchema, DataType, FieldSchema, KeyValue, SegmentInfo, SegmentState,
};
use lodestar::msgstream::{FlushCompletedMsg, Msg, MsgBus, TimeTickMsg};
use lodestar::services::{
    DataService, FieldBinlogPaths, IndexService, IndexStateInfo, ProxyService, QueryService,
};
use lodestar::{ExternalServices, Master, MasterConfig, Result, Timestamp, UniqueId};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Data-service stub: fixed binlog paths, configurable row counts, recorded
/// flush calls
pub struct MockData {
    pub num_rows: AtomicI64,
    pub flush_calls: Mutex<Vec<(UniqueId, Vec<UniqueId>)>>,
}

impl MockData {
    fn new(num_rows: i64) -> Self {
        Self {
            num_rows: AtomicI64::new(num_rows),
            flush_calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DataService for MockData {
    async fn get_insert_binlog_paths(&self, _seg: UniqueId) -> Result<Vec<FieldBinlogPaths>> {
        Ok(vec![FieldBinlogPaths {
            field_id: 100,
            paths: vec![
                "file1".to_string(),
                "file2".to_string(),
                "file3".to_string(),
            ],
        }])
    }

    async fn get_segment_info(&self, segment_ids: Vec<UniqueId>) -> Result<Vec<SegmentInfo>> {
        Ok(segment_ids
            .into_iter()
            .map(|id| {
                let mut info = SegmentInfo::growing(id, 0, 0, "ch-0", 1);
                info.state = SegmentState::Flushed;
                info.num_rows = self.num_rows.load(Ordering::SeqCst);
                info
            })
            .collect())
    }

    async fn get_insert_channels(&self, _coll: UniqueId) -> Result<Vec<String>> {
        Ok(vec!["ch-0".to_string()])
    }

    async fn get_collection_statistics(&self, _coll: UniqueId) -> Result<Vec<KeyValue>> {
        Ok(vec![KeyValue::new("row_count", "0")])
    }

    async fn flush(&self, collection_id: UniqueId, segment_ids: Vec<UniqueId>) -> Result<()> {
        self.flush_calls.lock().push((collection_id, segment_ids));
        Ok(())
    }

    async fn get_segment_info_channel(&self) -> Result<String> {
        Ok("data-segment-info".to_string())
    }
}

/// Recorded arguments of one build call
#[derive(Debug, Clone)]
pub struct BuildCall {
    pub data_paths: Vec<String>,
    pub index_id: UniqueId,
    pub index_name: String,
}

pub struct MockIndex {
    pub build_calls: Mutex<Vec<BuildCall>>,
    pub dropped: Mutex<Vec<UniqueId>>,
}

impl MockIndex {
    fn new() -> Self {
        Self {
            build_calls: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl IndexService for MockIndex {
    async fn build_index(
        &self,
        data_paths: Vec<String>,
        _type_params: Vec<KeyValue>,
        _index_params: Vec<KeyValue>,
        index_id: UniqueId,
        index_name: String,
    ) -> Result<UniqueId> {
        self.build_calls.lock().push(BuildCall {
            data_paths,
            index_id,
            index_name,
        });
        Ok(2000)
    }

    async fn drop_index(&self, index_id: UniqueId) -> Result<()> {
        self.dropped.lock().push(index_id);
        Ok(())
    }

    async fn get_index_states(&self, _build_ids: Vec<UniqueId>) -> Result<Vec<IndexStateInfo>> {
        Ok(vec![])
    }
}

pub struct MockQuery {
    pub released_collections: Mutex<Vec<UniqueId>>,
    pub released_partitions: Mutex<Vec<(UniqueId, Vec<UniqueId>)>>,
}

impl MockQuery {
    fn new() -> Self {
        Self {
            released_collections: Mutex::new(Vec::new()),
            released_partitions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl QueryService for MockQuery {
    async fn release_collection(
        &self,
        _ts: Timestamp,
        _db_id: UniqueId,
        collection_id: UniqueId,
    ) -> Result<()> {
        self.released_collections.lock().push(collection_id);
        Ok(())
    }

    async fn release_partitions(
        &self,
        _ts: Timestamp,
        _db_id: UniqueId,
        collection_id: UniqueId,
        partition_ids: Vec<UniqueId>,
    ) -> Result<()> {
        self.released_partitions
            .lock()
            .push((collection_id, partition_ids));
        Ok(())
    }

    async fn load_collection(
        &self,
        _ts: Timestamp,
        _db_id: UniqueId,
        _collection_id: UniqueId,
    ) -> Result<()> {
        Ok(())
    }

    async fn load_partitions(
        &self,
        _ts: Timestamp,
        _db_id: UniqueId,
        _collection_id: UniqueId,
        _partition_ids: Vec<UniqueId>,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct MockProxy {
    pub invalidated: Mutex<Vec<String>>,
}

impl MockProxy {
    fn new() -> Self {
        Self {
            invalidated: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProxyService for MockProxy {
    async fn invalidate_collection_meta_cache(
        &self,
        _ts: Timestamp,
        _db_name: &str,
        collection_name: &str,
    ) -> Result<()> {
        self.invalidated.lock().push(collection_name.to_string());
        Ok(())
    }
}

/// A started master plus handles on everything a test wants to poke
pub struct TestMaster {
    pub master: Master,
    /// the caller-side request context handed to every RPC
    pub ctx: CancellationToken,
    pub bus: Arc<MsgBus>,
    pub kv: Arc<MemoryKv>,
    pub config: MasterConfig,
    pub data: Arc<MockData>,
    pub index: Arc<MockIndex>,
    pub query: Arc<MockQuery>,
    pub proxy: Arc<MockProxy>,
}

pub async fn start_master() -> TestMaster {
    start_master_with(MasterConfig::default()).await
}

pub async fn start_master_with(config: MasterConfig) -> TestMaster {
    start_master_on(config, Arc::new(MemoryKv::new())).await
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Start a master over an existing catalog store (for restart tests)
pub async fn start_master_on(config: MasterConfig, kv: Arc<MemoryKv>) -> TestMaster {
    init_tracing();
    let bus = Arc::new(MsgBus::new());
    let data = Arc::new(MockData::new(config.min_segment_rows_to_enable_index));
    let index = Arc::new(MockIndex::new());
    let query = Arc::new(MockQuery::new());
    let proxy = Arc::new(MockProxy::new());

    let master = Master::new(
        config.clone(),
        kv.clone(),
        bus.clone(),
        ExternalServices {
            data: data.clone(),
            index: index.clone(),
            query: query.clone(),
            proxy: proxy.clone(),
        },
    )
    .await
    .expect("master construction");
    master.start().expect("master start");

    TestMaster {
        master,
        ctx: CancellationToken::new(),
        bus,
        kv,
        config,
        data,
        index,
        query,
        proxy,
    }
}

impl TestMaster {
    /// Publish a segment-created event on the data-service segment channel
    pub fn publish_segment(&self, info: SegmentInfo) {
        self.bus
            .producer(&[self.config.segment_channel.as_str()])
            .produce(Msg::SegmentCreated(info))
            .unwrap();
    }

    /// Publish a flush-completed event on the data-service segment channel
    pub fn publish_flush_completed(&self, segment_id: UniqueId, ts: Timestamp) {
        self.bus
            .producer(&[self.config.segment_channel.as_str()])
            .produce(Msg::FlushCompleted(FlushCompletedMsg {
                segment_id,
                timestamp: ts,
            }))
            .unwrap();
    }

    /// Publish a proxy time tick
    pub fn publish_proxy_tick(&self, ts: Timestamp) {
        self.bus
            .producer(&[self.config.proxy_time_tick_channel.as_str()])
            .produce(Msg::TimeTick(TimeTickMsg {
                timestamp: ts,
                source_id: 99,
            }))
            .unwrap();
    }
}

pub fn base(ts: Timestamp) -> MsgBase {
    MsgBase {
        msg_id: ts as i64,
        timestamp: ts,
        source_id: 0,
    }
}

/// Schema with one 128-dim float-vector field named "vector"
pub fn vector_schema(name: &str) -> CollectionSchema {
    CollectionSchema {
        name: name.to_string(),
        description: name.to_string(),
        auto_id: true,
        fields: vec![FieldSchema {
            field_id: 100,
            name: "vector".to_string(),
            is_primary_key: false,
            description: "vector".to_string(),
            data_type: DataType::FloatVector,
            type_params: vec![KeyValue::new("dim", "128")],
            index_params: vec![KeyValue::new("ik1", "iv1")],
        }],
    }
}

/// Poll a condition for up to one second
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
