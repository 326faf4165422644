//! The master core
//!
//! Wires the catalog, allocators, message streams, DDL scheduler and flush
//! pipeline together, supervises the background loops, and exposes the
//! public RPC surface. Every externally visible method gates on the current
//! state code, enqueues a task on the scheduler, waits under both the
//! caller's request context and the master's own context, and shapes the
//! outcome into a status envelope.

use crate::allocator::{GlobalIdAllocator, TimestampOracle};
use crate::api::{
    AllocIdResponse, AllocTimestampResponse, BoolResponse, ComponentInfo, ComponentStates,
    CreateCollectionRequest, CreateIndexRequest, CreatePartitionRequest,
    DescribeCollectionRequest, DescribeCollectionResponse, DescribeIndexRequest,
    DescribeIndexResponse, DescribeSegmentRequest, DescribeSegmentResponse, DropCollectionRequest,
    DropIndexRequest, DropPartitionRequest, HasCollectionRequest, HasPartitionRequest,
    ShowCollectionsRequest, ShowCollectionsResponse, ShowPartitionsRequest,
    ShowPartitionsResponse, ShowSegmentsRequest, ShowSegmentsResponse, StateCode, Status,
    StringResponse,
};
use crate::config::MasterConfig;
use crate::flush::{FlushPipeline, IndexBuildTask, IndexBuilder};
use crate::kv::KvStore;
use crate::meta::MetaTable;
use crate::msgstream::{Consumer, Msg, MsgBus, StreamDdlEmitter};
use crate::scheduler::{DdlContext, DdlEnvelope, DdlReply, DdlRequest, DdlScheduler};
use crate::segment::SegmentAllocator;
use crate::services::{DataService, IndexService, ProxyService, QueryService};
use crate::{Error, Result, UniqueId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Role string reported by `get_component_states`
const ROLE_NAME: &str = "master";

/// Clients for every external collaborator the master drives
pub struct ExternalServices {
    pub data: Arc<dyn DataService>,
    pub index: Arc<dyn IndexService>,
    pub query: Arc<dyn QueryService>,
    pub proxy: Arc<dyn ProxyService>,
}

struct PendingReceivers {
    ddl_rx: mpsc::Receiver<DdlEnvelope>,
    index_rx: mpsc::Receiver<IndexBuildTask>,
}

/// The coordinator service owning the catalog and all DDL
pub struct Master {
    config: MasterConfig,
    meta: Arc<MetaTable>,
    id_alloc: Arc<GlobalIdAllocator>,
    tso: Arc<TimestampOracle>,
    bus: Arc<MsgBus>,
    seg_alloc: Arc<SegmentAllocator>,
    ctx: Arc<DdlContext>,
    pipeline: Arc<FlushPipeline>,
    builder: Arc<IndexBuilder>,
    ddl_tx: mpsc::Sender<DdlEnvelope>,
    state: AtomicU8,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    pending: Mutex<Option<PendingReceivers>>,
}

impl Master {
    /// Construct the master over a catalog store and a message bus
    ///
    /// Loads the full catalog and resumes both allocators; the instance
    /// starts in `Initializing` and only serves writes after `start`.
    pub async fn new(
        config: MasterConfig,
        kv: Arc<dyn KvStore>,
        bus: Arc<MsgBus>,
        services: ExternalServices,
    ) -> Result<Self> {
        let meta = Arc::new(MetaTable::new(kv.clone(), &config).await?);
        let id_alloc = Arc::new(GlobalIdAllocator::new(kv.clone(), &config.kv_root).await?);
        let tso = Arc::new(TimestampOracle::new(kv, &config.kv_root).await?);
        let seg_alloc = Arc::new(SegmentAllocator::new(
            &config,
            meta.clone(),
            id_alloc.clone(),
            tso.clone(),
        ));

        let shutdown = CancellationToken::new();
        let (ddl_tx, ddl_rx) = mpsc::channel(config.ddl_queue_size);
        let (index_tx, index_rx) = mpsc::channel(config.index_queue_size);

        let emitter = Arc::new(StreamDdlEmitter::new(
            &bus,
            config.node_id,
            &config.time_tick_channel,
            &config.ddl_channel,
        ));
        let ctx = Arc::new(DdlContext {
            config: config.clone(),
            meta: meta.clone(),
            id_alloc: id_alloc.clone(),
            tso: tso.clone(),
            emitter,
            proxy: services.proxy,
            query: services.query,
            index_service: services.index.clone(),
            index_tx: index_tx.clone(),
            shutdown: shutdown.clone(),
        });
        let pipeline = Arc::new(FlushPipeline::new(
            meta.clone(),
            seg_alloc.clone(),
            services.data.clone(),
            index_tx,
        ));
        let builder = Arc::new(IndexBuilder::new(
            &config,
            meta.clone(),
            services.data,
            services.index,
        ));

        info!(node_id = config.node_id, "master initialized");
        Ok(Self {
            config,
            meta,
            id_alloc,
            tso,
            bus,
            seg_alloc,
            ctx,
            pipeline,
            builder,
            ddl_tx,
            state: AtomicU8::new(StateCode::Initializing as u8),
            shutdown,
            handles: Mutex::new(Vec::new()),
            pending: Mutex::new(Some(PendingReceivers { ddl_rx, index_rx })),
        })
    }

    /// Spawn every background loop and go Healthy
    pub fn start(&self) -> Result<()> {
        let Some(PendingReceivers { ddl_rx, index_rx }) = self.pending.lock().take() else {
            return Err(Error::Internal("master already started".to_string()));
        };

        // subscribe before spawning so no event published after start() can
        // be missed
        let tick_consumer = self
            .bus
            .consumer(&self.config.proxy_time_tick_channel, &self.config.subscription_name);
        let segment_consumer = self
            .bus
            .consumer(&self.config.segment_channel, &self.config.subscription_name);

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(
            DdlScheduler::new(self.ctx.clone()).run(ddl_rx),
        ));
        handles.push(tokio::spawn(time_tick_loop(
            tick_consumer,
            self.ctx.clone(),
            self.pipeline.clone(),
        )));
        handles.push(tokio::spawn(segment_loop(
            segment_consumer,
            self.meta.clone(),
            self.seg_alloc.clone(),
            self.pipeline.clone(),
            self.shutdown.clone(),
        )));
        handles.push(tokio::spawn(index_worker(
            index_rx,
            self.builder.clone(),
            self.shutdown.clone(),
        )));
        handles.push(tokio::spawn(allocator_refill_loop(
            self.id_alloc.clone(),
            self.tso.clone(),
            self.config.allocator_update_interval,
            self.shutdown.clone(),
        )));
        drop(handles);

        self.update_state_code(StateCode::Healthy);
        info!(
            node_id = self.config.node_id,
            dd_channel = %self.config.ddl_channel,
            time_tick_channel = %self.config.time_tick_channel,
            "master started"
        );
        Ok(())
    }

    /// Cancel the root context and wait for every loop to drain
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.update_state_code(StateCode::Abnormal);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("master stopped");
    }

    /// Current component state
    pub fn state_code(&self) -> StateCode {
        match self.state.load(Ordering::SeqCst) {
            0 => StateCode::Initializing,
            1 => StateCode::Healthy,
            _ => StateCode::Abnormal,
        }
    }

    pub fn update_state_code(&self, code: StateCode) {
        self.state.store(code as u8, Ordering::SeqCst);
    }

    /// The authoritative metadata table
    pub fn meta(&self) -> Arc<MetaTable> {
        self.meta.clone()
    }

    /// The growing-segment allocator
    pub fn segment_allocator(&self) -> Arc<SegmentAllocator> {
        self.seg_alloc.clone()
    }

    fn check_healthy(&self) -> std::result::Result<(), Status> {
        let code = self.state_code();
        if code == StateCode::Healthy {
            Ok(())
        } else {
            Err(Status::unexpected(format!("state code = {code}")))
        }
    }

    /// Enqueue a task and wait for its notification, bounded by both the
    /// caller's request context and the master's own context
    async fn schedule(
        &self,
        ctx: &CancellationToken,
        request: DdlRequest,
    ) -> Result<DdlReply> {
        let (tx, rx) = oneshot::channel();
        self.ddl_tx
            .send(DdlEnvelope { request, reply: tx })
            .await
            .map_err(|_| Error::CoreStopped)?;

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::CoreStopped),
            _ = ctx.cancelled() => Err(Error::RequestCancelled),
            outcome = tokio::time::timeout(self.config.rpc_timeout, rx) => match outcome {
                Err(_) => Err(Error::Timeout),
                Ok(Err(_)) => Err(Error::Internal("ddl notify channel closed".to_string())),
                Ok(Ok(result)) => result,
            }
        }
    }

    pub async fn create_collection(
        &self,
        ctx: &CancellationToken,
        req: CreateCollectionRequest,
    ) -> Status {
        if let Err(status) = self.check_healthy() {
            return status;
        }
        debug!(name = %req.collection_name, msg_id = req.base.msg_id, "CreateCollection");
        match self.schedule(ctx, DdlRequest::CreateCollection(req)).await {
            Ok(_) => Status::success(),
            Err(e) => Status::from_error("create collection failed", &e),
        }
    }

    pub async fn drop_collection(
        &self,
        ctx: &CancellationToken,
        req: DropCollectionRequest,
    ) -> Status {
        if let Err(status) = self.check_healthy() {
            return status;
        }
        debug!(name = %req.collection_name, msg_id = req.base.msg_id, "DropCollection");
        match self.schedule(ctx, DdlRequest::DropCollection(req)).await {
            Ok(_) => Status::success(),
            Err(e) => Status::from_error("drop collection failed", &e),
        }
    }

    pub async fn has_collection(
        &self,
        ctx: &CancellationToken,
        req: HasCollectionRequest,
    ) -> BoolResponse {
        if let Err(status) = self.check_healthy() {
            return BoolResponse {
                status,
                value: false,
            };
        }
        match self.schedule(ctx, DdlRequest::HasCollection(req)).await {
            Ok(DdlReply::Bool(value)) => BoolResponse {
                status: Status::success(),
                value,
            },
            Ok(_) => BoolResponse {
                status: Status::unexpected("unexpected reply shape"),
                value: false,
            },
            Err(e) => BoolResponse {
                status: Status::from_error("has collection failed", &e),
                value: false,
            },
        }
    }

    pub async fn describe_collection(
        &self,
        ctx: &CancellationToken,
        req: DescribeCollectionRequest,
    ) -> DescribeCollectionResponse {
        if let Err(status) = self.check_healthy() {
            return DescribeCollectionResponse {
                status,
                schema: None,
                collection_id: 0,
            };
        }
        match self.schedule(ctx, DdlRequest::DescribeCollection(req)).await {
            Ok(DdlReply::CollectionDescription {
                schema,
                collection_id,
            }) => DescribeCollectionResponse {
                status: Status::success(),
                schema: Some(schema),
                collection_id,
            },
            Ok(_) => DescribeCollectionResponse {
                status: Status::unexpected("unexpected reply shape"),
                schema: None,
                collection_id: 0,
            },
            Err(e) => DescribeCollectionResponse {
                status: Status::from_error("describe collection failed", &e),
                schema: None,
                collection_id: 0,
            },
        }
    }

    pub async fn show_collections(
        &self,
        ctx: &CancellationToken,
        req: ShowCollectionsRequest,
    ) -> ShowCollectionsResponse {
        if let Err(status) = self.check_healthy() {
            return ShowCollectionsResponse {
                status,
                collection_names: Vec::new(),
            };
        }
        match self.schedule(ctx, DdlRequest::ShowCollections(req)).await {
            Ok(DdlReply::CollectionNames(collection_names)) => ShowCollectionsResponse {
                status: Status::success(),
                collection_names,
            },
            Ok(_) => ShowCollectionsResponse {
                status: Status::unexpected("unexpected reply shape"),
                collection_names: Vec::new(),
            },
            Err(e) => ShowCollectionsResponse {
                status: Status::from_error("show collections failed", &e),
                collection_names: Vec::new(),
            },
        }
    }

    pub async fn create_partition(
        &self,
        ctx: &CancellationToken,
        req: CreatePartitionRequest,
    ) -> Status {
        if let Err(status) = self.check_healthy() {
            return status;
        }
        debug!(
            collection = %req.collection_name,
            partition = %req.partition_name,
            "CreatePartition"
        );
        match self.schedule(ctx, DdlRequest::CreatePartition(req)).await {
            Ok(_) => Status::success(),
            Err(e) => Status::from_error("create partition failed", &e),
        }
    }

    pub async fn drop_partition(
        &self,
        ctx: &CancellationToken,
        req: DropPartitionRequest,
    ) -> Status {
        if let Err(status) = self.check_healthy() {
            return status;
        }
        debug!(
            collection = %req.collection_name,
            partition = %req.partition_name,
            "DropPartition"
        );
        match self.schedule(ctx, DdlRequest::DropPartition(req)).await {
            Ok(_) => Status::success(),
            Err(e) => Status::from_error("drop partition failed", &e),
        }
    }

    pub async fn has_partition(
        &self,
        ctx: &CancellationToken,
        req: HasPartitionRequest,
    ) -> BoolResponse {
        if let Err(status) = self.check_healthy() {
            return BoolResponse {
                status,
                value: false,
            };
        }
        match self.schedule(ctx, DdlRequest::HasPartition(req)).await {
            Ok(DdlReply::Bool(value)) => BoolResponse {
                status: Status::success(),
                value,
            },
            Ok(_) => BoolResponse {
                status: Status::unexpected("unexpected reply shape"),
                value: false,
            },
            Err(e) => BoolResponse {
                status: Status::from_error("has partition failed", &e),
                value: false,
            },
        }
    }

    pub async fn show_partitions(
        &self,
        ctx: &CancellationToken,
        req: ShowPartitionsRequest,
    ) -> ShowPartitionsResponse {
        if let Err(status) = self.check_healthy() {
            return ShowPartitionsResponse {
                status,
                partition_names: Vec::new(),
                partition_ids: Vec::new(),
            };
        }
        match self.schedule(ctx, DdlRequest::ShowPartitions(req)).await {
            Ok(DdlReply::Partitions { names, ids }) => ShowPartitionsResponse {
                status: Status::success(),
                partition_names: names,
                partition_ids: ids,
            },
            Ok(_) => ShowPartitionsResponse {
                status: Status::unexpected("unexpected reply shape"),
                partition_names: Vec::new(),
                partition_ids: Vec::new(),
            },
            Err(e) => ShowPartitionsResponse {
                status: Status::from_error("show partitions failed", &e),
                partition_names: Vec::new(),
                partition_ids: Vec::new(),
            },
        }
    }

    pub async fn create_index(
        &self,
        ctx: &CancellationToken,
        req: CreateIndexRequest,
    ) -> Status {
        if let Err(status) = self.check_healthy() {
            return status;
        }
        debug!(
            collection = %req.collection_name,
            field = %req.field_name,
            "CreateIndex"
        );
        match self.schedule(ctx, DdlRequest::CreateIndex(req)).await {
            Ok(_) => Status::success(),
            Err(e) => Status::from_error("create index failed", &e),
        }
    }

    pub async fn describe_index(
        &self,
        ctx: &CancellationToken,
        req: DescribeIndexRequest,
    ) -> DescribeIndexResponse {
        if let Err(status) = self.check_healthy() {
            return DescribeIndexResponse {
                status,
                index_descriptions: Vec::new(),
            };
        }
        match self.schedule(ctx, DdlRequest::DescribeIndex(req)).await {
            Ok(DdlReply::IndexDescriptions(index_descriptions)) => {
                if index_descriptions.is_empty() {
                    DescribeIndexResponse {
                        status: Status::index_not_exist("index not exist"),
                        index_descriptions,
                    }
                } else {
                    DescribeIndexResponse {
                        status: Status::success(),
                        index_descriptions,
                    }
                }
            }
            Ok(_) => DescribeIndexResponse {
                status: Status::unexpected("unexpected reply shape"),
                index_descriptions: Vec::new(),
            },
            Err(e) => DescribeIndexResponse {
                status: Status::from_error("describe index failed", &e),
                index_descriptions: Vec::new(),
            },
        }
    }

    pub async fn drop_index(&self, ctx: &CancellationToken, req: DropIndexRequest) -> Status {
        if let Err(status) = self.check_healthy() {
            return status;
        }
        debug!(
            collection = %req.collection_name,
            field = %req.field_name,
            index = %req.index_name,
            "DropIndex"
        );
        match self.schedule(ctx, DdlRequest::DropIndex(req)).await {
            Ok(_) => Status::success(),
            Err(e) => Status::from_error("drop index failed", &e),
        }
    }

    pub async fn describe_segment(
        &self,
        ctx: &CancellationToken,
        req: DescribeSegmentRequest,
    ) -> DescribeSegmentResponse {
        if let Err(status) = self.check_healthy() {
            return DescribeSegmentResponse {
                status,
                index_id: 0,
                build_id: 0,
                enable_index: false,
            };
        }
        match self.schedule(ctx, DdlRequest::DescribeSegment(req)).await {
            Ok(DdlReply::SegmentDescription {
                index_id,
                build_id,
                enable_index,
            }) => DescribeSegmentResponse {
                status: Status::success(),
                index_id,
                build_id,
                enable_index,
            },
            Ok(_) => DescribeSegmentResponse {
                status: Status::unexpected("unexpected reply shape"),
                index_id: 0,
                build_id: 0,
                enable_index: false,
            },
            Err(e) => DescribeSegmentResponse {
                status: Status::from_error("describe segment failed", &e),
                index_id: 0,
                build_id: 0,
                enable_index: false,
            },
        }
    }

    pub async fn show_segments(
        &self,
        ctx: &CancellationToken,
        req: ShowSegmentsRequest,
    ) -> ShowSegmentsResponse {
        if let Err(status) = self.check_healthy() {
            return ShowSegmentsResponse {
                status,
                segment_ids: Vec::new(),
            };
        }
        match self.schedule(ctx, DdlRequest::ShowSegments(req)).await {
            Ok(DdlReply::SegmentIds(segment_ids)) => ShowSegmentsResponse {
                status: Status::success(),
                segment_ids,
            },
            Ok(_) => ShowSegmentsResponse {
                status: Status::unexpected("unexpected reply shape"),
                segment_ids: Vec::new(),
            },
            Err(e) => ShowSegmentsResponse {
                status: Status::from_error("show segments failed", &e),
                segment_ids: Vec::new(),
            },
        }
    }

    /// Seal every growing segment of a collection so the next time tick
    /// flushes them
    pub async fn flush_collection(&self, collection_id: UniqueId) -> Status {
        if let Err(status) = self.check_healthy() {
            return status;
        }
        self.seg_alloc.seal_collection(collection_id).await;
        Status::success()
    }

    /// Allocate timestamps straight from the oracle, bypassing the scheduler
    pub async fn alloc_timestamp(&self, count: u32) -> AllocTimestampResponse {
        match self.tso.alloc(count).await {
            Ok(timestamp) => AllocTimestampResponse {
                status: Status::success(),
                timestamp,
                count,
            },
            Err(e) => AllocTimestampResponse {
                status: Status::from_error("alloc timestamp failed", &e),
                timestamp: 0,
                count: 0,
            },
        }
    }

    /// Allocate unique ids straight from the allocator, bypassing the scheduler
    pub async fn alloc_id(&self, count: u32) -> AllocIdResponse {
        match self.id_alloc.alloc(count).await {
            Ok((start, _)) => {
                debug!(id_start = start, count, "AllocID");
                AllocIdResponse {
                    status: Status::success(),
                    id: start,
                    count,
                }
            }
            Err(e) => AllocIdResponse {
                status: Status::from_error("alloc id failed", &e),
                id: 0,
                count,
            },
        }
    }

    pub fn get_component_states(&self) -> ComponentStates {
        let info = ComponentInfo {
            node_id: self.config.node_id,
            role: ROLE_NAME.to_string(),
            state_code: self.state_code(),
        };
        ComponentStates {
            state: info.clone(),
            subcomponent_states: vec![info],
            status: Status::success(),
        }
    }

    pub fn get_time_tick_channel(&self) -> StringResponse {
        StringResponse {
            status: Status::success(),
            value: self.config.time_tick_channel.clone(),
        }
    }

    pub fn get_dd_channel(&self) -> StringResponse {
        StringResponse {
            status: Status::success(),
            value: self.config.ddl_channel.clone(),
        }
    }

    pub fn get_statistics_channel(&self) -> StringResponse {
        StringResponse {
            status: Status::success(),
            value: self.config.statistics_channel.clone(),
        }
    }
}

async fn time_tick_loop(
    mut consumer: Consumer,
    ctx: Arc<DdlContext>,
    pipeline: Arc<FlushPipeline>,
) {
    let mut last_time_tick = 0;
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("close master time tick loop");
                return;
            }
            pack = consumer.consume() => {
                let Some(pack) = pack else {
                    warn!("proxy time tick stream closed, exit time tick loop");
                    return;
                };
                for msg in pack.msgs {
                    let Msg::TimeTick(tick) = msg else { continue };
                    if tick.timestamp <= last_time_tick {
                        warn!(
                            last_time_tick,
                            input = tick.timestamp,
                            "master time tick went back"
                        );
                    }
                    if let Err(e) = ctx.emitter.send_time_tick(tick.timestamp).await {
                        warn!(error = %e, "sending time tick failed");
                    }
                    pipeline.on_time_tick(tick.timestamp).await;
                    last_time_tick = tick.timestamp;
                }
            }
        }
    }
}

async fn segment_loop(
    mut consumer: Consumer,
    meta: Arc<MetaTable>,
    seg_alloc: Arc<SegmentAllocator>,
    pipeline: Arc<FlushPipeline>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("close data service segment loop");
                return;
            }
            pack = consumer.consume() => {
                let Some(pack) = pack else {
                    warn!("data service segment stream closed, exit loop");
                    return;
                };
                for msg in pack.msgs {
                    match msg {
                        Msg::SegmentCreated(info) => {
                            match meta.add_segment(&info).await {
                                Ok(()) => {
                                    seg_alloc.open_segment(&info).await;
                                    debug!(
                                        collection_id = info.collection_id,
                                        partition_id = info.partition_id,
                                        segment_id = info.id,
                                        "segment registered"
                                    );
                                }
                                // a duplicate announcement lands here and is
                                // dropped on the floor
                                Err(e) => warn!(
                                    segment_id = info.id,
                                    error = %e,
                                    "adding segment to meta table failed"
                                ),
                            }
                        }
                        Msg::FlushCompleted(done) => {
                            match pipeline.on_flush_completed(done.segment_id).await {
                                Ok(()) => debug!(segment_id = done.segment_id, "segment flushed"),
                                Err(e) => warn!(
                                    segment_id = done.segment_id,
                                    error = %e,
                                    "flush completion handling failed"
                                ),
                            }
                        }
                        other => debug!(ts = other.timestamp(), "unexpected message on segment channel"),
                    }
                }
            }
        }
    }
}

async fn index_worker(
    mut rx: mpsc::Receiver<IndexBuildTask>,
    builder: Arc<IndexBuilder>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("close index build loop");
                return;
            }
            task = rx.recv() => {
                let Some(task) = task else {
                    debug!("index task queue closed, exit loop");
                    return;
                };
                match builder.build(&task).await {
                    Ok(()) => debug!(
                        segment_id = task.segment_id,
                        index = %task.index_name,
                        "index build task done"
                    ),
                    Err(e) => warn!(
                        segment_id = task.segment_id,
                        index = %task.index_name,
                        error = %e,
                        "index build task failed"
                    ),
                }
            }
        }
    }
}

async fn allocator_refill_loop(
    id_alloc: Arc<GlobalIdAllocator>,
    tso: Arc<TimestampOracle>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("close allocator refill loop");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = tso.update().await {
                    warn!(error = %e, "failed to update timestamp window");
                    continue;
                }
                if let Err(e) = id_alloc.update().await {
                    warn!(error = %e, "failed to update id window");
                }
            }
        }
    }
}
