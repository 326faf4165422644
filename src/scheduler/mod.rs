//! DDL scheduling
//!
//! One cooperative loop drains the DDL queue a task at a time. Every
//! mutating task must carry a timestamp strictly greater than the last
//! materialized DDL; read-only tasks still run on the loop so they observe a
//! quiescent catalog, but skip the gate.

mod task;

pub(crate) use task::execute;

use crate::allocator::{GlobalIdAllocator, TimestampOracle};
use crate::api::{
    CreateCollectionRequest, CreateIndexRequest, CreatePartitionRequest,
    DescribeCollectionRequest, DescribeIndexRequest, DescribeSegmentRequest, DropCollectionRequest,
    DropIndexRequest, DropPartitionRequest, HasCollectionRequest, HasPartitionRequest,
    IndexDescription, MsgBase, ShowCollectionsRequest, ShowPartitionsRequest, ShowSegmentsRequest,
};
use crate::config::MasterConfig;
use crate::flush::IndexBuildTask;
use crate::meta::{CollectionSchema, MetaTable};
use crate::msgstream::DdlEmitter;
use crate::services::{IndexService, ProxyService, QueryService};
use crate::{Error, Result, Timestamp, UniqueId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a DDL task may touch while executing
pub(crate) struct DdlContext {
    pub config: MasterConfig,
    pub meta: Arc<MetaTable>,
    pub id_alloc: Arc<GlobalIdAllocator>,
    pub tso: Arc<TimestampOracle>,
    pub emitter: Arc<dyn DdlEmitter>,
    pub proxy: Arc<dyn ProxyService>,
    pub query: Arc<dyn QueryService>,
    pub index_service: Arc<dyn IndexService>,
    pub index_tx: mpsc::Sender<IndexBuildTask>,
    pub shutdown: CancellationToken,
}

/// A typed DDL request body
pub(crate) enum DdlRequest {
    CreateCollection(CreateCollectionRequest),
    DropCollection(DropCollectionRequest),
    HasCollection(HasCollectionRequest),
    DescribeCollection(DescribeCollectionRequest),
    ShowCollections(ShowCollectionsRequest),
    CreatePartition(CreatePartitionRequest),
    DropPartition(DropPartitionRequest),
    HasPartition(HasPartitionRequest),
    ShowPartitions(ShowPartitionsRequest),
    CreateIndex(CreateIndexRequest),
    DescribeIndex(DescribeIndexRequest),
    DropIndex(DropIndexRequest),
    DescribeSegment(DescribeSegmentRequest),
    ShowSegments(ShowSegmentsRequest),
}

impl DdlRequest {
    fn base(&self) -> &MsgBase {
        match self {
            DdlRequest::CreateCollection(r) => &r.base,
            DdlRequest::DropCollection(r) => &r.base,
            DdlRequest::HasCollection(r) => &r.base,
            DdlRequest::DescribeCollection(r) => &r.base,
            DdlRequest::ShowCollections(r) => &r.base,
            DdlRequest::CreatePartition(r) => &r.base,
            DdlRequest::DropPartition(r) => &r.base,
            DdlRequest::HasPartition(r) => &r.base,
            DdlRequest::ShowPartitions(r) => &r.base,
            DdlRequest::CreateIndex(r) => &r.base,
            DdlRequest::DescribeIndex(r) => &r.base,
            DdlRequest::DropIndex(r) => &r.base,
            DdlRequest::DescribeSegment(r) => &r.base,
            DdlRequest::ShowSegments(r) => &r.base,
        }
    }

    /// Read-only tasks serialize with writes but skip the timestamp gate
    fn ignore_timestamp(&self) -> bool {
        matches!(
            self,
            DdlRequest::HasCollection(_)
                | DdlRequest::DescribeCollection(_)
                | DdlRequest::ShowCollections(_)
                | DdlRequest::HasPartition(_)
                | DdlRequest::ShowPartitions(_)
                | DdlRequest::DescribeIndex(_)
                | DdlRequest::DescribeSegment(_)
                | DdlRequest::ShowSegments(_)
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            DdlRequest::CreateCollection(_) => "CreateCollection",
            DdlRequest::DropCollection(_) => "DropCollection",
            DdlRequest::HasCollection(_) => "HasCollection",
            DdlRequest::DescribeCollection(_) => "DescribeCollection",
            DdlRequest::ShowCollections(_) => "ShowCollections",
            DdlRequest::CreatePartition(_) => "CreatePartition",
            DdlRequest::DropPartition(_) => "DropPartition",
            DdlRequest::HasPartition(_) => "HasPartition",
            DdlRequest::ShowPartitions(_) => "ShowPartitions",
            DdlRequest::CreateIndex(_) => "CreateIndex",
            DdlRequest::DescribeIndex(_) => "DescribeIndex",
            DdlRequest::DropIndex(_) => "DropIndex",
            DdlRequest::DescribeSegment(_) => "DescribeSegment",
            DdlRequest::ShowSegments(_) => "ShowSegments",
        }
    }
}

/// Result payload of an executed task
pub(crate) enum DdlReply {
    Done,
    Bool(bool),
    CollectionDescription {
        schema: CollectionSchema,
        collection_id: UniqueId,
    },
    CollectionNames(Vec<String>),
    Partitions {
        names: Vec<String>,
        ids: Vec<UniqueId>,
    },
    IndexDescriptions(Vec<IndexDescription>),
    SegmentDescription {
        index_id: UniqueId,
        build_id: UniqueId,
        enable_index: bool,
    },
    SegmentIds(Vec<UniqueId>),
}

/// A queued task together with its completion channel
pub(crate) struct DdlEnvelope {
    pub request: DdlRequest,
    pub reply: oneshot::Sender<Result<DdlReply>>,
}

/// The single-threaded DDL loop
pub(crate) struct DdlScheduler {
    ctx: Arc<DdlContext>,
    last_dd_timestamp: Timestamp,
}

impl DdlScheduler {
    pub fn new(ctx: Arc<DdlContext>) -> Self {
        Self {
            ctx,
            last_dd_timestamp: 0,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<DdlEnvelope>) {
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    debug!("close dd scheduler, exit task loop");
                    return;
                }
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("dd queue closed, exit task loop");
                        return;
                    };
                    self.handle(envelope).await;
                }
            }
        }
    }

    async fn handle(&mut self, envelope: DdlEnvelope) {
        let DdlEnvelope { request, reply } = envelope;
        let kind = request.kind();

        let ts = match request.base().timestamp {
            0 => match self.ctx.tso.alloc_one().await {
                Ok(ts) => ts,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            },
            ts => ts,
        };

        if !request.ignore_timestamp() && ts <= self.last_dd_timestamp {
            let _ = reply.send(Err(Error::TimestampRegression {
                input: ts,
                last: self.last_dd_timestamp,
            }));
            return;
        }

        let result = execute(&self.ctx, request, ts).await;
        if let Err(e) = &result {
            warn!(task = kind, error = %e, "ddl task failed");
        }
        let _ = reply.send(result);
        if ts > self.last_dd_timestamp {
            self.last_dd_timestamp = ts;
        }
    }
}
