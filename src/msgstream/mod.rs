//! In-process message streams
//!
//! A thin factory over named pub-sub topics. The master holds four
//! long-lived streams: a time-tick producer fanning out to both its own tick
//! channel and the DDL channel, a DDL producer, a consumer on the proxy
//! time-tick channel, and a consumer on the data-service segment channel.

use crate::meta::{CollectionSchema, SegmentInfo};
use crate::{Result, Timestamp, UniqueId};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

/// Per-topic buffer depth
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// A batch of messages sharing a timestamp window
#[derive(Debug, Clone)]
pub struct MsgPack {
    pub begin_ts: Timestamp,
    pub end_ts: Timestamp,
    pub msgs: Vec<Msg>,
}

impl MsgPack {
    /// A single-message pack stamped with the message's own timestamp
    pub fn single(msg: Msg) -> Self {
        let ts = msg.timestamp();
        Self {
            begin_ts: ts,
            end_ts: ts,
            msgs: vec![msg],
        }
    }
}

/// Messages carried on the master's channels
#[derive(Debug, Clone)]
pub enum Msg {
    TimeTick(TimeTickMsg),
    CreateCollection(CreateCollectionMsg),
    DropCollection(DropCollectionMsg),
    CreatePartition(CreatePartitionMsg),
    DropPartition(DropPartitionMsg),
    SegmentCreated(SegmentInfo),
    FlushCompleted(FlushCompletedMsg),
}

impl Msg {
    /// The master-assigned timestamp ordering this message
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Msg::TimeTick(m) => m.timestamp,
            Msg::CreateCollection(m) => m.timestamp,
            Msg::DropCollection(m) => m.timestamp,
            Msg::CreatePartition(m) => m.timestamp,
            Msg::DropPartition(m) => m.timestamp,
            Msg::SegmentCreated(m) => m.open_time,
            Msg::FlushCompleted(m) => m.timestamp,
        }
    }
}

/// Periodic watermark broadcast downstream
#[derive(Debug, Clone)]
pub struct TimeTickMsg {
    pub timestamp: Timestamp,
    pub source_id: u64,
}

#[derive(Debug, Clone)]
pub struct CreateCollectionMsg {
    pub timestamp: Timestamp,
    pub db_name: String,
    pub collection_name: String,
    pub collection_id: UniqueId,
    pub schema: CollectionSchema,
}

#[derive(Debug, Clone)]
pub struct DropCollectionMsg {
    pub timestamp: Timestamp,
    pub db_name: String,
    pub collection_name: String,
    pub collection_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct CreatePartitionMsg {
    pub timestamp: Timestamp,
    pub db_name: String,
    pub collection_name: String,
    pub partition_name: String,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct DropPartitionMsg {
    pub timestamp: Timestamp,
    pub db_name: String,
    pub collection_name: String,
    pub partition_name: String,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
}

#[derive(Debug, Clone)]
pub struct FlushCompletedMsg {
    pub segment_id: UniqueId,
    pub timestamp: Timestamp,
}

/// Factory over named broadcast topics
///
/// Topics come into existence on first use, so producers and consumers can
/// be created in any order.
#[derive(Debug, Default)]
pub struct MsgBus {
    topics: DashMap<String, broadcast::Sender<MsgPack>>,
}

impl MsgBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<MsgPack> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(DEFAULT_TOPIC_CAPACITY).0)
            .clone()
    }

    /// A producer fanning out to a named set of channels
    pub fn producer(&self, channels: &[&str]) -> Producer {
        Producer {
            senders: channels
                .iter()
                .map(|ch| (ch.to_string(), self.sender(ch)))
                .collect(),
        }
    }

    /// A consumer on one channel under a subscription name
    pub fn consumer(&self, channel: &str, subscription: &str) -> Consumer {
        Consumer {
            channel: channel.to_string(),
            subscription: subscription.to_string(),
            rx: self.sender(channel).subscribe(),
        }
    }
}

/// Publishes packs onto a fixed set of channels
#[derive(Debug)]
pub struct Producer {
    senders: Vec<(String, broadcast::Sender<MsgPack>)>,
}

impl Producer {
    /// Fan a pack out to every channel of the set
    ///
    /// Channels without subscribers drop the pack silently; a pub-sub
    /// transport has no obligation to retain history for late joiners.
    pub fn broadcast(&self, pack: &MsgPack) -> Result<()> {
        for (_, sender) in &self.senders {
            let _ = sender.send(pack.clone());
        }
        Ok(())
    }

    /// Publish a single message
    pub fn produce(&self, msg: Msg) -> Result<()> {
        self.broadcast(&MsgPack::single(msg))
    }
}

/// Receives packs from one channel
#[derive(Debug)]
pub struct Consumer {
    channel: String,
    subscription: String,
    rx: broadcast::Receiver<MsgPack>,
}

impl Consumer {
    /// Next pack, or `None` once the channel is closed
    ///
    /// A slow consumer that lags the buffer skips ahead with a warning
    /// rather than terminating the stream.
    pub async fn consume(&mut self) -> Option<MsgPack> {
        loop {
            match self.rx.recv().await {
                Ok(pack) => return Some(pack),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %self.channel,
                        subscription = %self.subscription,
                        skipped,
                        "consumer lagged, skipping ahead"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Capability to emit time ticks and DDL events onto the wire
///
/// The scheduler depends on this narrow interface rather than on the bus
/// itself, which keeps test doubles trivial.
#[async_trait]
pub trait DdlEmitter: Send + Sync {
    async fn send_time_tick(&self, ts: Timestamp) -> Result<()>;
    async fn create_collection(&self, msg: CreateCollectionMsg) -> Result<()>;
    async fn drop_collection(&self, msg: DropCollectionMsg) -> Result<()>;
    async fn create_partition(&self, msg: CreatePartitionMsg) -> Result<()>;
    async fn drop_partition(&self, msg: DropPartitionMsg) -> Result<()>;
}

/// Bus-backed emitter holding the master's two producer streams
pub struct StreamDdlEmitter {
    node_id: u64,
    /// fans out to the master tick channel and the DDL channel
    tick_producer: Producer,
    ddl_producer: Producer,
}

impl StreamDdlEmitter {
    pub fn new(bus: &MsgBus, node_id: u64, time_tick_channel: &str, ddl_channel: &str) -> Self {
        Self {
            node_id,
            tick_producer: bus.producer(&[time_tick_channel, ddl_channel]),
            ddl_producer: bus.producer(&[ddl_channel]),
        }
    }
}

#[async_trait]
impl DdlEmitter for StreamDdlEmitter {
    async fn send_time_tick(&self, ts: Timestamp) -> Result<()> {
        self.tick_producer.produce(Msg::TimeTick(TimeTickMsg {
            timestamp: ts,
            source_id: self.node_id,
        }))
    }

    async fn create_collection(&self, msg: CreateCollectionMsg) -> Result<()> {
        self.ddl_producer.produce(Msg::CreateCollection(msg))
    }

    async fn drop_collection(&self, msg: DropCollectionMsg) -> Result<()> {
        self.ddl_producer.produce(Msg::DropCollection(msg))
    }

    async fn create_partition(&self, msg: CreatePartitionMsg) -> Result<()> {
        self.ddl_producer.produce(Msg::CreatePartition(msg))
    }

    async fn drop_partition(&self, msg: DropPartitionMsg) -> Result<()> {
        self.ddl_producer.produce(Msg::DropPartition(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_reaches_all_subscribers() {
        let bus = MsgBus::new();
        let mut rx1 = bus.consumer("tick", "sub-a");
        let mut rx2 = bus.consumer("tick", "sub-b");

        let producer = bus.producer(&["tick"]);
        producer
            .produce(Msg::TimeTick(TimeTickMsg {
                timestamp: 42,
                source_id: 1,
            }))
            .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let pack = rx.consume().await.unwrap();
            assert_eq!(pack.begin_ts, 42);
            assert_eq!(pack.msgs.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_producer_set_covers_multiple_channels() {
        let bus = MsgBus::new();
        let mut tick_rx = bus.consumer("tick", "sub");
        let mut ddl_rx = bus.consumer("ddl", "sub");

        let producer = bus.producer(&["tick", "ddl"]);
        producer
            .produce(Msg::TimeTick(TimeTickMsg {
                timestamp: 7,
                source_id: 1,
            }))
            .unwrap();

        assert_eq!(tick_rx.consume().await.unwrap().begin_ts, 7);
        assert_eq!(ddl_rx.consume().await.unwrap().begin_ts, 7);
    }

    #[tokio::test]
    async fn test_emitter_mirrors_ticks_but_not_ddl() {
        let bus = MsgBus::new();
        let mut tick_rx = bus.consumer("tick", "sub");
        let mut ddl_rx = bus.consumer("ddl", "sub");

        let emitter = StreamDdlEmitter::new(&bus, 1, "tick", "ddl");
        emitter.send_time_tick(5).await.unwrap();
        emitter
            .drop_collection(DropCollectionMsg {
                timestamp: 6,
                db_name: String::new(),
                collection_name: "coll".to_string(),
                collection_id: 42,
            })
            .await
            .unwrap();

        // the tick reaches both channels, the DDL event only the DDL channel
        assert_eq!(tick_rx.consume().await.unwrap().begin_ts, 5);
        assert_eq!(ddl_rx.consume().await.unwrap().begin_ts, 5);
        let pack = ddl_rx.consume().await.unwrap();
        assert!(matches!(&pack.msgs[0], Msg::DropCollection(m) if m.collection_id == 42));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), tick_rx.consume())
                .await
                .is_err(),
            "ddl events must not reach the tick channel"
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = MsgBus::new();
        let producer = bus.producer(&["nowhere"]);
        producer
            .produce(Msg::TimeTick(TimeTickMsg {
                timestamp: 1,
                source_id: 0,
            }))
            .unwrap();
    }
}
