//! Boundary to the partitioned publish/subscribe broker.
//!
//! Callers and clients only talk to the broker through these traits. The
//! [`memory`] module provides an in-process implementation used by the demo
//! binary and the test suite.

pub mod memory;

pub use memory::{DeadLetter, InMemoryBroker, InMemoryBrokerOptions, InMemoryBrokerStats};

use crate::error::BrokerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Redelivery count treated as "retry forever" by notice consumer groups.
pub const UNLIMITED_RECONSUME_TIMES: u32 = 2_147_483_647;

/// A message handed to [`Producer::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub tag: String,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
    /// 1-based broker delay level; `None` delivers immediately.
    pub delay_level: Option<u8>,
    /// Explicit target queue; `None` lets the producer pick one.
    pub queue: Option<usize>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, tag: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            tag: tag.into(),
            body,
            properties: BTreeMap::new(),
            delay_level: None,
            queue: None,
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_delay_level(mut self, level: u8) -> Self {
        self.delay_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: usize) -> Self {
        self.queue = Some(queue);
        self
    }
}

/// A message as seen by a [`MessageListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message_id: String,
    pub topic: String,
    pub tag: String,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
    pub queue: usize,
    /// Client time (epoch millis) at which the producer submitted the message.
    pub born_at: i64,
    pub reconsume_times: u32,
}

impl DeliveredMessage {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Broker acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub topic: String,
    pub queue: usize,
}

/// How a consumer group receives messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeMode {
    /// Messages are processed in parallel, bounded by the group's thread count.
    Concurrent,
    /// One message at a time per queue, in queue order.
    Orderly,
    /// Every instance of the group receives every message.
    Broadcast,
}

/// Listener verdict for a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    Success,
    /// Processing failed; the broker may redeliver up to the group's limit.
    Retry,
}

/// Everything needed to start a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub group: String,
    pub mode: ConsumeMode,
    /// Topic to tag expression (`*` or `a||b`).
    pub subscriptions: BTreeMap<String, String>,
    pub threads: usize,
    pub max_reconsume_times: u32,
    pub consume_timeout: Duration,
}

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn consume(&self, message: &DeliveredMessage) -> ConsumeStatus;
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn group(&self) -> &str;

    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt, BrokerError>;

    /// Number of queues backing `topic`.
    async fn queue_count(&self, topic: &str) -> Result<usize, BrokerError>;

    async fn shutdown(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn group(&self) -> &str;

    async fn shutdown(&self);
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn create_producer(&self, group: &str) -> Result<Arc<dyn Producer>, BrokerError>;

    /// Create `topic` with `queues` queues. Existing topics are left as they are.
    async fn create_topic(&self, topic: &str, queues: usize) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        spec: ConsumerSpec,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Arc<dyn Consumer>, BrokerError>;

    /// Supported delay levels, level 1 first.
    fn delay_levels(&self) -> Vec<Duration>;
}
