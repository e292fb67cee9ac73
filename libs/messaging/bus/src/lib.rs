//! # Marketgate Event Bus
//!
//! ## Purpose
//!
//! Bus-neutral pub/sub carrying serialized envelopes from the gateway to
//! downstream consumers (replay, backtesting, cross-region fan-out) with
//! at-least-once delivery, per-key ordering, bounded retry, and
//! dead-lettering.
//!
//! ## Implementations
//!
//! - [`InProcessBus`]: partitioned in-memory bus used by tests and
//!   single-process deployments.
//! - [`RelayBus`]: length-framed JSON over a Unix domain socket to an
//!   external relay. Broker topology (partitions, replication) is
//!   deployment configuration, not part of this contract.
//!
//! Both honor the same [`EventBus`] trait and the same delivery guarantees:
//! messages with the same key are handled in publish order, a failing
//! handler is retried with exponential backoff, and exhausted messages land
//! on the dead-letter topic with `original_topic` / `error` / `retry_count`
//! headers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delivery;
pub mod error;
pub mod factory;
pub mod memory;
pub mod message;
pub mod relay;
pub mod retry;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use error::{BusError, Result};
pub use factory::build_bus;
pub use memory::InProcessBus;
pub use message::{
    BusMessage, DEFAULT_MAX_MESSAGE_SIZE, HEADER_ERROR, HEADER_ORIGINAL_TOPIC,
    HEADER_RETRY_COUNT,
};
pub use relay::RelayBus;
pub use retry::RetryPolicy;

/// Async message handler invoked by subscription workers.
///
/// The returned error string is retried against the bus retry policy and
/// ends up in the dead-letter `error` header once attempts are exhausted.
pub type MessageHandler =
    Arc<dyn Fn(BusMessage) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Predicate applied before a handler sees a message.
pub type MessageFilter = Arc<dyn Fn(&BusMessage) -> bool + Send + Sync>;

/// Topic creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic name
    pub name: String,
    /// Ordering units; keys hash onto partitions
    pub partitions: usize,
    /// Retention hint for broker-backed buses, hours
    #[serde(default)]
    pub retention_hours: Option<u64>,
}

impl TopicConfig {
    /// A topic with the given name and partition count.
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        Self {
            name: name.into(),
            partitions: partitions.max(1),
            retention_hours: None,
        }
    }
}

/// Observable topic state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    /// Topic name
    pub name: String,
    /// Partition count
    pub partitions: usize,
    /// Subscribed consumer groups
    pub groups: Vec<String>,
    /// Messages accepted for this topic
    pub published: u64,
}

/// Aggregate bus health snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusHealth {
    /// Whether the bus is started
    pub running: bool,
    /// Topics known to the bus
    pub topics: usize,
    /// Active (topic, group) subscriptions
    pub subscriptions: usize,
    /// Messages accepted by publish
    pub published: u64,
    /// Messages successfully handled
    pub delivered: u64,
    /// Handler retries performed
    pub retried: u64,
    /// Messages routed to the dead-letter topic
    pub dead_lettered: u64,
}

/// The bus-neutral contract every implementation honors.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Bring the bus up. Publishing and subscribing require a started bus.
    async fn start(&self) -> Result<()>;

    /// Graceful shutdown: stop accepting publishes, drain workers.
    async fn stop(&self) -> Result<()>;

    /// Aggregate health snapshot.
    async fn health(&self) -> BusHealth;

    /// Publish one message. May block up to the configured publish
    /// deadline; beyond that it fails fast with [`BusError::PublishTimeout`].
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;

    /// Publish a batch, stopping on the first failure.
    async fn publish_batch(&self, messages: Vec<BusMessage>) -> Result<()> {
        for msg in messages {
            let topic = msg.topic.clone();
            let key = msg.key.clone();
            self.publish(&topic, &key, msg.payload).await?;
        }
        Ok(())
    }

    /// Subscribe `group` to `topic`. One handler per group per partition;
    /// a second subscription for the same (topic, group) is rejected.
    async fn subscribe(&self, topic: &str, group: &str, handler: MessageHandler) -> Result<()>;

    /// Subscribe with a predicate; messages failing it are skipped without
    /// touching the handler or the retry machinery.
    async fn subscribe_with_filter(
        &self,
        topic: &str,
        group: &str,
        filter: MessageFilter,
        handler: MessageHandler,
    ) -> Result<()>;

    /// Create a topic. Idempotent for identical configs.
    async fn create_topic(&self, config: TopicConfig) -> Result<()>;

    /// Delete a topic and close its subscriptions.
    async fn delete_topic(&self, topic: &str) -> Result<()>;

    /// Observable state for one topic.
    async fn topic_info(&self, topic: &str) -> Result<TopicInfo>;
}
