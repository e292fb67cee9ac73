//! In-process bus: partitioned mpsc fan-out with the full delivery contract
//!
//! Used by tests and single-process deployments. Each (group, partition)
//! pair gets its own bounded channel and worker task, which is what makes
//! the per-key ordering guarantee hold: a key always hashes to the same
//! partition, and a partition is drained by exactly one worker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::delivery::{deliver_with_retry, partition_for, DeadLetterRoute, DeliveryCounters};
use crate::error::{BusError, Result};
use crate::message::BusMessage;
use crate::retry::RetryPolicy;
use crate::{BusHealth, EventBus, MessageFilter, MessageHandler, TopicConfig, TopicInfo};

/// Tunables for the in-process bus, derived from the `[bus]` config section.
#[derive(Debug, Clone)]
pub struct InProcessBusConfig {
    /// Publish deadline before failing fast
    pub publish_timeout: Duration,
    /// Per-(group, partition) channel capacity
    pub buffer_capacity: usize,
    /// Default partitions for auto-created topics
    pub default_partitions: usize,
    /// Upper bound on handler wall time per attempt
    pub handler_timeout: Duration,
    /// Hard cap on a single message
    pub max_message_bytes: usize,
    /// Handler retry schedule
    pub retry: RetryPolicy,
    /// Dead-letter topic; `None` disables dead-lettering
    pub dead_letter_topic: Option<String>,
}

impl Default for InProcessBusConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            buffer_capacity: 1024,
            default_partitions: 4,
            handler_timeout: Duration::from_secs(30),
            max_message_bytes: crate::DEFAULT_MAX_MESSAGE_SIZE,
            retry: RetryPolicy::default(),
            dead_letter_topic: Some("marketgate.dlq".to_string()),
        }
    }
}

impl InProcessBusConfig {
    /// Derive from the shared `[bus]` config section.
    pub fn from_config(config: &config::BusConfig) -> Self {
        Self {
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
            buffer_capacity: 1024,
            default_partitions: config.subscription_workers.max(1),
            handler_timeout: Duration::from_millis(config.consumer.session_timeout_ms),
            max_message_bytes: config.producer.max_message_bytes,
            retry: RetryPolicy::from_config(&config.retry),
            dead_letter_topic: config
                .dead_letter
                .enabled
                .then(|| config.dead_letter.topic.clone()),
        }
    }
}

struct GroupState {
    senders: Vec<mpsc::Sender<BusMessage>>,
    workers: Vec<JoinHandle<()>>,
}

struct TopicState {
    partitions: usize,
    published: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, TopicState>,
}

struct Shared {
    config: InProcessBusConfig,
    started: AtomicBool,
    published: AtomicU64,
    counters: DeliveryCounters,
    // Critical sections never await; sender clones are taken out before
    // any send_timeout.
    registry: parking_lot::Mutex<Registry>,
    shutdown: watch::Sender<bool>,
}

/// Partitioned in-memory bus implementing the full [`EventBus`] contract.
pub struct InProcessBus {
    shared: Arc<Shared>,
}

impl InProcessBus {
    /// Build an unstarted bus.
    pub fn new(config: InProcessBusConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                started: AtomicBool::new(false),
                published: AtomicU64::new(0),
                counters: DeliveryCounters::default(),
                registry: parking_lot::Mutex::new(Registry::default()),
                shutdown,
            }),
        }
    }

    /// Build with defaults; convenient in tests.
    pub fn with_defaults() -> Self {
        Self::new(InProcessBusConfig::default())
    }

    fn ensure_started(&self) -> Result<()> {
        if self.shared.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::NotStarted)
        }
    }

    /// Route a message to every subscribed group's partition channel.
    async fn route(shared: &Arc<Shared>, msg: BusMessage) -> Result<()> {
        let (senders, deadline) = {
            let mut registry = shared.registry.lock();
            let topic = registry
                .topics
                .get_mut(&msg.topic)
                .ok_or_else(|| BusError::TopicMissing(msg.topic.clone()))?;
            topic.published += 1;

            let partition = partition_for(&msg.key, topic.partitions);
            let senders: Vec<mpsc::Sender<BusMessage>> = topic
                .groups
                .values()
                .filter_map(|group| group.senders.get(partition).cloned())
                .collect();
            (senders, shared.config.publish_timeout)
        };
        shared.published.fetch_add(1, Ordering::Relaxed);

        for sender in senders {
            match sender.send_timeout(msg.clone(), deadline).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    return Err(BusError::PublishTimeout {
                        topic: msg.topic.clone(),
                        deadline_ms: deadline.as_millis() as u64,
                    });
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    return Err(BusError::ConsumerClosed(msg.topic.clone()));
                }
            }
        }
        Ok(())
    }

    fn spawn_workers(
        shared: &Arc<Shared>,
        topic: &str,
        group: &str,
        partitions: usize,
        filter: Option<MessageFilter>,
        handler: MessageHandler,
    ) -> GroupState {
        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);

        for partition in 0..partitions {
            let (tx, mut rx) = mpsc::channel::<BusMessage>(shared.config.buffer_capacity);
            senders.push(tx);

            let shared = Arc::clone(shared);
            let handler = handler.clone();
            let filter = filter.clone();
            let topic = topic.to_string();
            let group = group.to_string();
            let mut shutdown = shared.shutdown.subscribe();

            workers.push(tokio::spawn(async move {
                let route = shared
                    .config
                    .dead_letter_topic
                    .as_ref()
                    .map(|topic| DeadLetterRoute {
                        topic: topic.clone(),
                    });

                loop {
                    let msg = tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                        msg = rx.recv() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };

                    let publisher = Arc::clone(&shared);
                    deliver_with_retry(
                        msg,
                        filter.as_ref(),
                        &handler,
                        shared.config.handler_timeout,
                        &shared.config.retry,
                        route.as_ref(),
                        &shared.counters,
                        |dead| {
                            let publisher = Arc::clone(&publisher);
                            async move { InProcessBus::route(&publisher, dead).await }
                        },
                    )
                    .await;
                }

                tracing::debug!(topic = %topic, group = %group, partition, "worker stopped");
            }));
        }

        GroupState { senders, workers }
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn start(&self) -> Result<()> {
        self.shared.started.store(true, Ordering::Release);
        if let Some(dlq) = self.shared.config.dead_letter_topic.clone() {
            // The dead-letter topic always exists once the bus is up.
            self.create_topic(TopicConfig::new(dlq, 1)).await?;
        }
        tracing::info!("in-process bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shared.started.store(false, Ordering::Release);
        let _ = self.shared.shutdown.send(true);

        let workers: Vec<JoinHandle<()>> = {
            let mut registry = self.shared.registry.lock();
            registry
                .topics
                .drain()
                .flat_map(|(_, topic)| topic.groups.into_values())
                .flat_map(|group| group.workers)
                .collect()
        };
        for worker in workers {
            // Senders were dropped with the registry; recv() unblocks.
            let _ = tokio::time::timeout(Duration::from_secs(1), worker).await;
        }
        tracing::info!("in-process bus stopped");
        Ok(())
    }

    async fn health(&self) -> BusHealth {
        let (topics, subscriptions) = {
            let registry = self.shared.registry.lock();
            let subs = registry.topics.values().map(|t| t.groups.len()).sum();
            (registry.topics.len(), subs)
        };
        BusHealth {
            running: self.shared.started.load(Ordering::Acquire),
            topics,
            subscriptions,
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.counters.delivered.load(Ordering::Relaxed),
            retried: self.shared.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.shared.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_started()?;
        if payload.len() > self.shared.config.max_message_bytes {
            return Err(BusError::MessageTooLarge {
                size: payload.len(),
                limit: self.shared.config.max_message_bytes,
            });
        }
        let msg = BusMessage::new(topic, key, payload);
        Self::route(&self.shared, msg).await
    }

    async fn subscribe(&self, topic: &str, group: &str, handler: MessageHandler) -> Result<()> {
        self.subscribe_with_filter_impl(topic, group, None, handler)
    }

    async fn subscribe_with_filter(
        &self,
        topic: &str,
        group: &str,
        filter: MessageFilter,
        handler: MessageHandler,
    ) -> Result<()> {
        self.subscribe_with_filter_impl(topic, group, Some(filter), handler)
    }

    async fn create_topic(&self, config: TopicConfig) -> Result<()> {
        let mut registry = self.shared.registry.lock();
        registry
            .topics
            .entry(config.name.clone())
            .or_insert_with(|| TopicState {
                partitions: config.partitions.max(1),
                published: 0,
                groups: HashMap::new(),
            });
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        let state = {
            let mut registry = self.shared.registry.lock();
            registry.topics.remove(topic)
        };
        match state {
            // Dropping the state drops every sender; workers drain what is
            // buffered and exit on the closed channel.
            Some(state) => {
                drop(state);
                Ok(())
            }
            None => Err(BusError::TopicMissing(topic.to_string())),
        }
    }

    async fn topic_info(&self, topic: &str) -> Result<TopicInfo> {
        let registry = self.shared.registry.lock();
        let state = registry
            .topics
            .get(topic)
            .ok_or_else(|| BusError::TopicMissing(topic.to_string()))?;
        Ok(TopicInfo {
            name: topic.to_string(),
            partitions: state.partitions,
            groups: state.groups.keys().cloned().collect(),
            published: state.published,
        })
    }
}

impl InProcessBus {
    fn subscribe_with_filter_impl(
        &self,
        topic: &str,
        group: &str,
        filter: Option<MessageFilter>,
        handler: MessageHandler,
    ) -> Result<()> {
        self.ensure_started()?;

        let partitions = {
            let registry = self.shared.registry.lock();
            let state = registry
                .topics
                .get(topic)
                .ok_or_else(|| BusError::TopicMissing(topic.to_string()))?;
            if state.groups.contains_key(group) {
                return Err(BusError::GroupExists {
                    topic: topic.to_string(),
                    group: group.to_string(),
                });
            }
            state.partitions
        };

        // Workers are spawned outside the registry lock; the insert below
        // re-checks for a racing subscriber.
        let workers = Self::spawn_workers(&self.shared, topic, group, partitions, filter, handler);

        let mut registry = self.shared.registry.lock();
        let state = registry
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::TopicMissing(topic.to_string()))?;
        if state.groups.contains_key(group) {
            for worker in workers.workers {
                worker.abort();
            }
            return Err(BusError::GroupExists {
                topic: topic.to_string(),
                group: group.to_string(),
            });
        }
        state.groups.insert(group.to_string(), workers);
        tracing::debug!(topic = %topic, group = %group, partitions, "subscription added");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler(
        log: Arc<Mutex<Vec<BusMessage>>>,
    ) -> MessageHandler {
        Arc::new(move |msg| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(msg);
                Ok(())
            })
        })
    }

    async fn started_bus() -> InProcessBus {
        let bus = InProcessBus::with_defaults();
        bus.start().await.unwrap();
        bus
    }

    #[tokio::test]
    async fn publish_requires_start() {
        let bus = InProcessBus::with_defaults();
        let err = bus.publish("trades", "k", vec![1]).await.unwrap_err();
        assert!(matches!(err, BusError::NotStarted));
    }

    #[tokio::test]
    async fn publish_to_missing_topic_fails() {
        let bus = started_bus().await;
        let err = bus.publish("nope", "k", vec![1]).await.unwrap_err();
        assert!(matches!(err, BusError::TopicMissing(_)));
    }

    #[tokio::test]
    async fn same_key_is_delivered_in_order() {
        let bus = started_bus().await;
        bus.create_topic(TopicConfig::new("trades", 4)).await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("trades", "scanner", recording_handler(log.clone()))
            .await
            .unwrap();

        for i in 0..50u8 {
            bus.publish("trades", "BTCUSD", vec![i]).await.unwrap();
        }

        // Drain: ordering within a key means the log must be 0..50.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if log.lock().unwrap().len() == 50 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let seen: Vec<u8> = log.lock().unwrap().iter().map(|m| m.payload[0]).collect();
        assert_eq!(seen, (0..50).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn each_group_sees_every_message() {
        let bus = started_bus().await;
        bus.create_topic(TopicConfig::new("klines", 2)).await.unwrap();

        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("klines", "group-a", recording_handler(a.clone()))
            .await
            .unwrap();
        bus.subscribe("klines", "group-b", recording_handler(b.clone()))
            .await
            .unwrap();

        bus.publish("klines", "ETHUSD", vec![7]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while a.lock().unwrap().len() < 1 || b.lock().unwrap().len() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_group_is_rejected() {
        let bus = started_bus().await;
        bus.create_topic(TopicConfig::new("trades", 1)).await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("trades", "g", recording_handler(log.clone()))
            .await
            .unwrap();
        let err = bus
            .subscribe("trades", "g", recording_handler(log))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::GroupExists { .. }));
    }

    #[tokio::test]
    async fn failing_handler_ends_on_dlq_with_headers() {
        let mut bus_config = InProcessBusConfig::default();
        bus_config.retry = RetryPolicy::from_config(&config::BusRetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            factor: 2.0,
            jitter: false,
        });
        let bus = InProcessBus::new(bus_config);
        bus.start().await.unwrap();
        bus.create_topic(TopicConfig::new("trades", 1)).await.unwrap();

        let dead = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("marketgate.dlq", "graveyard", recording_handler(dead.clone()))
            .await
            .unwrap();

        let failing: MessageHandler =
            Arc::new(|_msg| Box::pin(async { Err("poison".to_string()) }));
        bus.subscribe("trades", "scanner", failing).await.unwrap();

        bus.publish("trades", "BTCUSD", vec![9]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while dead.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let msg = dead.lock().unwrap().remove(0);
        assert_eq!(msg.headers[crate::HEADER_ORIGINAL_TOPIC], "trades");
        assert_eq!(msg.headers[crate::HEADER_ERROR], "poison");
        assert_eq!(msg.headers[crate::HEADER_RETRY_COUNT], "2");

        let health = bus.health().await;
        assert_eq!(health.dead_lettered, 1);
        assert!(health.retried >= 2);
    }

    #[tokio::test]
    async fn filter_skips_unwanted_keys() {
        let bus = started_bus().await;
        bus.create_topic(TopicConfig::new("trades", 2)).await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let filter: MessageFilter = Arc::new(|msg| msg.key == "BTCUSD");
        bus.subscribe_with_filter("trades", "g", filter, recording_handler(log.clone()))
            .await
            .unwrap();

        bus.publish("trades", "ETHUSD", vec![1]).await.unwrap();
        bus.publish("trades", "BTCUSD", vec![2]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while log.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, "BTCUSD");
    }

    #[tokio::test]
    async fn topic_info_reports_groups_and_counts() {
        let bus = started_bus().await;
        bus.create_topic(TopicConfig::new("trades", 3)).await.unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("trades", "g1", recording_handler(log)).await.unwrap();
        bus.publish("trades", "k", vec![1]).await.unwrap();

        let info = bus.topic_info("trades").await.unwrap();
        assert_eq!(info.partitions, 3);
        assert_eq!(info.groups, vec!["g1".to_string()]);
        assert_eq!(info.published, 1);

        assert!(matches!(
            bus.topic_info("absent").await.unwrap_err(),
            BusError::TopicMissing(_)
        ));
    }

    #[tokio::test]
    async fn stop_halts_delivery() {
        let bus = started_bus().await;
        bus.create_topic(TopicConfig::new("trades", 1)).await.unwrap();
        bus.stop().await.unwrap();
        let err = bus.publish("trades", "k", vec![1]).await.unwrap_err();
        assert!(matches!(err, BusError::NotStarted));
        assert!(!bus.health().await.running);
    }
}
