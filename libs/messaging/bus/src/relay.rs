//! Relay-backed bus: length-framed JSON over a Unix domain socket
//!
//! The relay process owns broker topology (partitions, replication,
//! retention); this client honors the same [`EventBus`] contract as the
//! in-process bus. Publishes go over one connection; each subscription
//! holds its own connection announced with a subscribe frame, so the relay
//! can partition delivery per group.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::delivery::{deliver_with_retry, DeadLetterRoute, DeliveryCounters};
use crate::error::{BusError, Result};
use crate::message::BusMessage;
use crate::retry::RetryPolicy;
use crate::{BusHealth, EventBus, MessageFilter, MessageHandler, TopicConfig, TopicInfo};

const MAX_CONNECT_ATTEMPTS: u32 = 10;
const MAX_CONNECT_DELAY_MS: u64 = 30_000;

/// Wire frames exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
enum Frame {
    /// A message moving in either direction
    Publish(BusMessage),
    /// Announce a consuming connection
    Subscribe {
        topic: String,
        group: String,
        client_id: String,
    },
    /// Ask the relay to create a topic
    CreateTopic(TopicConfig),
    /// Ask the relay to drop a topic
    DeleteTopic { topic: String },
}

/// Tunables for the relay bus, derived from the `[bus]` config section.
#[derive(Debug, Clone)]
pub struct RelayBusConfig {
    /// Relay socket path (first `brokers` entry)
    pub socket_path: String,
    /// Client identifier included in subscribe frames
    pub client_id: String,
    /// Publish deadline before failing fast
    pub publish_timeout: Duration,
    /// Connect timeout per attempt
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles per attempt up to 30 s
    pub reconnect_base: Duration,
    /// Upper bound on handler wall time per attempt
    pub handler_timeout: Duration,
    /// Hard cap on a single message
    pub max_message_bytes: usize,
    /// Handler retry schedule
    pub retry: RetryPolicy,
    /// Dead-letter topic; `None` disables dead-lettering
    pub dead_letter_topic: Option<String>,
}

impl RelayBusConfig {
    /// Derive from the shared `[bus]` config section.
    ///
    /// The caller guarantees `brokers` is non-empty (config validation is
    /// fatal at startup otherwise).
    pub fn from_config(config: &config::BusConfig) -> Self {
        Self {
            socket_path: config.brokers.first().cloned().unwrap_or_default(),
            client_id: config.client_id.clone(),
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            reconnect_base: Duration::from_millis(100),
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

#[derive(Default)]
struct TopicMeta {
    partitions: usize,
    published: u64,
    groups: HashSet<String>,
}

struct RelayShared {
    config: RelayBusConfig,
    started: AtomicBool,
    published: AtomicU64,
    counters: DeliveryCounters,
    stream: Mutex<Option<UnixStream>>,
    topics: parking_lot::Mutex<HashMap<String, TopicMeta>>,
    shutdown: watch::Sender<bool>,
}

/// Relay-backed [`EventBus`] client.
pub struct RelayBus {
    shared: Arc<RelayShared>,
    subscriptions: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RelayBus {
    /// Build an unstarted relay client.
    pub fn new(config: RelayBusConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(RelayShared {
                config,
                started: AtomicBool::new(false),
                published: AtomicU64::new(0),
                counters: DeliveryCounters::default(),
                stream: Mutex::new(None),
                topics: parking_lot::Mutex::new(HashMap::new()),
                shutdown,
            }),
            subscriptions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn ensure_started(&self) -> Result<()> {
        if self.shared.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::NotStarted)
        }
    }

    /// Connect with exponential backoff, honoring shutdown.
    async fn connect_with_retry(shared: &RelayShared) -> Result<UnixStream> {
        let mut shutdown = shared.shutdown.subscribe();
        let mut attempts: u32 = 0;

        loop {
            tracing::debug!(
                path = %shared.config.socket_path,
                attempt = attempts + 1,
                "connecting to relay"
            );

            let connect = tokio::time::timeout(
                shared.config.connect_timeout,
                UnixStream::connect(&shared.config.socket_path),
            );
            match connect.await {
                Ok(Ok(stream)) => {
                    tracing::info!(path = %shared.config.socket_path, "connected to relay");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    attempts += 1;
                    if attempts >= MAX_CONNECT_ATTEMPTS {
                        return Err(BusError::ConnectionFailed(format!(
                            "relay unreachable after {MAX_CONNECT_ATTEMPTS} attempts: {e}"
                        )));
                    }
                    let base_ms = shared.config.reconnect_base.as_millis().max(1) as u64;
                    let delay = (base_ms * 2_u64.pow((attempts - 1).min(16)))
                        .min(MAX_CONNECT_DELAY_MS);
                    tracing::warn!(
                        attempt = attempts,
                        delay_ms = delay,
                        error = %e,
                        "relay connect failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = shutdown.changed() => {
                            return Err(BusError::ConnectionFailed("shutdown".to_string()));
                        }
                    }
                }
                Err(_) => {
                    return Err(BusError::ConnectionFailed(format!(
                        "relay connect timed out after {}ms",
                        shared.config.connect_timeout.as_millis()
                    )));
                }
            }
        }
    }

    async fn write_frame(stream: &mut UnixStream, frame: &Frame) -> Result<()> {
        let body = serde_json::to_vec(frame).map_err(|e| BusError::Codec(e.to_string()))?;
        let len = (body.len() as u32).to_be_bytes();
        stream
            .write_all(&len)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        stream
            .write_all(&body)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn read_frame(stream: &mut UnixStream, max_bytes: usize) -> Result<Frame> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_bytes {
            return Err(BusError::MessageTooLarge {
                size: len,
                limit: max_bytes,
            });
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| BusError::Codec(e.to_string()))
    }

    /// Send one frame on the shared publish connection, reconnecting once
    /// on a stale socket.
    async fn send_on_publish_stream(shared: &RelayShared, frame: Frame) -> Result<()> {
        let mut guard = shared.stream.lock().await;
        if guard.is_none() {
            *guard = Some(Self::connect_with_retry(shared).await?);
        }

        let stream = guard.as_mut().expect("stream populated above");
        match tokio::time::timeout(
            shared.config.publish_timeout,
            Self::write_frame(stream, &frame),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // Stale socket: reconnect and retry the write once.
                tracing::warn!(error = %e, "relay write failed, reconnecting");
                *guard = Some(Self::connect_with_retry(shared).await?);
                let stream = guard.as_mut().expect("stream repopulated");
                tokio::time::timeout(
                    shared.config.publish_timeout,
                    Self::write_frame(stream, &frame),
                )
                .await
                .map_err(|_| Self::publish_timeout(&frame, shared))?
            }
            Err(_) => Err(Self::publish_timeout(&frame, shared)),
        }
    }

    fn publish_timeout(frame: &Frame, shared: &RelayShared) -> BusError {
        let topic = match frame {
            Frame::Publish(msg) => msg.topic.clone(),
            Frame::CreateTopic(config) => config.name.clone(),
            Frame::DeleteTopic { topic } => topic.clone(),
            Frame::Subscribe { topic, .. } => topic.clone(),
        };
        BusError::PublishTimeout {
            topic,
            deadline_ms: shared.config.publish_timeout.as_millis() as u64,
        }
    }

    async fn publish_message(shared: &RelayShared, msg: BusMessage) -> Result<()> {
        {
            let mut topics = shared.topics.lock();
            let meta = topics.entry(msg.topic.clone()).or_default();
            meta.published += 1;
        }
        shared.published.fetch_add(1, Ordering::Relaxed);
        Self::send_on_publish_stream(shared, Frame::Publish(msg)).await
    }

    fn spawn_consumer(
        &self,
        topic: String,
        group: String,
        filter: Option<MessageFilter>,
        handler: MessageHandler,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = shared.shutdown.subscribe();

        tokio::spawn(async move {
            let route = shared
                .config
                .dead_letter_topic
                .as_ref()
                .map(|topic| DeadLetterRoute {
                    topic: topic.clone(),
                });

            'reconnect: while !*shutdown.borrow() {
                let mut stream = match Self::connect_with_retry(&shared).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(topic = %topic, group = %group, error = %e,
                            "consumer could not reach relay, giving up");
                        return;
                    }
                };

                let announce = Frame::Subscribe {
                    topic: topic.clone(),
                    group: group.clone(),
                    client_id: shared.config.client_id.clone(),
                };
                if let Err(e) = Self::write_frame(&mut stream, &announce).await {
                    tracing::warn!(error = %e, "subscribe announce failed, reconnecting");
                    continue 'reconnect;
                }

                loop {
                    let frame = tokio::select! {
                        _ = shutdown.changed() => return,
                        frame = Self::read_frame(&mut stream, shared.config.max_message_bytes) => frame,
                    };

                    let msg = match frame {
                        Ok(Frame::Publish(msg)) => msg,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(topic = %topic, group = %group, error = %e,
                                "relay read failed, reconnecting");
                            continue 'reconnect;
                        }
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
                            async move { RelayBus::publish_message(&publisher, dead).await }
                        },
                    )
                    .await;
                }
            }
        })
    }
}

#[async_trait]
impl EventBus for RelayBus {
    async fn start(&self) -> Result<()> {
        let stream = Self::connect_with_retry(&self.shared).await?;
        *self.shared.stream.lock().await = Some(stream);
        self.shared.started.store(true, Ordering::Release);

        if let Some(dlq) = self.shared.config.dead_letter_topic.clone() {
            self.create_topic(TopicConfig::new(dlq, 1)).await?;
        }
        tracing::info!(path = %self.shared.config.socket_path, "relay bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shared.started.store(false, Ordering::Release);
        let _ = self.shared.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self.subscriptions.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
        if let Some(mut stream) = self.shared.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        tracing::info!("relay bus stopped");
        Ok(())
    }

    async fn health(&self) -> BusHealth {
        let (topics, subscriptions) = {
            let topics = self.shared.topics.lock();
            let subs = topics.values().map(|t| t.groups.len()).sum();
            (topics.len(), subs)
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
        Self::publish_message(&self.shared, BusMessage::new(topic, key, payload)).await
    }

    async fn subscribe(&self, topic: &str, group: &str, handler: MessageHandler) -> Result<()> {
        self.ensure_started()?;
        {
            let mut topics = self.shared.topics.lock();
            let meta = topics.entry(topic.to_string()).or_default();
            if !meta.groups.insert(group.to_string()) {
                return Err(BusError::GroupExists {
                    topic: topic.to_string(),
                    group: group.to_string(),
                });
            }
        }
        let handle = self.spawn_consumer(topic.to_string(), group.to_string(), None, handler);
        self.subscriptions.lock().push(handle);
        Ok(())
    }

    async fn subscribe_with_filter(
        &self,
        topic: &str,
        group: &str,
        filter: MessageFilter,
        handler: MessageHandler,
    ) -> Result<()> {
        self.ensure_started()?;
        {
            let mut topics = self.shared.topics.lock();
            let meta = topics.entry(topic.to_string()).or_default();
            if !meta.groups.insert(group.to_string()) {
                return Err(BusError::GroupExists {
                    topic: topic.to_string(),
                    group: group.to_string(),
                });
            }
        }
        let handle =
            self.spawn_consumer(topic.to_string(), group.to_string(), Some(filter), handler);
        self.subscriptions.lock().push(handle);
        Ok(())
    }

    async fn create_topic(&self, config: TopicConfig) -> Result<()> {
        self.ensure_started()?;
        {
            let mut topics = self.shared.topics.lock();
            let meta = topics.entry(config.name.clone()).or_default();
            meta.partitions = config.partitions;
        }
        Self::send_on_publish_stream(&self.shared, Frame::CreateTopic(config)).await
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.ensure_started()?;
        if self.shared.topics.lock().remove(topic).is_none() {
            return Err(BusError::TopicMissing(topic.to_string()));
        }
        Self::send_on_publish_stream(
            &self.shared,
            Frame::DeleteTopic {
                topic: topic.to_string(),
            },
        )
        .await
    }

    async fn topic_info(&self, topic: &str) -> Result<TopicInfo> {
        let topics = self.shared.topics.lock();
        let meta = topics
            .get(topic)
            .ok_or_else(|| BusError::TopicMissing(topic.to_string()))?;
        Ok(TopicInfo {
            name: topic.to_string(),
            partitions: meta.partitions.max(1),
            groups: meta.groups.iter().cloned().collect(),
            published: meta.published,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal relay double: accepts connections, records published frames,
    /// and echoes publishes back to subscribed connections on the same
    /// topic.
    async fn spawn_relay_double(path: std::path::PathBuf) -> JoinHandle<Vec<Frame>> {
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let mut frames = Vec::new();
            let (mut publisher, _) = listener.accept().await.unwrap();

            // Read frames from the publisher connection until it closes.
            loop {
                match RelayBus::read_frame(&mut publisher, crate::DEFAULT_MAX_MESSAGE_SIZE).await
                {
                    Ok(frame) => frames.push(frame),
                    Err(_) => break,
                }
            }
            frames
        })
    }

    fn test_config(path: &std::path::Path) -> RelayBusConfig {
        RelayBusConfig {
            socket_path: path.display().to_string(),
            client_id: "test".to_string(),
            publish_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            reconnect_base: Duration::from_millis(1),
            handler_timeout: Duration::from_secs(1),
            max_message_bytes: crate::DEFAULT_MAX_MESSAGE_SIZE,
            retry: RetryPolicy::default(),
            dead_letter_topic: None,
        }
    }

    #[tokio::test]
    async fn publish_sends_length_framed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let relay = spawn_relay_double(path.clone()).await;

        let bus = RelayBus::new(test_config(&path));
        bus.start().await.unwrap();
        bus.publish("trades", "BTCUSD", b"tick".to_vec()).await.unwrap();
        bus.stop().await.unwrap();

        let frames = relay.await.unwrap();
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::Publish(msg) if msg.topic == "trades" && msg.key == "BTCUSD"
        )));
    }

    #[tokio::test]
    async fn start_fails_without_relay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let mut config = test_config(&path);
        config.connect_timeout = Duration::from_millis(50);

        let bus = RelayBus::new(config);
        // The socket never exists, so every attempt errors immediately and
        // the backoff ladder runs out.
        let err = bus.start().await.unwrap_err();
        assert!(matches!(err, BusError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn publish_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let bus = RelayBus::new(test_config(&path));
        assert!(matches!(
            bus.publish("trades", "k", vec![1]).await.unwrap_err(),
            BusError::NotStarted
        ));
    }
}
