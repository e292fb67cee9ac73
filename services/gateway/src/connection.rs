//! WebSocket connection management with automatic reconnection

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use types::VenueId;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{GatewayError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Reconnect schedule: 100 ms base, doubling to a 30 s cap, ±25% jitter.
const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_BACKOFF_SHIFT: u32 = 9;

/// Connection states for the WebSocket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected and receiving data
    Connected,
    /// Attempting to reconnect after failure
    Reconnecting,
}

/// Configuration for one venue connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL
    pub url: String,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Read timeout (no messages received)
    pub read_timeout: Duration,
    /// Give up after this many consecutive reconnect attempts
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

/// WebSocket connection manager with automatic reconnection.
///
/// The WS circuit breaker is driven here: every connect outcome and stream
/// error is recorded, so the facade sees stream health without owning the
/// socket.
pub struct ConnectionManager {
    venue: VenueId,
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    websocket: Arc<RwLock<Option<WsStream>>>,
    breaker: Arc<CircuitBreaker>,
    shutdown: watch::Receiver<bool>,
    attempt: Arc<RwLock<u32>>,
}

impl ConnectionManager {
    /// Create a manager; nothing connects until [`connect`] is called.
    ///
    /// [`connect`]: ConnectionManager::connect
    pub fn new(
        venue: VenueId,
        config: ConnectionConfig,
        breaker: Arc<CircuitBreaker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            venue,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            websocket: Arc::new(RwLock::new(None)),
            breaker,
            shutdown,
            attempt: Arc::new(RwLock::new(0)),
        }
    }

    /// Connect, gated by the WS breaker.
    pub async fn connect(&self) -> Result<()> {
        self.breaker.try_admit()?;
        match self.attempt_connection().await {
            Ok(()) => {
                self.breaker.on_success();
                *self.attempt.write().await = 0;
                Ok(())
            }
            Err(e) => {
                self.breaker.on_failure();
                Err(e)
            }
        }
    }

    async fn attempt_connection(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Connecting;
        tracing::info!(venue = %self.venue, url = %self.config.url, "connecting websocket");

        match timeout(self.config.connect_timeout, connect_async(&self.config.url)).await {
            Ok(Ok((ws_stream, response))) => {
                tracing::info!(
                    venue = %self.venue,
                    status = %response.status(),
                    "websocket connected"
                );
                *self.websocket.write().await = Some(ws_stream);
                *self.state.write().await = ConnectionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(GatewayError::ConnectionFailed {
                    venue: self.venue,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(GatewayError::Timeout {
                    venue: self.venue,
                    timeout_ms: self.config.connect_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Reconnect after a failure, sleeping the jittered backoff first.
    /// Returns immediately on shutdown.
    pub async fn reconnect(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Reconnecting;
        *self.websocket.write().await = None;

        let attempt = {
            let mut attempt = self.attempt.write().await;
            *attempt += 1;
            *attempt
        };
        if attempt > self.config.max_reconnect_attempts {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(GatewayError::ConnectionFailed {
                venue: self.venue,
                reason: format!(
                    "exceeded {} reconnect attempts",
                    self.config.max_reconnect_attempts
                ),
            });
        }

        let backoff = jittered_backoff(attempt);
        tracing::info!(
            venue = %self.venue,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "reconnecting after backoff"
        );

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {
                return Err(GatewayError::ConnectionFailed {
                    venue: self.venue,
                    reason: "shutdown".to_string(),
                });
            }
        }

        self.connect().await
    }

    /// Send a message on the socket.
    pub async fn send(&self, message: Message) -> Result<()> {
        let mut guard = self.websocket.write().await;
        match guard.as_mut() {
            Some(ws) => {
                ws.send(message).await.map_err(GatewayError::WebSocket)?;
                Ok(())
            }
            None => Err(GatewayError::ConnectionFailed {
                venue: self.venue,
                reason: "not connected".to_string(),
            }),
        }
    }

    /// Receive the next message, bounded by the read timeout. `Ok(None)`
    /// means the stream ended cleanly.
    pub async fn receive(&self) -> Result<Option<Message>> {
        let mut guard = self.websocket.write().await;
        let ws = guard.as_mut().ok_or(GatewayError::ConnectionFailed {
            venue: self.venue,
            reason: "not connected".to_string(),
        })?;

        match timeout(self.config.read_timeout, ws.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(msg)),
            Ok(Some(Err(e))) => {
                self.breaker.on_failure();
                Err(GatewayError::WebSocket(e))
            }
            Ok(None) => Ok(None),
            Err(_) => {
                self.breaker.on_failure();
                Err(GatewayError::Timeout {
                    venue: self.venue,
                    timeout_ms: self.config.read_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Current state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether the socket is up.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Close the socket gracefully.
    pub async fn close(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Disconnected;
        if let Some(mut ws) = self.websocket.write().await.take() {
            ws.close(None).await.ok();
        }
        Ok(())
    }
}

/// Exponential backoff with ±25% jitter: 100 ms base, factor 2, 30 s cap.
fn jittered_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    let nominal = (BASE_BACKOFF * 2_u32.pow(shift)).min(MAX_BACKOFF);
    let nominal_ms = nominal.as_millis() as f64;
    let spread = nominal_ms * 0.25;
    let jittered = nominal_ms + rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis(jittered.max(1.0) as u64)
}
