//! Circuit breaker pattern for fault tolerance
//!
//! Each venue carries two breakers, one per transport channel (HTTP, WS).
//! The facade wraps REST attempts in [`CircuitBreaker::call`]; WebSocket
//! paths that cannot wrap a future drive the same state machine through
//! [`CircuitBreaker::on_success`] / [`CircuitBreaker::on_failure`] after a
//! [`CircuitBreaker::try_admit`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use types::VenueId;

use crate::error::{GatewayError, Result};

/// Transport channel a breaker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// REST requests
    Http,
    /// WebSocket streams
    Ws,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Http => f.write_str("http"),
            Channel::Ws => f.write_str("ws"),
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failing - requests are rejected
    Open,
    /// Testing recovery - limited trial requests allowed
    HalfOpen,
}

/// Observable breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures in the current episode
    pub failure_count: u32,
    /// Successful probes while half-open
    pub success_count: u32,
    /// Milliseconds since the last failure, if any
    pub last_failure_ms: Option<u64>,
    /// Exponentially weighted error rate in `[0, 1]`
    pub error_rate: f64,
    /// Times the circuit has opened over its lifetime
    pub opens: u64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    probes_in_flight: u32,
    backoff_multiplier: u32,
    error_rate: f64,
    opens: u64,
    forced: bool,
}

const ERROR_RATE_ALPHA: f64 = 0.1;
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Thread-safe circuit breaker for one (venue, channel) pair.
pub struct CircuitBreaker {
    venue: VenueId,
    channel: Channel,
    config: config::CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    pub fn new(venue: VenueId, channel: Channel, config: config::CircuitConfig) -> Self {
        Self {
            venue,
            channel,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                probes_in_flight: 0,
                backoff_multiplier: 1,
                error_rate: 0.0,
                opens: 0,
                forced: false,
            }),
        }
    }

    /// The venue this breaker guards.
    pub fn venue(&self) -> VenueId {
        self.venue
    }

    /// The channel this breaker guards.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Ask for admission. Every `Ok(())` must be answered with exactly one
    /// of [`on_success`], [`on_failure`], or [`on_neutral`], or half-open
    /// probe slots leak.
    ///
    /// [`on_success`]: CircuitBreaker::on_success
    /// [`on_failure`]: CircuitBreaker::on_failure
    /// [`on_neutral`]: CircuitBreaker::on_neutral
    pub fn try_admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if inner.forced {
                    return Err(GatewayError::CircuitOpen {
                        venue: self.venue,
                        channel: self.channel,
                    });
                }
                let dwell = self.config.timeout() * inner.backoff_multiplier;
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > dwell {
                    inner.state = CircuitState::HalfOpen;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.probes_in_flight = 1;
                    tracing::info!(
                        venue = %self.venue,
                        channel = %self.channel,
                        "circuit half-open, probing"
                    );
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        venue: self.venue,
                        channel: self.channel,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.max_probe {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(GatewayError::ProbeQuotaExhausted {
                        venue: self.venue,
                        channel: self.channel,
                    })
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.error_rate = (1.0 - ERROR_RATE_ALPHA) * inner.error_rate;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.backoff_multiplier = 1;
                    tracing::info!(
                        venue = %self.venue,
                        channel = %self.channel,
                        successes = inner.success_count,
                        "circuit closed"
                    );
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.error_rate =
            (ERROR_RATE_ALPHA + (1.0 - ERROR_RATE_ALPHA) * inner.error_rate).clamp(0.0, 1.0);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opens += 1;
                    tracing::warn!(
                        venue = %self.venue,
                        channel = %self.channel,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.state = CircuitState::Open;
                inner.opens += 1;
                inner.backoff_multiplier =
                    (inner.backoff_multiplier * 2).min(1 << MAX_BACKOFF_SHIFT);
                tracing::warn!(
                    venue = %self.venue,
                    channel = %self.channel,
                    backoff_multiplier = inner.backoff_multiplier,
                    "probe failed, circuit reopened with extended backoff"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Release an admission that completed without saying anything about
    /// the venue (e.g. a local parse failure). Keeps probe accounting
    /// balanced without moving the state machine.
    pub fn on_neutral(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Execute an operation through the breaker.
    ///
    /// Transport-level failures count against the breaker; local failures
    /// (parse, validation, admission) pass through without indicting the
    /// venue.
    pub async fn call<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.try_admit()?;

        match operation.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                if error.counts_against_breaker() {
                    self.on_failure();
                } else {
                    self.on_neutral();
                }
                Err(error)
            }
        }
    }

    /// Operator override: hold the circuit open until forced closed.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.forced = true;
        inner.last_failure = Some(Instant::now());
        inner.opens += 1;
        tracing::warn!(venue = %self.venue, channel = %self.channel, "circuit forced open");
    }

    /// Operator override: close the circuit and clear counters.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.forced = false;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.probes_in_flight = 0;
        inner.backoff_multiplier = 1;
        tracing::info!(venue = %self.venue, channel = %self.channel, "circuit forced closed");
    }

    /// Current state, without the transition check admission performs.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Observable snapshot.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_ms: inner.last_failure.map(|t| t.elapsed().as_millis() as u64),
            error_rate: inner.error_rate,
            opens: inner.opens,
        }
    }
}

/// The HTTP + WS breaker pair every venue carries.
pub struct VenueBreakers {
    /// REST channel breaker
    pub http: Arc<CircuitBreaker>,
    /// WebSocket channel breaker
    pub ws: Arc<CircuitBreaker>,
}

impl VenueBreakers {
    /// Build both breakers from the venue's circuit config pair.
    pub fn new(venue: VenueId, config: &config::VenueCircuitConfig) -> Self {
        Self {
            http: Arc::new(CircuitBreaker::new(venue, Channel::Http, config.http.clone())),
            ws: Arc::new(CircuitBreaker::new(venue, Channel::Ws, config.ws.clone())),
        }
    }

    /// A venue is healthy only when both channels are closed.
    pub fn healthy(&self) -> bool {
        self.http.state() == CircuitState::Closed && self.ws.state() == CircuitState::Closed
    }

    /// The breaker for a channel.
    pub fn channel(&self, channel: Channel) -> &Arc<CircuitBreaker> {
        match channel {
            Channel::Http => &self.http,
            Channel::Ws => &self.ws,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(failure: u32, success: u32, timeout_ms: u64, max_probe: u32) -> config::CircuitConfig {
        config::CircuitConfig {
            failure_threshold: failure,
            success_threshold: success,
            timeout_ms,
            max_probe,
            fallback_enabled: false,
            fallback_venues: Vec::new(),
        }
    }

    fn breaker(failure: u32, success: u32, timeout_ms: u64, max_probe: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            VenueId::Kraken,
            Channel::Http,
            test_config(failure, success, timeout_ms, max_probe),
        )
    }

    async fn failing_call(cb: &CircuitBreaker) -> Result<()> {
        cb.call(async {
            Err::<(), _>(GatewayError::Timeout {
                venue: VenueId::Kraken,
                timeout_ms: 1,
            })
        })
        .await
    }

    #[tokio::test]
    async fn trips_open_after_threshold_and_recovers() {
        let cb = breaker(3, 2, 10, 1);

        for _ in 0..3 {
            assert!(failing_call(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Rejected while open
        let err = cb.call(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));

        // After the dwell, a probe is admitted and two successes close it
        tokio::time::sleep(Duration::from_millis(15)).await;
        cb.call(async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.call(async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_with_extended_backoff() {
        let cb = breaker(1, 2, 40, 1);

        assert!(failing_call(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(failing_call(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // Backoff doubled: 60ms is no longer past the 80ms dwell.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = cb.call(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cb.call(async { Ok(()) }).await.unwrap();
        cb.call(async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_at_most_max_probe() {
        let cb = breaker(1, 3, 5, 2);

        assert!(failing_call(&cb).await.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;

        cb.try_admit().unwrap(); // transitions to half-open, probe 1
        cb.try_admit().unwrap(); // probe 2
        let err = cb.try_admit().unwrap_err();
        assert!(matches!(err, GatewayError::ProbeQuotaExhausted { .. }));

        // Releasing a probe frees a slot.
        cb.on_success();
        cb.try_admit().unwrap();
    }

    #[tokio::test]
    async fn closed_success_resets_failure_streak() {
        let cb = breaker(3, 1, 10, 1);

        assert!(failing_call(&cb).await.is_err());
        assert!(failing_call(&cb).await.is_err());
        cb.call(async { Ok(()) }).await.unwrap();
        assert!(failing_call(&cb).await.is_err());
        assert!(failing_call(&cb).await.is_err());
        // Streak was broken; still closed after 2 more failures.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn local_errors_do_not_trip_the_breaker() {
        let cb = breaker(1, 1, 10, 1);
        let result: Result<()> = cb
            .call(async {
                Err(GatewayError::Parse {
                    venue: VenueId::Kraken,
                    message: "trade".to_string(),
                    error: "bad json".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn force_open_blocks_until_force_close() {
        let cb = breaker(5, 1, 1, 1);
        cb.force_open();

        tokio::time::sleep(Duration::from_millis(5)).await;
        // Forced circuits do not probe, no matter how long it has been.
        assert!(cb.try_admit().is_err());

        cb.force_close();
        cb.try_admit().unwrap();
    }

    #[test]
    fn venue_pair_health_requires_both_closed() {
        let pair = VenueBreakers::new(VenueId::Binance, &config::VenueCircuitConfig::default());
        assert!(pair.healthy());
        pair.ws.force_open();
        assert!(!pair.healthy());
        pair.ws.force_close();
        assert!(pair.healthy());
    }
}
