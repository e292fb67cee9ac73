//! Per-venue health tracking
//!
//! Degradation is communicated exclusively through status transitions on
//! [`VenueHealth`]; there is no global "degraded" flag anywhere in the
//! gateway. Error rate and latency are exponentially weighted so a venue
//! recovers visibility quickly once it behaves again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use types::VenueId;

/// EMA coefficient for the error rate (1 = error, 0 = success).
const ERROR_ALPHA: f64 = 0.1;
/// EMA coefficient approximating p99 latency from observed samples.
const LATENCY_ALPHA: f64 = 0.2;

/// Venue availability buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Operating normally
    Healthy,
    /// Impaired but usable
    Degraded,
    /// Not answering at all
    Offline,
    /// Never seen
    Unknown,
}

/// Health record for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueHealth {
    /// The venue this record describes
    pub venue: VenueId,
    /// Current availability bucket
    pub status: HealthState,
    /// Last time any data or response arrived
    pub last_seen: Option<DateTime<Utc>>,
    /// EMA error rate, clamped to `[0, 1]`
    pub error_rate: f64,
    /// EMA-approximated p99 latency, milliseconds
    pub p99_latency_ms: f64,
    /// WebSocket currently connected
    pub ws_connected: bool,
    /// REST surface currently answering
    pub rest_healthy: bool,
    /// Operator hint derived from the numbers
    pub recommendation: String,
}

impl VenueHealth {
    /// Fresh, never-seen record.
    pub fn unknown(venue: VenueId) -> Self {
        Self {
            venue,
            status: HealthState::Unknown,
            last_seen: None,
            error_rate: 0.0,
            p99_latency_ms: 0.0,
            ws_connected: false,
            rest_healthy: true,
            recommendation: String::new(),
        }
    }

    /// Fold one request outcome into the EMAs and refresh the status.
    pub fn record_outcome(&mut self, success: bool, latency_ms: Option<f64>) {
        let error = if success { 0.0 } else { 1.0 };
        self.error_rate =
            (ERROR_ALPHA * error + (1.0 - ERROR_ALPHA) * self.error_rate).clamp(0.0, 1.0);
        if let Some(latency) = latency_ms {
            if self.p99_latency_ms == 0.0 {
                self.p99_latency_ms = latency;
            } else {
                self.p99_latency_ms =
                    LATENCY_ALPHA * latency + (1.0 - LATENCY_ALPHA) * self.p99_latency_ms;
            }
        }
        if success {
            self.last_seen = Some(Utc::now());
            self.rest_healthy = true;
        }
        self.refresh();
    }

    /// Record a WebSocket connection state change.
    pub fn set_ws_connected(&mut self, connected: bool) {
        self.ws_connected = connected;
        if connected {
            self.last_seen = Some(Utc::now());
        }
        self.refresh();
    }

    /// Record REST surface availability.
    pub fn set_rest_healthy(&mut self, healthy: bool) {
        self.rest_healthy = healthy;
        self.refresh();
    }

    /// Note that venue data arrived (stream tick, REST body).
    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
        self.refresh();
    }

    /// Mark the venue stale when nothing has arrived within `max_silence`.
    pub fn check_staleness(&mut self, max_silence: chrono::Duration) {
        if let Some(last_seen) = self.last_seen {
            if Utc::now() - last_seen > max_silence && self.status == HealthState::Healthy {
                self.status = HealthState::Degraded;
                self.recommendation = "no recent data; consider resubscribing".to_string();
                tracing::warn!(venue = %self.venue, "venue went quiet, marked degraded");
            }
        }
    }

    /// Recompute status and recommendation from the current numbers.
    fn refresh(&mut self) {
        let (status, recommendation) = if !self.ws_connected && !self.rest_healthy {
            (HealthState::Offline, "exclude venue until it answers".to_string())
        } else if self.error_rate > 0.5 {
            (
                HealthState::Degraded,
                "halve request size and prefer fallbacks".to_string(),
            )
        } else if self.error_rate > 0.2 || !self.rest_healthy || !self.ws_connected {
            (HealthState::Degraded, "reduce request rate".to_string())
        } else if self.last_seen.is_some() {
            (HealthState::Healthy, String::new())
        } else {
            (HealthState::Unknown, String::new())
        };
        self.status = status;
        self.recommendation = recommendation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_move_the_error_ema() {
        let mut health = VenueHealth::unknown(VenueId::Kraken);
        health.set_ws_connected(true);

        health.record_outcome(true, Some(20.0));
        assert_eq!(health.status, HealthState::Healthy);
        assert!(health.error_rate < 0.01);

        for _ in 0..10 {
            health.record_outcome(false, None);
        }
        assert!(health.error_rate > 0.5);
        assert_eq!(health.status, HealthState::Degraded);
        assert!(health.recommendation.contains("halve"));

        for _ in 0..30 {
            health.record_outcome(true, Some(20.0));
        }
        assert_eq!(health.status, HealthState::Healthy);
    }

    #[test]
    fn latency_ema_tracks_samples() {
        let mut health = VenueHealth::unknown(VenueId::Binance);
        health.record_outcome(true, Some(100.0));
        assert!((health.p99_latency_ms - 100.0).abs() < f64::EPSILON);

        health.record_outcome(true, Some(200.0));
        assert!(health.p99_latency_ms > 100.0 && health.p99_latency_ms < 200.0);
    }

    #[test]
    fn offline_when_both_surfaces_down() {
        let mut health = VenueHealth::unknown(VenueId::Coinbase);
        health.touch();
        health.set_ws_connected(false);
        health.set_rest_healthy(false);
        assert_eq!(health.status, HealthState::Offline);
    }

    #[test]
    fn silence_degrades_a_healthy_venue() {
        let mut health = VenueHealth::unknown(VenueId::Kraken);
        health.set_ws_connected(true);
        health.record_outcome(true, None);
        assert_eq!(health.status, HealthState::Healthy);

        health.last_seen = Some(Utc::now() - chrono::Duration::seconds(30));
        health.check_staleness(chrono::Duration::seconds(10));
        assert_eq!(health.status, HealthState::Degraded);
    }
}
