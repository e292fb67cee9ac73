//! Error types for the gateway service

use types::VenueId;
use thiserror::Error;

use crate::circuit_breaker::Channel;
use crate::rate_limit::RejectReason;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration rejected at startup
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Venue is not part of the configured set
    #[error("unknown venue: {0}")]
    UnknownVenue(String),

    /// Rate limiter refused admission
    #[error("rate limited on {venue}: {reason}")]
    RateLimited {
        /// The venue that refused admission
        venue: VenueId,
        /// Which limit tripped
        reason: RejectReason,
    },

    /// Circuit breaker is open for the channel
    #[error("circuit open for {venue} ({channel})")]
    CircuitOpen {
        /// The venue whose circuit is open
        venue: VenueId,
        /// HTTP or WS channel
        channel: Channel,
    },

    /// Half-open probe slots are all taken
    #[error("probe quota exhausted for {venue} ({channel})")]
    ProbeQuotaExhausted {
        /// The venue being probed
        venue: VenueId,
        /// HTTP or WS channel
        channel: Channel,
    },

    /// Connection-level failure talking to a venue
    #[error("connection failed for venue {venue}: {reason}")]
    ConnectionFailed {
        /// The venue that failed to connect
        venue: VenueId,
        /// Reason for the failure
        reason: String,
    },

    /// Operation exceeded its deadline
    #[error("timeout for venue {venue} after {timeout_ms}ms")]
    Timeout {
        /// The venue that timed out
        venue: VenueId,
        /// Deadline that elapsed, milliseconds
        timeout_ms: u64,
    },

    /// Venue rejected our credentials
    #[error("authentication failed for venue {venue}")]
    AuthenticationFailed {
        /// The venue where auth failed
        venue: VenueId,
    },

    /// Requested entity does not exist upstream
    #[error("not found on {venue}: {what}")]
    NotFound {
        /// The venue queried
        venue: VenueId,
        /// What was missing
        what: String,
    },

    /// Upstream returned an HTTP error status
    #[error("upstream status {status} from {venue}")]
    UpstreamStatus {
        /// The venue that answered
        venue: VenueId,
        /// HTTP status code
        status: u16,
    },

    /// Venue message could not be parsed
    #[error("parse error for venue {venue}: {message} - {error}")]
    Parse {
        /// The venue that produced the unparseable data
        venue: VenueId,
        /// What was being parsed
        message: String,
        /// Underlying error message
        error: String,
    },

    /// Canonical record failed validation
    #[error(transparent)]
    MarketData(#[from] types::MarketDataError),

    /// Envelope integrity failure
    #[error(transparent)]
    Envelope(#[from] types::EnvelopeError),

    /// Order book sequence went backwards or skipped
    #[error("sequence gap for {venue} {symbol}: last {last}, got {got}")]
    SequenceGap {
        /// The venue streaming the book
        venue: VenueId,
        /// Canonical symbol
        symbol: String,
        /// Last sequence seen
        last: u64,
        /// Sequence that arrived
        got: u64,
    },

    /// Data is older than the caller's freshness bound
    #[error("stale data for {symbol} from {source_name}: age {age_ms}ms")]
    StaleData {
        /// Canonical symbol
        symbol: String,
        /// Producing source
        source_name: String,
        /// Observed age, milliseconds
        age_ms: u64,
    },

    /// PIT store failure
    #[error("pit store error: {0}")]
    Pit(String),

    /// Repository failure
    #[error("repository error: {0}")]
    Repository(String),

    /// Event bus failure
    #[error(transparent)]
    Bus(#[from] message_bus::BusError),

    /// WebSocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not supported by this adapter
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            GatewayError::UpstreamStatus { status, .. } => *status >= 500,
            GatewayError::ConnectionFailed { .. }
            | GatewayError::Timeout { .. }
            | GatewayError::WebSocket(_)
            | GatewayError::Http(_)
            | GatewayError::Io(_)
            | GatewayError::RateLimited { .. } => true,
            _ => false,
        }
    }

    /// Whether the failure should count against the venue's circuit breaker.
    ///
    /// Admission denials and integrity failures are local conditions; only
    /// transport-level failures indict the venue.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectionFailed { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::AuthenticationFailed { .. }
                | GatewayError::UpstreamStatus { .. }
                | GatewayError::WebSocket(_)
                | GatewayError::Http(_)
                | GatewayError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_count_against_breaker() {
        let err = GatewayError::Timeout {
            venue: VenueId::Kraken,
            timeout_ms: 500,
        };
        assert!(err.counts_against_breaker());
        assert!(err.is_recoverable());

        let err = GatewayError::UnknownVenue("mtgox".to_string());
        assert!(!err.counts_against_breaker());
    }

    #[test]
    fn integrity_errors_do_not_indict_the_venue() {
        let err = GatewayError::SequenceGap {
            venue: VenueId::Binance,
            symbol: "BTCUSD".to_string(),
            last: 10,
            got: 8,
        };
        assert!(!err.counts_against_breaker());
    }
}
