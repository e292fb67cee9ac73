//! # Marketgate Configuration
//!
//! ## Purpose
//!
//! One closed configuration record for the whole access layer, parsed from
//! TOML and validated exactly once at startup. There is no reflective
//! option discovery: every recognized key is a struct field, and anything
//! else is either rejected (strict mode) or warned about (lenient mode).
//!
//! ## Sections
//!
//! `[hot]`, `[warm]`, `[cache]`, `[rate_limits.<venue>]`,
//! `[circuits.<venue>.<http|ws>]`, `[pit]`, `[bus]` (with nested
//! `producer`, `consumer`, `retry`, `dead_letter`), `[repository]`.
//!
//! Durations follow the `*_ms` / `*_secs` integer convention used across
//! the workspace; accessor methods hand out `std::time::Duration`.

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use types::VenueId;

/// Configuration loading and validation failures. All of these are fatal at
/// startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Offending path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or shape error
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Strict mode saw a key outside the closed record
    #[error("unknown configuration keys: {}", keys.join(", "))]
    UnknownKeys {
        /// Fully-qualified offending keys
        keys: Vec<String>,
    },

    /// A section named a venue outside the closed set
    #[error("unknown venue {venue:?} in section {section}")]
    UnknownVenue {
        /// Offending venue name
        venue: String,
        /// Section the name appeared in
        section: &'static str,
    },

    /// A field failed semantic validation
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Fully-qualified field name
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// A required field is absent given the rest of the config
    #[error("missing required field {field}: {reason}")]
    MissingField {
        /// Fully-qualified field name
        field: &'static str,
        /// Why it is required
        reason: String,
    },
}

/// How unknown keys are treated during load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Unknown keys are a fatal [`ConfigError::UnknownKeys`]
    #[default]
    Strict,
    /// Unknown keys are logged with `tracing::warn!` and ignored
    Lenient,
}

/// HOT tier (WebSocket push) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotConfig {
    /// Venues to stream from
    pub venues: Vec<String>,
    /// Maximum concurrently subscribed pairs per venue
    pub max_pairs: usize,
    /// Baseline reconnect pacing for the health monitor, seconds
    pub reconnect_secs: u64,
    /// Per-subscription delivery buffer capacity
    pub buffer_size: usize,
    /// WebSocket read timeout, milliseconds
    pub timeout_ms: u64,
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            venues: vec!["kraken".to_string()],
            max_pairs: 50,
            reconnect_secs: 5,
            buffer_size: 1024,
            timeout_ms: 30_000,
        }
    }
}

impl HotConfig {
    /// WebSocket read timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// WARM tier (cached REST pull) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmConfig {
    /// Venues answering pull requests
    pub venues: Vec<String>,
    /// Default cache TTL for warm lookups, seconds
    pub default_ttl_secs: u64,
    /// Transport retry attempts per request
    pub max_retries: u32,
    /// Base backoff between transport retries, milliseconds
    pub backoff_base_ms: u64,
    /// Upper bound on in-flight REST requests per venue
    pub request_limit: usize,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            venues: vec!["kraken".to_string(), "binance".to_string()],
            default_ttl_secs: 30,
            max_retries: 3,
            backoff_base_ms: 250,
            request_limit: 16,
        }
    }
}

impl WarmConfig {
    /// Default warm TTL as a duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Base transport backoff as a duration.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

/// TTL cache tier durations and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for the `prices_hot` tier, seconds
    pub prices_hot_secs: u64,
    /// TTL for the `prices_warm` tier, seconds
    pub prices_warm_secs: u64,
    /// TTL for the `volumes_vadr` tier, seconds
    pub volumes_vadr_secs: u64,
    /// TTL for the `token_meta` tier, seconds
    pub token_meta_secs: u64,
    /// Hard cap on resident entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prices_hot_secs: 5,
            prices_warm_secs: 30,
            volumes_vadr_secs: 120,
            token_meta_secs: 86_400,
            max_entries: 10_000,
        }
    }
}

/// Per-venue rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state request rate
    pub requests_per_second: u32,
    /// Token bucket burst capacity
    pub burst_allowance: u32,
    /// Endpoint name to integer weight cost
    #[serde(default)]
    pub weight_limits: BTreeMap<String, u32>,
    /// Accumulated-weight ceiling for the sliding window
    #[serde(default)]
    pub weight_limit: Option<u32>,
    /// Requests per rolling 24 h
    #[serde(default)]
    pub daily_limit: Option<u64>,
    /// Requests per rolling 30 d
    #[serde(default)]
    pub monthly_limit: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_allowance: 20,
            weight_limits: BTreeMap::new(),
            weight_limit: None,
            daily_limit: None,
            monthly_limit: None,
        }
    }
}

/// Per-channel circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Half-open successes before the circuit closes
    pub success_threshold: u32,
    /// Open-state dwell before probing, milliseconds
    pub timeout_ms: u64,
    /// Concurrent trial calls admitted while half-open
    pub max_probe: u32,
    /// Whether pull requests may fall back to other venues
    #[serde(default)]
    pub fallback_enabled: bool,
    /// Ordered fallback venues for non-microstructure pulls
    #[serde(default)]
    pub fallback_venues: Vec<String>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 60_000,
            max_probe: 1,
            fallback_enabled: false,
            fallback_venues: Vec::new(),
        }
    }
}

impl CircuitConfig {
    /// Open-state dwell as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Both channels of a venue's breaker pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueCircuitConfig {
    /// REST channel breaker
    #[serde(default)]
    pub http: CircuitConfig,
    /// WebSocket channel breaker
    #[serde(default)]
    pub ws: CircuitConfig,
}

/// Point-in-time store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitConfig {
    /// Root directory for snapshot files
    pub base_path: String,
    /// Snapshots older than this are purged
    pub retention_days: u32,
    /// Whether snapshot bodies are compressed at rest
    #[serde(default)]
    pub compression: bool,
}

impl Default for PitConfig {
    fn default() -> Self {
        Self {
            base_path: "./pit".to_string(),
            retention_days: 30,
            compression: false,
        }
    }
}

/// Producer half of the bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusProducerConfig {
    /// Acknowledgement mode requested from the broker
    pub acks: String,
    /// Compression codec name
    pub compression: String,
    /// Producer batch size in bytes
    pub batch_size: usize,
    /// Linger before flushing a partial batch, milliseconds
    pub linger_ms: u64,
    /// Hard cap on a single message
    pub max_message_bytes: usize,
    /// Idempotent production
    pub idempotent: bool,
}

impl Default for BusProducerConfig {
    fn default() -> Self {
        Self {
            acks: "all".to_string(),
            compression: "none".to_string(),
            batch_size: 16_384,
            linger_ms: 5,
            max_message_bytes: 1_048_576,
            idempotent: true,
        }
    }
}

/// Consumer half of the bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConsumerConfig {
    /// Consumer group identifier
    pub group_id: String,
    /// Where a new group starts reading
    pub auto_offset_reset: String,
    /// Broker session timeout, milliseconds
    pub session_timeout_ms: u64,
    /// Heartbeat interval, milliseconds
    pub heartbeat_ms: u64,
    /// Max records returned per poll
    pub max_poll_records: usize,
}

impl Default for BusConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "marketgate".to_string(),
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 30_000,
            heartbeat_ms: 3_000,
            max_poll_records: 500,
        }
    }
}

/// Handler retry policy for bus consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRetryConfig {
    /// Attempts before a message is dead-lettered
    pub max_retries: u32,
    /// First retry delay, milliseconds
    pub initial_delay_ms: u64,
    /// Retry delay ceiling, milliseconds
    pub max_delay_ms: u64,
    /// Exponential growth factor
    pub factor: f64,
    /// Whether delays are jittered
    pub jitter: bool,
}

impl Default for BusRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            factor: 2.0,
            jitter: true,
        }
    }
}

/// Dead-letter queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusDeadLetterConfig {
    /// Whether exhausted messages are dead-lettered at all
    pub enabled: bool,
    /// DLQ topic name
    pub topic: String,
    /// Retry ceiling mirrored here for DLQ header stamping
    pub max_retries: u32,
    /// DLQ retention, hours
    pub retention_hours: u64,
    /// Consecutive dead-letters before a key is quarantined
    pub quarantine_after: u32,
}

impl Default for BusDeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "marketgate.dlq".to_string(),
            max_retries: 3,
            retention_hours: 72,
            quarantine_after: 10,
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus implementation: `memory` or `relay`
    pub bus_type: String,
    /// Broker endpoints (relay socket paths for the relay bus)
    #[serde(default)]
    pub brokers: Vec<String>,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Security protocol name
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// Broker connect timeout, milliseconds
    pub connect_timeout_ms: u64,
    /// Publish deadline before failing fast, milliseconds
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Worker tasks per subscription
    #[serde(default = "default_subscription_workers")]
    pub subscription_workers: usize,
    /// Producer settings
    #[serde(default)]
    pub producer: BusProducerConfig,
    /// Consumer settings
    #[serde(default)]
    pub consumer: BusConsumerConfig,
    /// Handler retry policy
    #[serde(default)]
    pub retry: BusRetryConfig,
    /// Dead-letter settings
    #[serde(default)]
    pub dead_letter: BusDeadLetterConfig,
}

fn default_security_protocol() -> String {
    "plaintext".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_subscription_workers() -> usize {
    4
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_type: "memory".to_string(),
            brokers: Vec::new(),
            client_id: "marketgate".to_string(),
            security_protocol: default_security_protocol(),
            connect_timeout_ms: 10_000,
            publish_timeout_ms: default_publish_timeout_ms(),
            subscription_workers: default_subscription_workers(),
            producer: BusProducerConfig::default(),
            consumer: BusConsumerConfig::default(),
            retry: BusRetryConfig::default(),
            dead_letter: BusDeadLetterConfig::default(),
        }
    }
}

/// Optional durable repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// SQLite database path
    pub path: String,
}

/// The complete, closed configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HOT tier settings
    #[serde(default)]
    pub hot: HotConfig,
    /// WARM tier settings
    #[serde(default)]
    pub warm: WarmConfig,
    /// TTL cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-venue rate limits, keyed by venue name
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Per-venue circuit breaker pairs, keyed by venue name
    #[serde(default)]
    pub circuits: BTreeMap<String, VenueCircuitConfig>,
    /// Point-in-time store settings
    #[serde(default)]
    pub pit: PitConfig,
    /// Event bus settings; absent means no bus is attached
    #[serde(default)]
    pub bus: Option<BusConfig>,
    /// Repository settings; absent means no durable store
    #[serde(default)]
    pub repository: Option<RepositoryConfig>,
}

impl GatewayConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>, mode: ParseMode) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, mode)
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str, mode: ParseMode) -> Result<Self, ConfigError> {
        let value: toml::Value = text.parse()?;

        let unknown = scan_unknown_keys(&value);
        if !unknown.is_empty() {
            match mode {
                ParseMode::Strict => return Err(ConfigError::UnknownKeys { keys: unknown }),
                ParseMode::Lenient => {
                    for key in &unknown {
                        tracing::warn!(key = %key, "ignoring unknown configuration key");
                    }
                }
            }
        }

        let config: GatewayConfig = value.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation, run once at startup. Any failure is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.hot.venues.iter() {
            parse_venue(name, "hot.venues")?;
        }
        for name in self.warm.venues.iter() {
            parse_venue(name, "warm.venues")?;
        }
        for name in self.rate_limits.keys() {
            parse_venue(name, "rate_limits")?;
        }
        for (name, pair) in self.circuits.iter() {
            parse_venue(name, "circuits")?;
            for (channel, circuit) in [("http", &pair.http), ("ws", &pair.ws)] {
                if circuit.failure_threshold == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "circuits.<venue>.failure_threshold",
                        reason: format!("{name}.{channel} must be > 0"),
                    });
                }
                if circuit.success_threshold == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "circuits.<venue>.success_threshold",
                        reason: format!("{name}.{channel} must be > 0"),
                    });
                }
                if circuit.max_probe == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "circuits.<venue>.max_probe",
                        reason: format!("{name}.{channel} must be > 0"),
                    });
                }
                for fallback in circuit.fallback_venues.iter() {
                    parse_venue(fallback, "circuits.<venue>.fallback_venues")?;
                }
            }
        }
        for (name, limits) in self.rate_limits.iter() {
            if limits.requests_per_second == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "rate_limits.<venue>.requests_per_second",
                    reason: format!("{name} must be > 0"),
                });
            }
            if limits.burst_allowance == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "rate_limits.<venue>.burst_allowance",
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_entries",
                reason: "must be > 0".to_string(),
            });
        }
        if self.pit.base_path.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "pit.base_path",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(bus) = &self.bus {
            match bus.bus_type.as_str() {
                "memory" => {}
                "relay" => {
                    if bus.brokers.is_empty() {
                        return Err(ConfigError::MissingField {
                            field: "bus.brokers",
                            reason: "relay bus requires at least one broker endpoint"
                                .to_string(),
                        });
                    }
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "bus.bus_type",
                        reason: format!("unsupported bus type {other:?}"),
                    });
                }
            }
            if bus.retry.factor < 1.0 {
                return Err(ConfigError::InvalidValue {
                    field: "bus.retry.factor",
                    reason: "must be >= 1.0".to_string(),
                });
            }
        }
        if let Some(repo) = &self.repository {
            if repo.path.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "repository.path",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Venues participating in the HOT tier, parsed.
    pub fn hot_venues(&self) -> Vec<VenueId> {
        self.hot
            .venues
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    /// Venues participating in the WARM tier, parsed.
    pub fn warm_venues(&self) -> Vec<VenueId> {
        self.warm
            .venues
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    /// Rate-limit settings for a venue, defaulted when unconfigured.
    pub fn rate_limit_for(&self, venue: VenueId) -> RateLimitConfig {
        self.rate_limits
            .get(venue.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Breaker pair settings for a venue, defaulted when unconfigured.
    pub fn circuits_for(&self, venue: VenueId) -> VenueCircuitConfig {
        self.circuits
            .get(venue.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

fn parse_venue(name: &str, section: &'static str) -> Result<VenueId, ConfigError> {
    name.parse().map_err(|_| ConfigError::UnknownVenue {
        venue: name.to_string(),
        section,
    })
}

/// Known-key tables for the closed record. The scan reports fully-qualified
/// dotted paths for anything outside them.
fn scan_unknown_keys(root: &toml::Value) -> Vec<String> {
    const TOP: &[&str] = &[
        "hot",
        "warm",
        "cache",
        "rate_limits",
        "circuits",
        "pit",
        "bus",
        "repository",
    ];
    const HOT: &[&str] = &[
        "venues",
        "max_pairs",
        "reconnect_secs",
        "buffer_size",
        "timeout_ms",
    ];
    const WARM: &[&str] = &[
        "venues",
        "default_ttl_secs",
        "max_retries",
        "backoff_base_ms",
        "request_limit",
    ];
    const CACHE: &[&str] = &[
        "prices_hot_secs",
        "prices_warm_secs",
        "volumes_vadr_secs",
        "token_meta_secs",
        "max_entries",
    ];
    const RATE: &[&str] = &[
        "requests_per_second",
        "burst_allowance",
        "weight_limits",
        "weight_limit",
        "daily_limit",
        "monthly_limit",
    ];
    const CIRCUIT: &[&str] = &[
        "failure_threshold",
        "success_threshold",
        "timeout_ms",
        "max_probe",
        "fallback_enabled",
        "fallback_venues",
    ];
    const PIT: &[&str] = &["base_path", "retention_days", "compression"];
    const BUS: &[&str] = &[
        "bus_type",
        "brokers",
        "client_id",
        "security_protocol",
        "connect_timeout_ms",
        "publish_timeout_ms",
        "subscription_workers",
        "producer",
        "consumer",
        "retry",
        "dead_letter",
    ];
    const PRODUCER: &[&str] = &[
        "acks",
        "compression",
        "batch_size",
        "linger_ms",
        "max_message_bytes",
        "idempotent",
    ];
    const CONSUMER: &[&str] = &[
        "group_id",
        "auto_offset_reset",
        "session_timeout_ms",
        "heartbeat_ms",
        "max_poll_records",
    ];
    const RETRY: &[&str] = &[
        "max_retries",
        "initial_delay_ms",
        "max_delay_ms",
        "factor",
        "jitter",
    ];
    const DEAD_LETTER: &[&str] = &[
        "enabled",
        "topic",
        "max_retries",
        "retention_hours",
        "quarantine_after",
    ];
    const REPOSITORY: &[&str] = &["path"];

    fn check(
        unknown: &mut Vec<String>,
        prefix: &str,
        table: &toml::value::Table,
        known: &[&str],
    ) {
        for key in table.keys() {
            if !known.contains(&key.as_str()) {
                unknown.push(format!("{prefix}{key}"));
            }
        }
    }

    let mut unknown = Vec::new();
    let Some(table) = root.as_table() else {
        return unknown;
    };

    check(&mut unknown, "", table, TOP);
    for (section, known) in [
        ("hot", HOT),
        ("warm", WARM),
        ("cache", CACHE),
        ("pit", PIT),
        ("repository", REPOSITORY),
    ] {
        if let Some(inner) = table.get(section).and_then(|v| v.as_table()) {
            check(&mut unknown, &format!("{section}."), inner, known);
        }
    }
    if let Some(bus) = table.get("bus").and_then(|v| v.as_table()) {
        check(&mut unknown, "bus.", bus, BUS);
        for (nested, known) in [
            ("producer", PRODUCER),
            ("consumer", CONSUMER),
            ("retry", RETRY),
            ("dead_letter", DEAD_LETTER),
        ] {
            if let Some(inner) = bus.get(nested).and_then(|v| v.as_table()) {
                check(&mut unknown, &format!("bus.{nested}."), inner, known);
            }
        }
    }
    if let Some(limits) = table.get("rate_limits").and_then(|v| v.as_table()) {
        for (venue, section) in limits {
            if let Some(inner) = section.as_table() {
                check(&mut unknown, &format!("rate_limits.{venue}."), inner, RATE);
            }
        }
    }
    if let Some(circuits) = table.get("circuits").and_then(|v| v.as_table()) {
        for (venue, pair) in circuits {
            if let Some(pair_table) = pair.as_table() {
                for channel in pair_table.keys() {
                    if channel != "http" && channel != "ws" {
                        unknown.push(format!("circuits.{venue}.{channel}"));
                        continue;
                    }
                    if let Some(inner) = pair_table.get(channel).and_then(|v| v.as_table()) {
                        check(
                            &mut unknown,
                            &format!("circuits.{venue}.{channel}."),
                            inner,
                            CIRCUIT,
                        );
                    }
                }
            }
        }
    }

    unknown.sort();
    unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [hot]
        venues = ["kraken", "binance"]
        max_pairs = 25
        reconnect_secs = 5
        buffer_size = 512
        timeout_ms = 15000

        [warm]
        venues = ["kraken", "binance", "coinbase"]
        default_ttl_secs = 30
        max_retries = 3
        backoff_base_ms = 250
        request_limit = 8

        [cache]
        prices_hot_secs = 5
        prices_warm_secs = 30
        volumes_vadr_secs = 120
        token_meta_secs = 86400
        max_entries = 5000

        [rate_limits.binance]
        requests_per_second = 20
        burst_allowance = 40
        weight_limit = 1200
        daily_limit = 160000

        [rate_limits.binance.weight_limits]
        orderbook = 1
        all_tickers = 40

        [circuits.binance.http]
        failure_threshold = 5
        success_threshold = 3
        timeout_ms = 30000
        max_probe = 2
        fallback_enabled = true
        fallback_venues = ["kraken"]

        [circuits.binance.ws]
        failure_threshold = 3
        success_threshold = 2
        timeout_ms = 10000
        max_probe = 1

        [pit]
        base_path = "/var/lib/marketgate/pit"
        retention_days = 14

        [bus]
        bus_type = "memory"
        client_id = "scanner-1"
        connect_timeout_ms = 5000

        [bus.retry]
        max_retries = 4
        initial_delay_ms = 50
        max_delay_ms = 2000
        factor = 2.0
        jitter = true
    "#;

    #[test]
    fn sample_parses_in_strict_mode() {
        let config = GatewayConfig::parse(SAMPLE, ParseMode::Strict).unwrap();
        assert_eq!(config.hot.max_pairs, 25);
        assert_eq!(
            config.hot_venues(),
            vec![VenueId::Kraken, VenueId::Binance]
        );
        let binance = config.rate_limit_for(VenueId::Binance);
        assert_eq!(binance.weight_limits["all_tickers"], 40);
        assert_eq!(binance.weight_limit, Some(1200));
        let circuits = config.circuits_for(VenueId::Binance);
        assert!(circuits.http.fallback_enabled);
        assert_eq!(circuits.ws.failure_threshold, 3);
        assert_eq!(config.bus.as_ref().unwrap().retry.max_retries, 4);
    }

    #[test]
    fn unknown_key_is_fatal_in_strict_mode() {
        let text = format!("{SAMPLE}\n[hot2]\nvenues = []\n");
        let err = GatewayConfig::parse(&text, ParseMode::Strict).unwrap_err();
        match err {
            ConfigError::UnknownKeys { keys } => assert_eq!(keys, vec!["hot2".to_string()]),
            other => panic!("expected UnknownKeys, got {other:?}"),
        }
    }

    #[test]
    fn unknown_key_is_tolerated_in_lenient_mode() {
        let text = SAMPLE.replace("max_pairs = 25", "max_pairs = 25\nmax_pears = 9");
        let config = GatewayConfig::parse(&text, ParseMode::Lenient);
        // Lenient mode warns but the value still fails serde if it collides;
        // an extra key simply parses through.
        assert!(config.is_ok());
    }

    #[test]
    fn nested_unknown_keys_are_qualified() {
        let text = format!("{SAMPLE}\n[bus.producer]\nacks = \"all\"\nturbo = true\n");
        let err = GatewayConfig::parse(&text, ParseMode::Strict).unwrap_err();
        match err {
            ConfigError::UnknownKeys { keys } => {
                assert_eq!(keys, vec!["bus.producer.turbo".to_string()])
            }
            other => panic!("expected UnknownKeys, got {other:?}"),
        }
    }

    #[test]
    fn unknown_venue_is_rejected() {
        let text = SAMPLE.replace("rate_limits.binance", "rate_limits.mtgox");
        let err = GatewayConfig::parse(&text, ParseMode::Strict).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownVenue { section: "rate_limits", .. }
        ));
    }

    #[test]
    fn relay_bus_requires_brokers() {
        let text = SAMPLE.replace("bus_type = \"memory\"", "bus_type = \"relay\"");
        let err = GatewayConfig::parse(&text, ParseMode::Strict).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "bus.brokers", .. }));
    }

    #[test]
    fn unsupported_bus_type_is_rejected() {
        let text = SAMPLE.replace("bus_type = \"memory\"", "bus_type = \"pigeon\"");
        let err = GatewayConfig::parse(&text, ParseMode::Strict).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "bus.bus_type", .. }));
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let text = SAMPLE.replace("failure_threshold = 5", "failure_threshold = 0");
        let err = GatewayConfig::parse(&text, ParseMode::Strict).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn defaults_cover_absent_sections() {
        let config = GatewayConfig::parse("", ParseMode::Strict).unwrap();
        assert!(config.bus.is_none());
        assert!(config.repository.is_none());
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.rate_limit_for(VenueId::Kraken).requests_per_second, 10);
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = GatewayConfig::load(&path, ParseMode::Strict).unwrap();
        assert_eq!(config.pit.retention_days, 14);
    }
}
