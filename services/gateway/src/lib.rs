//! # Marketgate Gateway - Unified Market-Data Access Layer
//!
//! ## Purpose
//!
//! A single facade over many exchange venues, serving two access shapes at
//! once: a HOT tier that multiplexes venue-native push streams (trades,
//! level-2 books, candles) to application consumers, and a WARM tier that
//! answers pull requests from a coalescing TTL cache backed by venue REST
//! endpoints. Every delivered record can be mirrored to an append-only
//! point-in-time store and to a durable event bus for replay and fan-out.
//!
//! ## Integration Points
//!
//! - **Input Sources**: venue WebSocket feeds and REST endpoints
//!   (Binance, Kraken, Coinbase adapters; bring-your-own via
//!   [`VenueAdapter`])
//! - **Output Destinations**: consumer callbacks, the PIT store, the
//!   `message-bus` topics (`trades`, `book_l2`, `klines`)
//! - **Protection Mesh**: per-venue weighted rate limiting with provider
//!   header ingestion, and dual (HTTP/WS) circuit breakers with half-open
//!   probing
//! - **Observability**: per-venue health and attribution, cache and
//!   limiter snapshots, gateway counters
//!
//! ## Architecture Role
//!
//! ```text
//! Venue WS ──> adapter ──> wrapped callback ──> consumer
//!                             │  (attribution, PIT, bus envelope)
//! consumer ──> facade ──> TTL cache ──> limiter ──> breaker ──> REST
//!                             └─ hit                     └─ miss path
//! ```
//!
//! Degradation is always per venue and communicated through
//! [`VenueHealth`] status transitions; one venue's failure never takes the
//! gateway down.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribution;
pub mod cache;
pub mod circuit_breaker;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod pit;
pub mod rate_limit;
pub mod repository;
pub mod venues;

pub use attribution::SourceAttribution;
pub use cache::{CacheStats, CacheTier, CachedValue, TtlCache};
pub use circuit_breaker::{
    Channel, CircuitBreaker, CircuitSnapshot, CircuitState, VenueBreakers,
};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::{GatewayError, Result};
pub use gateway::MarketGateway;
pub use health::{HealthState, VenueHealth};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use pit::{PitRecord, PitStore};
pub use rate_limit::{LimiterSnapshot, RateLimiter, RejectReason, RequestStats};
pub use repository::Repository;
pub use venues::{
    AdapterHealth, BinanceAdapter, BookCallback, BookSequenceTracker, CoinbaseAdapter,
    KlineCallback, KrakenAdapter, RestResponse, SeqCheck, TradeCallback, VenueAdapter,
};

// Re-export the canonical shapes so embedders need one import.
pub use types::{
    BookL2, BookLevel, DataKind, Envelope, EnvelopeError, Kline, Side, SourceTier, Trade,
    VenueId,
};
