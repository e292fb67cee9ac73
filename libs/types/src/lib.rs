//! # Marketgate Types - Canonical Market Data Shapes
//!
//! ## Purpose
//!
//! Shared vocabulary for the unified market-data access layer: venue
//! identifiers, the canonical trade / order-book / candle shapes every venue
//! adapter normalizes into, and the tamper-evident [`Envelope`] that wraps
//! every record delivered through the HOT or WARM tier.
//!
//! ## Integration Points
//!
//! - **Producers**: venue adapters construct canonical records; the gateway
//!   wraps them in envelopes at the moment data is produced or fetched.
//! - **Consumers**: subscription callbacks, the TTL cache, the PIT store, and
//!   the event bus all move these types by value.
//! - **Integrity**: `Envelope::validate` recomputes the SHA3-256 digest;
//!   downstream code treats envelopes as immutable.
//!
//! ## Architecture Role
//!
//! This crate sits at the bottom of the workspace. It has no knowledge of
//! transports, caches, or buses - only data shapes and their invariants.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod market;
pub mod venue;

pub use envelope::{Envelope, EnvelopeError, SourceTier};
pub use market::{
    BookL2, BookLevel, DataKind, Kline, MarketDataError, Side, Trade,
};
pub use venue::{UnknownVenue, VenueId};

/// Current time in nanoseconds since the Unix epoch.
///
/// Saturates at zero for clocks before the epoch rather than panicking.
pub fn current_timestamp_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
