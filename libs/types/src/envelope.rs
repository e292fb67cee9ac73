//! # Event Envelope - Integrity and Provenance Wrapper
//!
//! ## Purpose
//!
//! Every record the access layer delivers - pushed from a venue stream or
//! pulled through the cached REST path - travels inside an [`Envelope`]. The
//! envelope binds the payload to its identity (symbol, source, timestamp)
//! with a SHA3-256 digest, and carries provenance headers (original source,
//! confidence, cache interaction, fallback chain) for downstream inspection.
//!
//! ## Invariants
//!
//! - The checksum is computed over `payload ‖ unix-nanos(ts) ‖ symbol ‖
//!   source` at construction and must match on every read.
//! - Required fields (symbol, source, payload, checksum) are non-empty and
//!   the timestamp is non-zero.
//! - Envelopes are immutable after construction. Provenance headers are
//!   additive metadata outside the digest preimage; the payload and identity
//!   fields never change.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::fmt;

use crate::market::DataKind;
use crate::venue::VenueId;

/// Header key for the upstream source a record originally came from.
pub const HEADER_ORIGINAL_SOURCE: &str = "original_source";
/// Header key for the provenance confidence score in `[0, 1]`.
pub const HEADER_CONFIDENCE: &str = "confidence";
/// Header key recording whether the record was served from cache.
pub const HEADER_CACHE_HIT: &str = "cache_hit";
/// Header key for the comma-joined fallback chain.
pub const HEADER_FALLBACK_CHAIN: &str = "fallback_chain";

/// Access tier a record was produced through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    /// Push-based streaming (venue WebSocket)
    Hot,
    /// Pull-based REST with TTL caching
    Warm,
    /// Historical / replayed data
    Cold,
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTier::Hot => f.write_str("hot"),
            SourceTier::Warm => f.write_str("warm"),
            SourceTier::Cold => f.write_str("cold"),
        }
    }
}

/// Validation failures for envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// A required field was empty or absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Version must be a positive integer
    #[error("bad envelope version: {0}")]
    BadVersion(u32),

    /// Stored digest does not match the recomputed one
    #[error("checksum mismatch for {symbol} from {source_name}")]
    ChecksumMismatch {
        /// Canonical symbol
        symbol: String,
        /// Producing source
        source_name: String,
    },

    /// Timestamp of zero means the envelope never carried real time
    #[error("zero timestamp")]
    ZeroTimestamp,
}

mod payload_base64 {
    //! Wire form for the opaque payload: base64 text instead of a JSON
    //! byte array.

    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Canonical record wrapper with integrity digest and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Production or fetch time, UTC (RFC3339 with nanoseconds on the wire)
    pub ts: DateTime<Utc>,
    /// Canonical symbol, uppercase
    pub symbol: String,
    /// Producing venue or pipe name
    pub source: String,
    /// Opaque serialized record (base64 on the wire)
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// Hex SHA3-256 over payload ‖ unix-nanos ‖ symbol ‖ source
    pub checksum: String,
    /// Envelope schema version, >= 1
    pub version: u32,
    /// Provenance and routing headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Optional stable message identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Producing venue, when the source is on the venue grid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<VenueId>,
    /// Shape of the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataKind>,
    /// Tier the record was produced through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tier: Option<SourceTier>,
}

impl Envelope {
    /// Build an envelope around `payload` with a freshly computed digest.
    ///
    /// `ts` defaults to now when `None`. The symbol is canonicalized to
    /// uppercase before entering the digest preimage.
    pub fn build(
        symbol: impl Into<String>,
        source: impl Into<String>,
        payload: Vec<u8>,
        ts: Option<DateTime<Utc>>,
    ) -> Self {
        let symbol = symbol.into().to_ascii_uppercase();
        let source = source.into();
        let ts = ts.unwrap_or_else(Utc::now);
        let checksum = compute_checksum(&payload, ts, &symbol, &source);

        Self {
            ts,
            symbol,
            source,
            payload,
            checksum,
            version: 1,
            headers: BTreeMap::new(),
            message_id: None,
            venue: None,
            data_type: None,
            source_tier: None,
        }
    }

    /// Attach a venue, data kind, and tier in one pass.
    pub fn with_identity(
        mut self,
        venue: VenueId,
        data_type: DataKind,
        tier: SourceTier,
    ) -> Self {
        self.venue = Some(venue);
        self.data_type = Some(data_type);
        self.source_tier = Some(tier);
        self
    }

    /// Attach a stable message identifier.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Record where the data originally came from, the tier it was served
    /// through, a confidence score, and whether the cache answered.
    ///
    /// Confidence is clamped into `[0, 1]`.
    pub fn with_provenance(
        mut self,
        original_source: &str,
        tier: SourceTier,
        confidence: f64,
        cache_hit: bool,
    ) -> Self {
        self.headers.insert(
            HEADER_ORIGINAL_SOURCE.to_string(),
            original_source.to_string(),
        );
        self.headers.insert(
            HEADER_CONFIDENCE.to_string(),
            format!("{:.3}", confidence.clamp(0.0, 1.0)),
        );
        self.headers
            .insert(HEADER_CACHE_HIT.to_string(), cache_hit.to_string());
        self.source_tier = Some(tier);
        self
    }

    /// Join the sources tried before this one into a single header for
    /// downstream inspection.
    pub fn with_fallback_chain(mut self, chain: &[&str]) -> Self {
        if !chain.is_empty() {
            self.headers
                .insert(HEADER_FALLBACK_CHAIN.to_string(), chain.join(","));
        }
        self
    }

    /// Verify required fields, version, and the integrity digest.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.symbol.is_empty() {
            return Err(EnvelopeError::MissingField("symbol"));
        }
        if self.source.is_empty() {
            return Err(EnvelopeError::MissingField("source"));
        }
        if self.payload.is_empty() {
            return Err(EnvelopeError::MissingField("payload"));
        }
        if self.checksum.is_empty() {
            return Err(EnvelopeError::MissingField("checksum"));
        }
        if self.version == 0 {
            return Err(EnvelopeError::BadVersion(self.version));
        }
        if self.ts.timestamp_nanos_opt().unwrap_or(0) == 0 {
            return Err(EnvelopeError::ZeroTimestamp);
        }

        let expected = compute_checksum(&self.payload, self.ts, &self.symbol, &self.source);
        if expected != self.checksum {
            return Err(EnvelopeError::ChecksumMismatch {
                symbol: self.symbol.clone(),
                source_name: self.source.clone(),
            });
        }
        Ok(())
    }

    /// Elapsed time between production and `now`. Zero if the clock ran
    /// backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.ts).max(Duration::zero())
    }

    /// Whether the record is older than `max_age` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// Fallback chain recorded in the headers, split back into sources.
    pub fn fallback_chain(&self) -> Vec<&str> {
        self.headers
            .get(HEADER_FALLBACK_CHAIN)
            .map(|joined| joined.split(',').collect())
            .unwrap_or_default()
    }

    /// Serialize to the wire JSON form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse the wire JSON form. The caller still runs [`validate`].
    ///
    /// [`validate`]: Envelope::validate
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Hex SHA3-256 over the canonical preimage
/// `payload ‖ unix-nanos(ts) ‖ symbol ‖ source`.
pub fn compute_checksum(
    payload: &[u8],
    ts: DateTime<Utc>,
    symbol: &str,
    source: &str,
) -> String {
    let nanos = ts.timestamp_nanos_opt().unwrap_or(0);
    let mut hasher = Sha3_256::new();
    hasher.update(payload);
    hasher.update(nanos.to_be_bytes());
    hasher.update(symbol.as_bytes());
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// Encode an arbitrary serializable record as an envelope payload.
pub fn encode_payload<T: Serialize>(record: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

/// Decode an envelope payload back into a typed record.
pub fn decode_payload<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> serde_json::Result<T> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Side, Trade};

    fn sample_envelope() -> Envelope {
        let trade = Trade {
            symbol: "BTCUSD".to_string(),
            price: 62_450.5,
            size: 0.25,
            side: Side::Buy,
            trade_id: "t-1".to_string(),
            timestamp_ns: 1_700_000_000_000_000_000,
        };
        Envelope::build(
            "btcusd",
            "kraken",
            encode_payload(&trade).unwrap(),
            None,
        )
        .with_identity(VenueId::Kraken, DataKind::Trade, SourceTier::Hot)
    }

    #[test]
    fn build_produces_valid_envelope() {
        let env = sample_envelope();
        assert_eq!(env.version, 1);
        assert_eq!(env.symbol, "BTCUSD"); // canonicalized
        env.validate().unwrap();
    }

    #[test]
    fn tampered_payload_fails_validation() {
        let mut env = sample_envelope();
        env.payload[0] ^= 0xFF;
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn tampered_identity_fails_validation() {
        let mut env = sample_envelope();
        env.source = "binance".to_string();
        assert!(env.validate().is_err());
    }

    #[test]
    fn wire_round_trip_is_identity() {
        let env = sample_envelope()
            .with_provenance("kraken", SourceTier::Hot, 0.97, false)
            .with_message_id("m-42");

        let json = env.to_json().unwrap();
        let back = Envelope::from_json(&json).unwrap();

        assert_eq!(back, env);
        back.validate().unwrap();

        let trade: Trade = decode_payload(&back.payload).unwrap();
        assert_eq!(trade.symbol, "BTCUSD");
    }

    #[test]
    fn provenance_headers_do_not_break_integrity() {
        let env = sample_envelope()
            .with_provenance("coinbase", SourceTier::Warm, 1.7, true)
            .with_fallback_chain(&["kraken", "coinbase"]);

        env.validate().unwrap();
        assert_eq!(env.headers[HEADER_CONFIDENCE], "1.000"); // clamped
        assert_eq!(env.headers[HEADER_CACHE_HIT], "true");
        assert_eq!(env.fallback_chain(), vec!["kraken", "coinbase"]);
    }

    #[test]
    fn staleness_is_age_against_max() {
        let env = sample_envelope();
        let now = env.ts + Duration::seconds(5);
        assert_eq!(env.age(now), Duration::seconds(5));
        assert!(env.is_stale(now, Duration::seconds(3)));
        assert!(!env.is_stale(now, Duration::seconds(10)));
    }

    #[test]
    fn empty_fields_are_rejected() {
        let mut env = sample_envelope();
        env.symbol.clear();
        assert_eq!(env.validate(), Err(EnvelopeError::MissingField("symbol")));

        let mut env = sample_envelope();
        env.version = 0;
        assert_eq!(env.validate(), Err(EnvelopeError::BadVersion(0)));
    }
}
