//! Venue identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of exchange venues the access layer can address.
///
/// `Generic` names a non-exchange source (an internal pipe, a replay file)
/// so provenance never loses its origin even off the venue grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    /// Binance spot
    Binance,
    /// Kraken spot
    Kraken,
    /// Coinbase Exchange
    Coinbase,
    /// OKX spot
    Okx,
    /// Non-exchange source (pipe name, replay, test harness)
    Generic,
}

impl VenueId {
    /// All venues that map to a real exchange surface.
    pub fn exchanges() -> &'static [VenueId] {
        &[
            VenueId::Binance,
            VenueId::Kraken,
            VenueId::Coinbase,
            VenueId::Okx,
        ]
    }

    /// Lowercase canonical name used in cache keys, config sections, and
    /// envelope sources.
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Kraken => "kraken",
            VenueId::Coinbase => "coinbase",
            VenueId::Okx => "okx",
            VenueId::Generic => "generic",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VenueId {
    type Err = UnknownVenue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(VenueId::Binance),
            "kraken" => Ok(VenueId::Kraken),
            "coinbase" => Ok(VenueId::Coinbase),
            "okx" => Ok(VenueId::Okx),
            "generic" => Ok(VenueId::Generic),
            other => Err(UnknownVenue(other.to_string())),
        }
    }
}

/// Error returned when a venue name does not match the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown venue: {0}")]
pub struct UnknownVenue(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_from_str() {
        for venue in VenueId::exchanges() {
            let parsed: VenueId = venue.to_string().parse().unwrap();
            assert_eq!(parsed, *venue);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("KRAKEN".parse::<VenueId>().unwrap(), VenueId::Kraken);
        assert_eq!("Binance".parse::<VenueId>().unwrap(), VenueId::Binance);
    }

    #[test]
    fn unknown_venue_is_an_error() {
        assert!("mtgox".parse::<VenueId>().is_err());
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&VenueId::Coinbase).unwrap();
        assert_eq!(json, "\"coinbase\"");
        let back: VenueId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, VenueId::Coinbase);
    }
}
