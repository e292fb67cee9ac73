//! Canonical market-data shapes
//!
//! Every venue adapter normalizes its native wire format into these types.
//! Symbols are canonical (uppercase, no separators: `BTCUSD`); intervals are
//! canonical strings (`1m`, `5m`, `1h`, `1d`). Validation enforces the
//! invariants the rest of the stack relies on; nothing downstream re-checks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Taker bought
    Buy,
    /// Taker sold
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

/// The data shapes the access layer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Executed trade prints
    Trade,
    /// Level-2 order book snapshots and deltas
    BookL2,
    /// OHLCV candles
    Kline,
    /// Opaque point-in-time snapshot payloads
    Snapshot,
}

impl DataKind {
    /// Short name used in cache keys and PIT entity paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Trade => "trades",
            DataKind::BookL2 => "book_l2",
            DataKind::Kline => "klines",
            DataKind::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation failures for canonical records.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarketDataError {
    /// A required string field was empty
    #[error("empty field: {0}")]
    EmptyField(&'static str),

    /// Price must be finite and strictly positive
    #[error("invalid price {price} for {symbol}")]
    InvalidPrice {
        /// Canonical symbol
        symbol: String,
        /// Offending price
        price: f64,
    },

    /// Size must be finite and strictly positive
    #[error("invalid size {size} for {symbol}")]
    InvalidSize {
        /// Canonical symbol
        symbol: String,
        /// Offending size
        size: f64,
    },

    /// Volume must be finite and non-negative
    #[error("invalid volume {volume} for {symbol}")]
    InvalidVolume {
        /// Canonical symbol
        symbol: String,
        /// Offending volume
        volume: f64,
    },

    /// Candle bounds must satisfy low <= open,close <= high
    #[error("inconsistent OHLC for {symbol}: o={open} h={high} l={low} c={close}")]
    InconsistentOhlc {
        /// Canonical symbol
        symbol: String,
        /// Open
        open: f64,
        /// High
        high: f64,
        /// Low
        low: f64,
        /// Close
        close: f64,
    },

    /// Book sides must be sorted (bids descending, asks ascending)
    #[error("unsorted {side} ladder for {symbol}")]
    UnsortedLadder {
        /// Canonical symbol
        symbol: String,
        /// "bid" or "ask"
        side: &'static str,
    },

    /// Timestamp of zero means the record never carried real time
    #[error("zero timestamp for {0}")]
    ZeroTimestamp(String),
}

/// A single executed trade, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Canonical symbol, e.g. `BTCUSD`
    pub symbol: String,
    /// Trade price, strictly positive
    pub price: f64,
    /// Trade size in base units, strictly positive
    pub size: f64,
    /// Aggressor side
    pub side: Side,
    /// Venue-assigned trade identifier
    pub trade_id: String,
    /// Execution time, nanoseconds since epoch
    pub timestamp_ns: u64,
}

impl Trade {
    /// Check the trade invariants: non-empty symbol, positive finite
    /// price and size, non-zero timestamp.
    pub fn validate(&self) -> Result<(), MarketDataError> {
        if self.symbol.is_empty() {
            return Err(MarketDataError::EmptyField("symbol"));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(MarketDataError::InvalidPrice {
                symbol: self.symbol.clone(),
                price: self.price,
            });
        }
        if !self.size.is_finite() || self.size <= 0.0 {
            return Err(MarketDataError::InvalidSize {
                symbol: self.symbol.clone(),
                size: self.size,
            });
        }
        if self.timestamp_ns == 0 {
            return Err(MarketDataError::ZeroTimestamp(self.symbol.clone()));
        }
        Ok(())
    }
}

/// One aggregated price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price
    pub price: f64,
    /// Aggregated size at this price; zero means the level was removed
    pub size: f64,
}

/// Level-2 order book snapshot or delta, normalized.
///
/// `sequence` is monotonically non-decreasing per (venue, symbol). A gap
/// observed by an adapter triggers a resynchronization: the next delivery is
/// a full snapshot carrying `resync = true`, never a silently dropped delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookL2 {
    /// Canonical symbol
    pub symbol: String,
    /// Venue sequence number for gap detection
    pub sequence: u64,
    /// Bid levels, best (highest) first
    pub bids: Vec<BookLevel>,
    /// Ask levels, best (lowest) first
    pub asks: Vec<BookLevel>,
    /// Capture time, nanoseconds since epoch
    pub timestamp_ns: u64,
    /// True when this book was rebuilt after a sequence gap
    #[serde(default)]
    pub resync: bool,
}

impl BookL2 {
    /// Check the book invariants: sorted ladders, finite non-negative
    /// prices and sizes, non-zero timestamp.
    pub fn validate(&self) -> Result<(), MarketDataError> {
        if self.symbol.is_empty() {
            return Err(MarketDataError::EmptyField("symbol"));
        }
        if self.timestamp_ns == 0 {
            return Err(MarketDataError::ZeroTimestamp(self.symbol.clone()));
        }
        for level in self.bids.iter().chain(self.asks.iter()) {
            if !level.price.is_finite() || level.price < 0.0 {
                return Err(MarketDataError::InvalidPrice {
                    symbol: self.symbol.clone(),
                    price: level.price,
                });
            }
            if !level.size.is_finite() || level.size < 0.0 {
                return Err(MarketDataError::InvalidSize {
                    symbol: self.symbol.clone(),
                    size: level.size,
                });
            }
        }
        if self.bids.windows(2).any(|w| w[0].price < w[1].price) {
            return Err(MarketDataError::UnsortedLadder {
                symbol: self.symbol.clone(),
                side: "bid",
            });
        }
        if self.asks.windows(2).any(|w| w[0].price > w[1].price) {
            return Err(MarketDataError::UnsortedLadder {
                symbol: self.symbol.clone(),
                side: "ask",
            });
        }
        Ok(())
    }

    /// Best bid price, if any level is present.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, if any level is present.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

/// OHLCV candle, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// Canonical symbol
    pub symbol: String,
    /// Canonical interval, e.g. `1m`, `1h`
    pub interval: String,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Base-asset volume, non-negative
    pub volume: f64,
    /// Candle open time, nanoseconds since epoch
    pub open_time_ns: u64,
    /// Candle close time, nanoseconds since epoch
    pub close_time_ns: u64,
}

impl Kline {
    /// Check the candle invariants: positive finite prices within the
    /// high/low bounds, non-negative volume, non-zero open time.
    pub fn validate(&self) -> Result<(), MarketDataError> {
        if self.symbol.is_empty() {
            return Err(MarketDataError::EmptyField("symbol"));
        }
        if self.interval.is_empty() {
            return Err(MarketDataError::EmptyField("interval"));
        }
        for price in [self.open, self.high, self.low, self.close] {
            if !price.is_finite() || price <= 0.0 {
                return Err(MarketDataError::InvalidPrice {
                    symbol: self.symbol.clone(),
                    price,
                });
            }
        }
        let in_bounds = |p: f64| p >= self.low && p <= self.high;
        if self.low > self.high || !in_bounds(self.open) || !in_bounds(self.close) {
            return Err(MarketDataError::InconsistentOhlc {
                symbol: self.symbol.clone(),
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(MarketDataError::InvalidVolume {
                symbol: self.symbol.clone(),
                volume: self.volume,
            });
        }
        if self.open_time_ns == 0 {
            return Err(MarketDataError::ZeroTimestamp(self.symbol.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> Trade {
        Trade {
            symbol: "BTCUSD".to_string(),
            price: 62_450.5,
            size: 0.25,
            side: Side::Buy,
            trade_id: "t-1".to_string(),
            timestamp_ns: 1_700_000_000_000_000_000,
        }
    }

    #[test]
    fn valid_trade_passes() {
        sample_trade().validate().unwrap();
    }

    #[test]
    fn trade_rejects_bad_numbers() {
        let mut t = sample_trade();
        t.price = 0.0;
        assert!(matches!(
            t.validate(),
            Err(MarketDataError::InvalidPrice { .. })
        ));

        let mut t = sample_trade();
        t.size = f64::NAN;
        assert!(matches!(
            t.validate(),
            Err(MarketDataError::InvalidSize { .. })
        ));

        let mut t = sample_trade();
        t.timestamp_ns = 0;
        assert!(matches!(t.validate(), Err(MarketDataError::ZeroTimestamp(_))));
    }

    #[test]
    fn book_requires_sorted_ladders() {
        let book = BookL2 {
            symbol: "BTCUSD".to_string(),
            sequence: 10,
            bids: vec![
                BookLevel { price: 100.0, size: 1.0 },
                BookLevel { price: 101.0, size: 1.0 },
            ],
            asks: vec![],
            timestamp_ns: 1,
            resync: false,
        };
        assert!(matches!(
            book.validate(),
            Err(MarketDataError::UnsortedLadder { side: "bid", .. })
        ));

        let book = BookL2 {
            symbol: "BTCUSD".to_string(),
            sequence: 10,
            bids: vec![
                BookLevel { price: 101.0, size: 1.0 },
                BookLevel { price: 100.0, size: 2.0 },
            ],
            asks: vec![
                BookLevel { price: 101.5, size: 0.5 },
                BookLevel { price: 102.0, size: 0.5 },
            ],
            timestamp_ns: 1,
            resync: false,
        };
        book.validate().unwrap();
        assert_eq!(book.best_bid(), Some(101.0));
        assert_eq!(book.best_ask(), Some(101.5));
    }

    #[test]
    fn kline_bounds_are_enforced() {
        let k = Kline {
            symbol: "ETHUSD".to_string(),
            interval: "1m".to_string(),
            open: 3000.0,
            high: 2990.0, // high below open
            low: 2980.0,
            close: 2985.0,
            volume: 12.0,
            open_time_ns: 1,
            close_time_ns: 60_000_000_001,
        };
        assert!(matches!(
            k.validate(),
            Err(MarketDataError::InconsistentOhlc { .. })
        ));
    }
}
