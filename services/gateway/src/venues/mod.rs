//! Venue adapters: one per exchange surface
//!
//! Each adapter normalizes its venue's native WebSocket and REST formats
//! into the canonical shapes in `types`. Microstructure (order books) MUST
//! come from venue-native endpoints; adapters never source books from
//! aggregators. Per (venue, symbol, kind), deliveries preserve the venue's
//! production order because each connection has exactly one reader task.

pub mod binance;
pub mod coinbase;
pub mod kraken;
pub mod mock;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use types::{BookL2, Kline, Trade, VenueId};

use crate::error::Result;

pub use binance::BinanceAdapter;
pub use coinbase::CoinbaseAdapter;
pub use kraken::KrakenAdapter;

/// Consumer callback for trade deliveries.
pub type TradeCallback = Arc<dyn Fn(Trade) + Send + Sync + 'static>;
/// Consumer callback for book deliveries (snapshots, deltas, resyncs).
pub type BookCallback = Arc<dyn Fn(BookL2) + Send + Sync + 'static>;
/// Consumer callback for candle deliveries.
pub type KlineCallback = Arc<dyn Fn(Kline) + Send + Sync + 'static>;

/// REST payload plus the provider rate-limit headers that came with it.
/// The facade feeds the headers into the rate limiter.
#[derive(Debug, Clone)]
pub struct RestResponse<T> {
    /// Normalized payload
    pub data: T,
    /// Provider rate-limit headers, verbatim
    pub rate_headers: HashMap<String, String>,
}

impl<T> RestResponse<T> {
    /// Wrap a payload with no interesting headers.
    pub fn bare(data: T) -> Self {
        Self {
            data,
            rate_headers: HashMap::new(),
        }
    }
}

/// Stream-side health as the adapter sees it.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    /// The venue this adapter serves
    pub venue: VenueId,
    /// WebSocket currently connected
    pub ws_connected: bool,
    /// Last stream message, nanoseconds since epoch
    pub last_message_ns: Option<u64>,
}

/// Core trait every venue adapter implements.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// The venue this adapter connects to.
    fn venue(&self) -> VenueId;

    /// Establish the WebSocket connection and start the reader task.
    async fn connect_ws(&self) -> Result<()>;

    /// Close the stream and stop the reader task.
    async fn close(&self) -> Result<()>;

    /// Whether the stream is currently up.
    async fn is_connected(&self) -> bool;

    /// Stream trades for a canonical symbol.
    async fn subscribe_trades(&self, symbol: &str, callback: TradeCallback) -> Result<()>;

    /// Stream level-2 book updates for a canonical symbol. Sequence gaps
    /// resynchronize (resubscribe + snapshot) and the rebuilt book is
    /// delivered with `resync = true`; deltas are never silently dropped.
    async fn subscribe_book_l2(&self, symbol: &str, callback: BookCallback) -> Result<()>;

    /// Stream candles for a canonical symbol and interval.
    async fn subscribe_klines(
        &self,
        symbol: &str,
        interval: &str,
        callback: KlineCallback,
    ) -> Result<()>;

    /// Pull recent candles over REST.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<RestResponse<Vec<Kline>>>;

    /// Pull recent trades over REST.
    async fn get_trades(&self, symbol: &str, limit: usize) -> Result<RestResponse<Vec<Trade>>>;

    /// Pull a book snapshot over REST (venue-native only).
    async fn get_book_l2(&self, symbol: &str, depth: usize) -> Result<RestResponse<BookL2>>;

    /// Venue-native pair name for a canonical symbol.
    fn venue_symbol(&self, canonical: &str) -> String;

    /// Canonical symbol for a venue-native pair name (uppercase, no
    /// separators).
    fn normalize_symbol(&self, raw: &str) -> String;

    /// Venue-native interval token for a canonical interval.
    fn normalize_interval(&self, interval: &str) -> Result<String>;

    /// Stream-side health.
    async fn health(&self) -> AdapterHealth;
}

/// Outcome of observing a book sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// In order; deliver the delta
    Ok,
    /// First message for the symbol; deliver as a baseline
    First,
    /// Out of order; resynchronize before any further delta
    Gap {
        /// Last sequence seen
        last: u64,
        /// Sequence that arrived
        got: u64,
    },
}

/// Per-symbol monotonic sequence tracking for book streams.
///
/// Contiguous mode is for venues whose update ids count every delta: a
/// skipped id is a gap just like a regression. Non-contiguous mode only
/// requires sequences to be non-decreasing.
pub struct BookSequenceTracker {
    contiguous: bool,
    last: parking_lot::Mutex<HashMap<String, u64>>,
}

impl BookSequenceTracker {
    /// New tracker with no history.
    pub fn new(contiguous: bool) -> Self {
        Self {
            contiguous,
            last: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Observe a sequence for a symbol.
    pub fn observe(&self, symbol: &str, sequence: u64) -> SeqCheck {
        let mut last = self.last.lock();
        match last.get(symbol).copied() {
            None => {
                last.insert(symbol.to_string(), sequence);
                SeqCheck::First
            }
            Some(previous) => {
                let in_order = if self.contiguous {
                    sequence == previous || sequence == previous + 1
                } else {
                    sequence >= previous
                };
                if in_order {
                    last.insert(symbol.to_string(), sequence);
                    SeqCheck::Ok
                } else {
                    SeqCheck::Gap {
                        last: previous,
                        got: sequence,
                    }
                }
            }
        }
    }

    /// Reset a symbol to a resynced snapshot's sequence.
    pub fn reset(&self, symbol: &str, sequence: u64) {
        self.last.lock().insert(symbol.to_string(), sequence);
    }

    /// Forget a symbol entirely (unsubscribe, disconnect).
    pub fn clear(&self, symbol: &str) {
        self.last.lock().remove(symbol);
    }
}

/// Collect the provider rate-limit headers the limiter understands.
pub(crate) fn extract_rate_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        let canonical = match name.as_str() {
            // reqwest lowercases names; restore the provider spellings the
            // limiter matches on.
            "retry-after" => "Retry-After".to_string(),
            lower if lower.starts_with("x-mbx-used-weight") => {
                lower.to_ascii_uppercase()
            }
            "ratelimit-remaining" | "ratelimit-reset" => name.as_str().to_string(),
            _ => continue,
        };
        if let Ok(text) = value.to_str() {
            out.insert(canonical, text.to_string());
        }
    }
    out
}

/// Shared GET helper: status mapping plus rate-header extraction.
pub(crate) async fn rest_get_json(
    client: &reqwest::Client,
    venue: VenueId,
    url: &str,
) -> Result<(serde_json::Value, HashMap<String, String>)> {
    let response = client.get(url).send().await?;
    let status = response.status();
    let rate_headers = extract_rate_headers(response.headers());

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(crate::error::GatewayError::NotFound {
            venue,
            what: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(crate::error::GatewayError::UpstreamStatus {
            venue,
            status: status.as_u16(),
        });
    }

    let body = response.json::<serde_json::Value>().await?;
    Ok((body, rate_headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_contiguous_tracker_flags_regressions() {
        let tracker = BookSequenceTracker::new(false);
        assert_eq!(tracker.observe("BTCUSD", 1), SeqCheck::First);
        assert_eq!(tracker.observe("BTCUSD", 2), SeqCheck::Ok);
        assert_eq!(tracker.observe("BTCUSD", 2), SeqCheck::Ok); // non-decreasing
        assert_eq!(tracker.observe("BTCUSD", 5), SeqCheck::Ok); // skips allowed
        assert_eq!(
            tracker.observe("BTCUSD", 1),
            SeqCheck::Gap { last: 5, got: 1 }
        );

        // Other symbols are independent.
        assert_eq!(tracker.observe("ETHUSD", 100), SeqCheck::First);

        tracker.reset("BTCUSD", 10);
        assert_eq!(tracker.observe("BTCUSD", 11), SeqCheck::Ok);

        tracker.clear("BTCUSD");
        assert_eq!(tracker.observe("BTCUSD", 1), SeqCheck::First);
    }

    #[test]
    fn contiguous_tracker_flags_skips() {
        let tracker = BookSequenceTracker::new(true);
        assert_eq!(tracker.observe("BTCUSD", 1), SeqCheck::First);
        assert_eq!(tracker.observe("BTCUSD", 2), SeqCheck::Ok);
        assert_eq!(
            tracker.observe("BTCUSD", 4),
            SeqCheck::Gap { last: 2, got: 4 }
        );
    }

    #[test]
    fn rate_header_extraction_restores_provider_spelling() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-mbx-used-weight-1m", "123".parse().unwrap());
        headers.insert("retry-after", "5".parse().unwrap());
        headers.insert("ratelimit-remaining", "0".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());

        let extracted = extract_rate_headers(&headers);
        assert_eq!(extracted["X-MBX-USED-WEIGHT-1M"], "123");
        assert_eq!(extracted["Retry-After"], "5");
        assert_eq!(extracted["ratelimit-remaining"], "0");
        assert!(!extracted.contains_key("content-type"));
    }
}
