//! Binance WebSocket + REST adapter
//!
//! Reference implementation for venue adapters: typed event structs with
//! validation, `TryFrom` conversions into the canonical shapes, a single
//! reader task per connection, contiguous book-sequence tracking with
//! REST-snapshot resync, and rate-limit header passthrough
//! (`X-MBX-USED-WEIGHT*`) on every REST call.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::prelude::{FromStr, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use types::{BookL2, BookLevel, Kline, Side, Trade, VenueId};

use crate::circuit_breaker::CircuitBreaker;
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{GatewayError, Result};
use crate::venues::{
    rest_get_json, AdapterHealth, BookCallback, BookSequenceTracker, KlineCallback, RestResponse,
    SeqCheck, TradeCallback, VenueAdapter,
};

const INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

/// Configuration for the Binance adapter.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    /// WebSocket endpoint
    pub ws_url: String,
    /// REST endpoint
    pub rest_url: String,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Stream read timeout
    pub read_timeout: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            rest_url: "https://api.binance.com".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

/// Parsed Binance trade stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceTradeEvent {
    /// Pair, e.g. `BTCUSDT`
    #[serde(rename = "s")]
    pub symbol: String,
    /// Venue trade id
    #[serde(rename = "t")]
    pub trade_id: u64,
    /// Price as string for precision preservation
    #[serde(rename = "p")]
    pub price: String,
    /// Quantity as string for precision preservation
    #[serde(rename = "q")]
    pub quantity: String,
    /// Trade time, milliseconds since epoch
    #[serde(rename = "T")]
    pub trade_time_ms: u64,
    /// True when the buyer is the maker (taker sold)
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

impl BinanceTradeEvent {
    /// Structural and semantic checks before conversion.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(parse_error("trade event", "empty symbol"));
        }
        let price = decimal(&self.price, "trade price")?;
        let quantity = decimal(&self.quantity, "trade quantity")?;
        if price <= Decimal::ZERO || quantity <= Decimal::ZERO {
            return Err(parse_error("trade event", "non-positive price or quantity"));
        }
        if self.trade_time_ms == 0 {
            return Err(parse_error("trade event", "zero timestamp"));
        }
        Ok(())
    }
}

impl TryFrom<BinanceTradeEvent> for Trade {
    type Error = GatewayError;

    fn try_from(event: BinanceTradeEvent) -> Result<Self> {
        event.validate()?;
        let trade = Trade {
            symbol: event.symbol.to_ascii_uppercase(),
            price: decimal_f64(&event.price, "trade price")?,
            size: decimal_f64(&event.quantity, "trade quantity")?,
            // `m` is from the maker's view: buyer-is-maker means the taker
            // sold into the bid.
            side: if event.buyer_is_maker {
                Side::Sell
            } else {
                Side::Buy
            },
            trade_id: event.trade_id.to_string(),
            timestamp_ns: event.trade_time_ms * 1_000_000,
        };
        trade.validate()?;
        Ok(trade)
    }
}

/// Parsed Binance depth (book delta) stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceDepthEvent {
    /// Pair, e.g. `BTCUSDT`
    #[serde(rename = "s")]
    pub symbol: String,
    /// Final update id in this delta
    #[serde(rename = "u")]
    pub final_update_id: u64,
    /// Event time, milliseconds since epoch
    #[serde(rename = "E")]
    pub event_time_ms: u64,
    /// Bid updates as [price, qty] string pairs
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    /// Ask updates as [price, qty] string pairs
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

impl TryFrom<BinanceDepthEvent> for BookL2 {
    type Error = GatewayError;

    fn try_from(event: BinanceDepthEvent) -> Result<Self> {
        // Delta rows are per-level edits in arbitrary order; sort them into
        // canonical ladder order.
        let mut bids = parse_ladder(&event.bids)?;
        let mut asks = parse_ladder(&event.asks)?;
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));

        let book = BookL2 {
            symbol: event.symbol.to_ascii_uppercase(),
            sequence: event.final_update_id,
            bids,
            asks,
            timestamp_ns: event.event_time_ms * 1_000_000,
            resync: false,
        };
        book.validate()?;
        Ok(book)
    }
}

/// Parsed Binance kline stream event (inner `k` object).
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceKlinePayload {
    /// Open time, milliseconds
    #[serde(rename = "t")]
    pub open_time_ms: u64,
    /// Close time, milliseconds
    #[serde(rename = "T")]
    pub close_time_ms: u64,
    /// Interval token
    #[serde(rename = "i")]
    pub interval: String,
    /// Open price
    #[serde(rename = "o")]
    pub open: String,
    /// Close price
    #[serde(rename = "c")]
    pub close: String,
    /// High price
    #[serde(rename = "h")]
    pub high: String,
    /// Low price
    #[serde(rename = "l")]
    pub low: String,
    /// Base volume
    #[serde(rename = "v")]
    pub volume: String,
}

impl BinanceKlinePayload {
    fn into_kline(self, symbol: &str) -> Result<Kline> {
        let kline = Kline {
            symbol: symbol.to_ascii_uppercase(),
            interval: self.interval.clone(),
            open: decimal_f64(&self.open, "kline open")?,
            high: decimal_f64(&self.high, "kline high")?,
            low: decimal_f64(&self.low, "kline low")?,
            close: decimal_f64(&self.close, "kline close")?,
            volume: decimal_f64(&self.volume, "kline volume")?,
            open_time_ns: self.open_time_ms * 1_000_000,
            close_time_ns: self.close_time_ms * 1_000_000,
        };
        kline.validate()?;
        Ok(kline)
    }
}

struct Inner {
    config: BinanceConfig,
    client: reqwest::Client,
    connection: ConnectionManager,
    trades: DashMap<String, TradeCallback>,
    books: DashMap<String, BookCallback>,
    klines: DashMap<String, KlineCallback>,
    seq: BookSequenceTracker,
    next_id: AtomicU64,
    last_message_ns: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Binance venue adapter.
pub struct BinanceAdapter {
    inner: Arc<Inner>,
}

impl BinanceAdapter {
    /// Build the adapter around the facade-owned WS breaker.
    pub fn new(config: BinanceConfig, ws_breaker: Arc<CircuitBreaker>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connection = ConnectionManager::new(
            VenueId::Binance,
            ConnectionConfig {
                url: config.ws_url.clone(),
                connect_timeout: config.connect_timeout,
                read_timeout: config.read_timeout,
                max_reconnect_attempts: config.max_reconnect_attempts,
            },
            ws_breaker,
            shutdown_rx,
        );
        Self {
            inner: Arc::new(Inner {
                client: reqwest::Client::new(),
                connection,
                trades: DashMap::new(),
                books: DashMap::new(),
                klines: DashMap::new(),
                // Depth update ids count every delta, so a skip is a gap.
                seq: BookSequenceTracker::new(true),
                next_id: AtomicU64::new(1),
                last_message_ns: AtomicU64::new(0),
                shutdown,
                config,
            }),
        }
    }

    async fn send_subscribe(inner: &Inner, streams: Vec<String>) -> Result<()> {
        if streams.is_empty() {
            return Ok(());
        }
        let request = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": streams,
            "id": inner.next_id.fetch_add(1, Ordering::Relaxed),
        });
        inner
            .connection
            .send(Message::Text(request.to_string().into()))
            .await
    }

    fn subscribed_streams(inner: &Inner) -> Vec<String> {
        let mut streams = Vec::new();
        for entry in inner.trades.iter() {
            streams.push(format!("{}@trade", entry.key()));
        }
        for entry in inner.books.iter() {
            streams.push(format!("{}@depth", entry.key()));
        }
        for entry in inner.klines.iter() {
            if let Some((symbol, interval)) = entry.key().split_once('@') {
                streams.push(format!("{symbol}@kline_{interval}"));
            }
        }
        streams
    }

    fn spawn_reader(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = inner.connection.receive() => received,
                };

                match received {
                    Ok(Some(Message::Text(text))) => {
                        inner
                            .last_message_ns
                            .store(types::current_timestamp_ns(), Ordering::Relaxed);
                        if let Err(e) = Self::dispatch(&inner, &text).await {
                            tracing::warn!(venue = "binance", error = %e, "message dropped");
                        }
                    }
                    Ok(Some(Message::Ping(_) | Message::Pong(_))) => {}
                    Ok(Some(Message::Close(_))) | Ok(None) => {
                        tracing::info!(venue = "binance", "stream closed, reconnecting");
                        if Self::recover(&inner).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::warn!(venue = "binance", error = %e, "stream error, reconnecting");
                        if Self::recover(&inner).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(venue = "binance", "reader task stopped");
        });
    }

    /// Reconnect, resubscribe, and resync every tracked book.
    async fn recover(inner: &Arc<Inner>) -> Result<()> {
        loop {
            match inner.connection.reconnect().await {
                Ok(()) => break,
                Err(GatewayError::CircuitOpen { .. }) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                // Shutdown and attempt exhaustion end the reader for good.
                Err(e) => match &e {
                    GatewayError::ConnectionFailed { reason, .. }
                        if reason == "shutdown" || reason.starts_with("exceeded") =>
                    {
                        return Err(e);
                    }
                    _ => {}
                },
            }
        }

        Self::send_subscribe(inner, Self::subscribed_streams(inner)).await?;

        let symbols: Vec<String> = inner.books.iter().map(|e| e.key().clone()).collect();
        for venue_symbol in symbols {
            Self::resync_book(inner, &venue_symbol).await;
        }
        Ok(())
    }

    /// Fetch a snapshot, deliver it flagged `resync`, and reset tracking.
    /// Failures leave the gap outstanding; the next delta retriggers.
    async fn resync_book(inner: &Arc<Inner>, venue_symbol: &str) {
        let Some(callback) = inner.books.get(venue_symbol).map(|e| e.value().clone()) else {
            return;
        };
        match Self::fetch_book(inner, venue_symbol, 100).await {
            Ok(response) => {
                let mut snapshot = response.data;
                snapshot.resync = true;
                inner.seq.reset(&snapshot.symbol, snapshot.sequence);
                callback(snapshot);
            }
            Err(e) => {
                tracing::warn!(
                    venue = "binance",
                    symbol = %venue_symbol,
                    error = %e,
                    "book resync failed; will retry on next delta"
                );
                inner.seq.clear(&venue_symbol.to_ascii_uppercase());
            }
        }
    }

    async fn dispatch(inner: &Arc<Inner>, text: &str) -> Result<()> {
        let msg: Value = serde_json::from_str(text)
            .map_err(|e| parse_error("stream message", &e.to_string()))?;

        match msg["e"].as_str().unwrap_or_default() {
            "trade" => {
                let event: BinanceTradeEvent = serde_json::from_value(msg)
                    .map_err(|e| parse_error("trade event", &e.to_string()))?;
                let key = event.symbol.to_ascii_lowercase();
                if let Some(callback) = inner.trades.get(&key).map(|e| e.value().clone()) {
                    let trade = Trade::try_from(event)?;
                    callback(trade);
                }
            }
            "depthUpdate" => {
                let event: BinanceDepthEvent = serde_json::from_value(msg)
                    .map_err(|e| parse_error("depth event", &e.to_string()))?;
                let key = event.symbol.to_ascii_lowercase();
                let Some(callback) = inner.books.get(&key).map(|e| e.value().clone()) else {
                    return Ok(());
                };
                let book = BookL2::try_from(event)?;

                match inner.seq.observe(&book.symbol, book.sequence) {
                    SeqCheck::Ok | SeqCheck::First => callback(book),
                    SeqCheck::Gap { last, got } => {
                        tracing::warn!(
                            venue = "binance",
                            symbol = %book.symbol,
                            last,
                            got,
                            "book sequence gap, resyncing"
                        );
                        Self::resync_book(inner, &key).await;
                        return Err(GatewayError::SequenceGap {
                            venue: VenueId::Binance,
                            symbol: book.symbol,
                            last,
                            got,
                        });
                    }
                }
            }
            "kline" => {
                let symbol = msg["s"].as_str().unwrap_or_default().to_string();
                let payload: BinanceKlinePayload = serde_json::from_value(msg["k"].clone())
                    .map_err(|e| parse_error("kline event", &e.to_string()))?;
                let key = format!(
                    "{}@{}",
                    symbol.to_ascii_lowercase(),
                    payload.interval.clone()
                );
                if let Some(callback) = inner.klines.get(&key).map(|e| e.value().clone()) {
                    callback(payload.into_kline(&symbol)?);
                }
            }
            _ => {
                // Subscription acks and unknown events carry no data.
                tracing::trace!(venue = "binance", "ignoring control message");
            }
        }
        Ok(())
    }

    async fn fetch_book(
        inner: &Inner,
        venue_symbol: &str,
        depth: usize,
    ) -> Result<RestResponse<BookL2>> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            inner.config.rest_url,
            venue_symbol.to_ascii_uppercase(),
            depth
        );
        let (body, rate_headers) = rest_get_json(&inner.client, VenueId::Binance, &url).await?;

        let parse_side = |side: &Value| -> Result<Vec<BookLevel>> {
            let rows = side
                .as_array()
                .ok_or_else(|| parse_error("depth response", "missing ladder"))?;
            let mut levels = Vec::with_capacity(rows.len());
            for row in rows {
                let price = row[0]
                    .as_str()
                    .ok_or_else(|| parse_error("depth response", "price not a string"))?;
                let size = row[1]
                    .as_str()
                    .ok_or_else(|| parse_error("depth response", "size not a string"))?;
                levels.push(BookLevel {
                    price: decimal_f64(price, "depth price")?,
                    size: decimal_f64(size, "depth size")?,
                });
            }
            Ok(levels)
        };

        let book = BookL2 {
            symbol: venue_symbol.to_ascii_uppercase(),
            sequence: body["lastUpdateId"].as_u64().unwrap_or_default(),
            bids: parse_side(&body["bids"])?,
            asks: parse_side(&body["asks"])?,
            timestamp_ns: types::current_timestamp_ns(),
            resync: false,
        };
        book.validate()?;
        Ok(RestResponse {
            data: book,
            rate_headers,
        })
    }
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Binance
    }

    async fn connect_ws(&self) -> Result<()> {
        self.inner.connection.connect().await?;
        self.spawn_reader();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.inner.shutdown.send(true);
        self.inner.connection.close().await
    }

    async fn is_connected(&self) -> bool {
        self.inner.connection.is_connected().await
    }

    async fn subscribe_trades(&self, symbol: &str, callback: TradeCallback) -> Result<()> {
        let key = self.venue_symbol(symbol).to_ascii_lowercase();
        self.inner.trades.insert(key.clone(), callback);
        Self::send_subscribe(&self.inner, vec![format!("{key}@trade")]).await
    }

    async fn subscribe_book_l2(&self, symbol: &str, callback: BookCallback) -> Result<()> {
        let key = self.venue_symbol(symbol).to_ascii_lowercase();
        self.inner.books.insert(key.clone(), callback);
        Self::send_subscribe(&self.inner, vec![format!("{key}@depth")]).await
    }

    async fn subscribe_klines(
        &self,
        symbol: &str,
        interval: &str,
        callback: KlineCallback,
    ) -> Result<()> {
        let interval = self.normalize_interval(interval)?;
        let venue_symbol = self.venue_symbol(symbol).to_ascii_lowercase();
        let key = format!("{venue_symbol}@{interval}");
        self.inner.klines.insert(key, callback);
        Self::send_subscribe(
            &self.inner,
            vec![format!("{venue_symbol}@kline_{interval}")],
        )
        .await
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<RestResponse<Vec<Kline>>> {
        let interval = self.normalize_interval(interval)?;
        let venue_symbol = self.venue_symbol(symbol);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.inner.config.rest_url, venue_symbol, interval, limit
        );
        let (body, rate_headers) =
            rest_get_json(&self.inner.client, VenueId::Binance, &url).await?;

        let rows = body
            .as_array()
            .ok_or_else(|| parse_error("klines response", "not an array"))?;
        let mut klines = Vec::with_capacity(rows.len());
        for row in rows {
            klines.push(parse_rest_kline(row, &venue_symbol, &interval)?);
        }
        Ok(RestResponse {
            data: klines,
            rate_headers,
        })
    }

    async fn get_trades(&self, symbol: &str, limit: usize) -> Result<RestResponse<Vec<Trade>>> {
        let venue_symbol = self.venue_symbol(symbol);
        let url = format!(
            "{}/api/v3/trades?symbol={}&limit={}",
            self.inner.config.rest_url, venue_symbol, limit
        );
        let (body, rate_headers) =
            rest_get_json(&self.inner.client, VenueId::Binance, &url).await?;

        let rows = body
            .as_array()
            .ok_or_else(|| parse_error("trades response", "not an array"))?;
        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let trade = Trade {
                symbol: venue_symbol.clone(),
                price: decimal_f64(
                    row["price"].as_str().unwrap_or_default(),
                    "rest trade price",
                )?,
                size: decimal_f64(row["qty"].as_str().unwrap_or_default(), "rest trade qty")?,
                side: if row["isBuyerMaker"].as_bool().unwrap_or(false) {
                    Side::Sell
                } else {
                    Side::Buy
                },
                trade_id: row["id"].as_u64().unwrap_or_default().to_string(),
                timestamp_ns: row["time"].as_u64().unwrap_or_default() * 1_000_000,
            };
            trade.validate()?;
            trades.push(trade);
        }
        Ok(RestResponse {
            data: trades,
            rate_headers,
        })
    }

    async fn get_book_l2(&self, symbol: &str, depth: usize) -> Result<RestResponse<BookL2>> {
        let venue_symbol = self.venue_symbol(symbol).to_ascii_lowercase();
        Self::fetch_book(&self.inner, &venue_symbol, depth).await
    }

    fn venue_symbol(&self, canonical: &str) -> String {
        canonical.to_ascii_uppercase()
    }

    fn normalize_symbol(&self, raw: &str) -> String {
        raw.to_ascii_uppercase()
    }

    fn normalize_interval(&self, interval: &str) -> Result<String> {
        if INTERVALS.contains(&interval) {
            Ok(interval.to_string())
        } else {
            Err(GatewayError::NotSupported(format!(
                "binance interval {interval}"
            )))
        }
    }

    async fn health(&self) -> AdapterHealth {
        let last = self.inner.last_message_ns.load(Ordering::Relaxed);
        AdapterHealth {
            venue: VenueId::Binance,
            ws_connected: self.inner.connection.is_connected().await,
            last_message_ns: (last > 0).then_some(last),
        }
    }
}

fn parse_rest_kline(row: &Value, symbol: &str, interval: &str) -> Result<Kline> {
    let cols = row
        .as_array()
        .ok_or_else(|| parse_error("klines response", "row not an array"))?;
    if cols.len() < 7 {
        return Err(parse_error("klines response", "short row"));
    }
    let text = |i: usize, what: &str| -> Result<f64> {
        decimal_f64(
            cols[i].as_str().unwrap_or_default(),
            what,
        )
    };
    let kline = Kline {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open: text(1, "kline open")?,
        high: text(2, "kline high")?,
        low: text(3, "kline low")?,
        close: text(4, "kline close")?,
        volume: text(5, "kline volume")?,
        open_time_ns: cols[0].as_u64().unwrap_or_default() * 1_000_000,
        close_time_ns: cols[6].as_u64().unwrap_or_default() * 1_000_000,
    };
    kline.validate()?;
    Ok(kline)
}

fn parse_ladder(rows: &[[String; 2]]) -> Result<Vec<BookLevel>> {
    rows.iter()
        .map(|[price, size]| {
            Ok(BookLevel {
                price: decimal_f64(price, "ladder price")?,
                size: decimal_f64(size, "ladder size")?,
            })
        })
        .collect()
}

fn decimal(text: &str, what: &str) -> Result<Decimal> {
    Decimal::from_str(text).map_err(|_| parse_error(what, &format!("invalid decimal {text:?}")))
}

fn decimal_f64(text: &str, what: &str) -> Result<f64> {
    decimal(text, what)?
        .to_f64()
        .ok_or_else(|| parse_error(what, "out of f64 range"))
}

fn parse_error(message: &str, error: &str) -> GatewayError {
    GatewayError::Parse {
        venue: VenueId::Binance,
        message: message.to_string(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_event_parses_and_converts() {
        let json = r#"{
            "e": "trade",
            "E": 1717000000123,
            "s": "BTCUSDT",
            "t": 4242424242,
            "p": "62450.50",
            "q": "0.00420000",
            "T": 1717000000120,
            "m": true
        }"#;

        let event: BinanceTradeEvent = serde_json::from_str(json).unwrap();
        event.validate().unwrap();

        let trade = Trade::try_from(event).unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.side, Side::Sell); // buyer was maker
        assert!((trade.price - 62450.5).abs() < 1e-9);
        assert!((trade.size - 0.0042).abs() < 1e-12);
        assert_eq!(trade.timestamp_ns, 1_717_000_000_120_000_000);
        assert_eq!(trade.trade_id, "4242424242");
    }

    #[test]
    fn trade_event_rejects_bad_values() {
        let json = r#"{
            "e": "trade", "E": 1, "s": "BTCUSDT", "t": 1,
            "p": "not-a-price", "q": "1.0", "T": 1, "m": false
        }"#;
        let event: BinanceTradeEvent = serde_json::from_str(json).unwrap();
        assert!(event.validate().is_err());
    }

    #[test]
    fn depth_event_becomes_canonical_book() {
        let json = r#"{
            "e": "depthUpdate",
            "E": 1717000000500,
            "s": "ETHUSDT",
            "U": 100,
            "u": 105,
            "b": [["3000.10", "1.5"], ["3000.00", "2.0"]],
            "a": [["3000.20", "0.7"], ["3000.30", "0.2"]]
        }"#;

        let event: BinanceDepthEvent = serde_json::from_str(json).unwrap();
        let book = BookL2::try_from(event).unwrap();
        assert_eq!(book.symbol, "ETHUSDT");
        assert_eq!(book.sequence, 105);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.best_bid(), Some(3000.10));
        assert_eq!(book.best_ask(), Some(3000.20));
        assert!(!book.resync);
    }

    #[test]
    fn kline_payload_converts() {
        let json = r#"{
            "t": 1717000000000, "T": 1717000059999, "i": "1m",
            "o": "100.0", "c": "101.0", "h": "102.0", "l": "99.5", "v": "12.5"
        }"#;
        let payload: BinanceKlinePayload = serde_json::from_str(json).unwrap();
        let kline = payload.into_kline("btcusdt").unwrap();
        assert_eq!(kline.symbol, "BTCUSDT");
        assert_eq!(kline.interval, "1m");
        assert!((kline.volume - 12.5).abs() < 1e-9);
    }

    #[test]
    fn rest_kline_row_parses() {
        let row = serde_json::json!([
            1717000000000u64,
            "100.0", "102.0", "99.5", "101.0", "12.5",
            1717000059999u64,
            "1261.1", 42, "6.2", "620.0", "0"
        ]);
        let kline = parse_rest_kline(&row, "BTCUSDT", "1m").unwrap();
        assert!((kline.high - 102.0).abs() < 1e-9);
        assert_eq!(kline.open_time_ns, 1_717_000_000_000_000_000);
    }

    #[test]
    fn intervals_are_validated() {
        let adapter = BinanceAdapter::new(
            BinanceConfig::default(),
            Arc::new(CircuitBreaker::new(
                VenueId::Binance,
                crate::circuit_breaker::Channel::Ws,
                config::CircuitConfig::default(),
            )),
        );
        assert_eq!(adapter.normalize_interval("1m").unwrap(), "1m");
        assert!(adapter.normalize_interval("7m").is_err());
        assert_eq!(adapter.normalize_symbol("btcusdt"), "BTCUSDT");
    }
}
