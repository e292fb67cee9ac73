//! Coinbase Exchange WebSocket + REST adapter
//!
//! Streams the `matches` and `level2_batch` channels and pulls candles,
//! trades, and book snapshots over REST. Coinbase has no candle stream, so
//! `subscribe_klines` is reported as unsupported rather than faked from
//! trades.

use async_trait::async_trait;
use chrono::DateTime;
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

/// canonical interval -> Coinbase granularity seconds.
const GRANULARITIES: &[(&str, u32)] = &[
    ("1m", 60),
    ("5m", 300),
    ("15m", 900),
    ("1h", 3600),
    ("6h", 21_600),
    ("1d", 86_400),
];

/// Configuration for the Coinbase adapter.
#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
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

impl Default for CoinbaseConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-feed.exchange.coinbase.com".to_string(),
            rest_url: "https://api.exchange.coinbase.com".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

/// Parsed Coinbase match event.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseMatchEvent {
    /// Event type ("match" or "last_match")
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unique trade identifier
    pub trade_id: u64,
    /// Trade side from the taker perspective ("buy" or "sell")
    pub side: String,
    /// Trade size as string for precision preservation
    pub size: String,
    /// Trade price as string for precision preservation
    pub price: String,
    /// Product identifier in "BTC-USD" format
    pub product_id: String,
    /// Sequence number for message ordering
    pub sequence: u64,
    /// Trade timestamp in ISO 8601 format
    pub time: String,
}

impl CoinbaseMatchEvent {
    /// Structural and semantic checks before conversion.
    pub fn validate(&self) -> Result<()> {
        if self.event_type != "match" && self.event_type != "last_match" {
            return Err(parse_error(
                "match event",
                &format!("invalid event type {}", self.event_type),
            ));
        }
        if self.product_id.is_empty() {
            return Err(parse_error("match event", "empty product_id"));
        }
        if self.side != "buy" && self.side != "sell" {
            return Err(parse_error(
                "match event",
                &format!("invalid side {}", self.side),
            ));
        }
        let price = decimal(&self.price, "match price")?;
        let size = decimal(&self.size, "match size")?;
        if price <= Decimal::ZERO || size <= Decimal::ZERO {
            return Err(parse_error("match event", "non-positive price or size"));
        }
        DateTime::parse_from_rfc3339(&self.time)
            .map_err(|e| parse_error("match timestamp", &e.to_string()))?;
        Ok(())
    }

    /// Timestamp in nanoseconds since epoch.
    pub fn timestamp_ns(&self) -> Result<u64> {
        let dt = DateTime::parse_from_rfc3339(&self.time)
            .map_err(|e| parse_error("match timestamp", &e.to_string()))?;
        dt.timestamp_nanos_opt()
            .map(|n| n as u64)
            .ok_or_else(|| parse_error("match timestamp", "overflow"))
    }
}

impl TryFrom<CoinbaseMatchEvent> for Trade {
    type Error = GatewayError;

    fn try_from(event: CoinbaseMatchEvent) -> Result<Self> {
        event.validate()?;
        let timestamp_ns = event.timestamp_ns()?;
        let trade = Trade {
            symbol: normalize_product(&event.product_id),
            price: decimal_f64(&event.price, "match price")?,
            size: decimal_f64(&event.size, "match size")?,
            side: if event.side == "buy" {
                Side::Buy
            } else {
                Side::Sell
            },
            trade_id: event.trade_id.to_string(),
            timestamp_ns,
        };
        trade.validate()?;
        Ok(trade)
    }
}

struct Inner {
    config: CoinbaseConfig,
    client: reqwest::Client,
    connection: ConnectionManager,
    trades: DashMap<String, TradeCallback>,
    books: DashMap<String, BookCallback>,
    seq: BookSequenceTracker,
    last_message_ns: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Coinbase venue adapter.
pub struct CoinbaseAdapter {
    inner: Arc<Inner>,
}

impl CoinbaseAdapter {
    /// Build the adapter around the facade-owned WS breaker.
    pub fn new(config: CoinbaseConfig, ws_breaker: Arc<CircuitBreaker>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connection = ConnectionManager::new(
            VenueId::Coinbase,
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
                // Level2 updates carry no ids; timestamps are only
                // non-decreasing.
                seq: BookSequenceTracker::new(false),
                last_message_ns: AtomicU64::new(0),
                shutdown,
                config,
            }),
        }
    }

    async fn send_subscribe(inner: &Inner, product: &str, channel: &str) -> Result<()> {
        let request = serde_json::json!({
            "type": "subscribe",
            "product_ids": [product],
            "channels": [channel],
        });
        inner
            .connection
            .send(Message::Text(request.to_string().into()))
            .await
    }

    fn spawn_reader(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = inner.shutdown.subscribe();
        tokio::spawn(Box::pin(async move {
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
                            tracing::warn!(venue = "coinbase", error = %e, "message dropped");
                        }
                    }
                    Ok(Some(Message::Ping(_) | Message::Pong(_))) => {}
                    Ok(Some(Message::Close(_))) | Ok(None) => {
                        tracing::info!(venue = "coinbase", "stream closed, reconnecting");
                        if Self::recover(&inner).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::warn!(venue = "coinbase", error = %e, "stream error, reconnecting");
                        if Self::recover(&inner).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(venue = "coinbase", "reader task stopped");
        });
    }

    async fn recover(inner: &Arc<Inner>) -> Result<()> {
        loop {
            match inner.connection.reconnect().await {
                Ok(()) => break,
                Err(GatewayError::CircuitOpen { .. }) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
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

        for entry in inner.trades.iter() {
            Self::send_subscribe(inner, entry.key(), "matches").await?;
        }
        for entry in inner.books.iter() {
            Self::send_subscribe(inner, entry.key(), "level2_batch").await?;
        }

        let products: Vec<String> = inner.books.iter().map(|e| e.key().clone()).collect();
        for product in products {
            Self::resync_book(inner, &product).await;
        }
        Ok(())
    }

    async fn resync_book(inner: &Arc<Inner>, product: &str) {
        let Some(callback) = inner.books.get(product).map(|e| e.value().clone()) else {
            return;
        };
        match Self::fetch_book(inner, product, 50).await {
            Ok(response) => {
                let mut snapshot = response.data;
                snapshot.resync = true;
                inner.seq.reset(&snapshot.symbol, snapshot.sequence);
                callback(snapshot);
            }
            Err(e) => {
                tracing::warn!(
                    venue = "coinbase",
                    product = %product,
                    error = %e,
                    "book resync failed; will retry on next update"
                );
                inner.seq.clear(&normalize_product(product));
            }
        }
    }

    async fn dispatch(inner: &Arc<Inner>, text: &str) -> Result<()> {
        let msg: Value = serde_json::from_str(text)
            .map_err(|e| parse_error("stream message", &e.to_string()))?;

        match msg["type"].as_str().unwrap_or_default() {
            "match" | "last_match" => {
                let event: CoinbaseMatchEvent = serde_json::from_value(msg)
                    .map_err(|e| parse_error("match event", &e.to_string()))?;
                let product = event.product_id.clone();
                if let Some(callback) = inner.trades.get(&product).map(|e| e.value().clone()) {
                    callback(Trade::try_from(event)?);
                }
            }
            "snapshot" => {
                let product = msg["product_id"].as_str().unwrap_or_default().to_string();
                let Some(callback) = inner.books.get(&product).map(|e| e.value().clone())
                else {
                    return Ok(());
                };
                let book = parse_snapshot(&msg, &product)?;
                inner.seq.reset(&book.symbol, book.sequence);
                callback(book);
            }
            "l2update" => {
                let product = msg["product_id"].as_str().unwrap_or_default().to_string();
                let Some(callback) = inner.books.get(&product).map(|e| e.value().clone())
                else {
                    return Ok(());
                };
                let book = parse_l2update(&msg, &product)?;

                match inner.seq.observe(&book.symbol, book.sequence) {
                    SeqCheck::Ok | SeqCheck::First => callback(book),
                    SeqCheck::Gap { last, got } => {
                        tracing::warn!(
                            venue = "coinbase",
                            symbol = %book.symbol,
                            last,
                            got,
                            "book time regression, resyncing"
                        );
                        Self::resync_book(inner, &product).await;
                        return Err(GatewayError::SequenceGap {
                            venue: VenueId::Coinbase,
                            symbol: book.symbol,
                            last,
                            got,
                        });
                    }
                }
            }
            "subscriptions" => {
                tracing::debug!(venue = "coinbase", "subscription confirmed");
            }
            "error" => {
                return Err(parse_error(
                    "stream error",
                    msg["message"].as_str().unwrap_or("unknown"),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    async fn fetch_book(
        inner: &Inner,
        product: &str,
        _depth: usize,
    ) -> Result<RestResponse<BookL2>> {
        let url = format!("{}/products/{}/book?level=2", inner.config.rest_url, product);
        let (body, rate_headers) = rest_get_json(&inner.client, VenueId::Coinbase, &url).await?;

        let parse = |side: &str| -> Result<Vec<BookLevel>> {
            let rows = body[side]
                .as_array()
                .ok_or_else(|| parse_error("book response", "missing ladder"))?;
            rows.iter()
                .map(|row| {
                    Ok(BookLevel {
                        price: decimal_f64(
                            row[0].as_str().unwrap_or_default(),
                            "book price",
                        )?,
                        size: decimal_f64(row[1].as_str().unwrap_or_default(), "book size")?,
                    })
                })
                .collect()
        };

        let book = BookL2 {
            symbol: normalize_product(product),
            sequence: body["sequence"].as_u64().unwrap_or_default(),
            bids: parse("bids")?,
            asks: parse("asks")?,
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
impl VenueAdapter for CoinbaseAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Coinbase
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
        let product = self.venue_symbol(symbol);
        self.inner.trades.insert(product.clone(), callback);
        Self::send_subscribe(&self.inner, &product, "matches").await
    }

    async fn subscribe_book_l2(&self, symbol: &str, callback: BookCallback) -> Result<()> {
        let product = self.venue_symbol(symbol);
        self.inner.books.insert(product.clone(), callback);
        Self::send_subscribe(&self.inner, &product, "level2_batch").await
    }

    async fn subscribe_klines(
        &self,
        _symbol: &str,
        _interval: &str,
        _callback: KlineCallback,
    ) -> Result<()> {
        Err(GatewayError::NotSupported(
            "coinbase has no candle stream; use the warm tier".to_string(),
        ))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<RestResponse<Vec<Kline>>> {
        let granularity = granularity_seconds(interval)?;
        let product = self.venue_symbol(symbol);
        let canonical = normalize_product(&product);
        let url = format!(
            "{}/products/{}/candles?granularity={}",
            self.inner.config.rest_url, product, granularity
        );
        let (body, rate_headers) =
            rest_get_json(&self.inner.client, VenueId::Coinbase, &url).await?;

        // Rows arrive newest first: [time, low, high, open, close, volume].
        let rows = body
            .as_array()
            .ok_or_else(|| parse_error("candles response", "not an array"))?;
        let mut klines = Vec::new();
        for row in rows.iter().take(limit) {
            let cols = row
                .as_array()
                .ok_or_else(|| parse_error("candles response", "row not an array"))?;
            if cols.len() < 6 {
                return Err(parse_error("candles response", "short row"));
            }
            let start_s = cols[0]
                .as_f64()
                .ok_or_else(|| parse_error("candle time", "not a number"))?;
            let number = |i: usize, what: &str| -> Result<f64> {
                cols[i].as_f64().ok_or_else(|| parse_error(what, "not a number"))
            };
            let kline = Kline {
                symbol: canonical.clone(),
                interval: interval.to_string(),
                open: number(3, "candle open")?,
                high: number(2, "candle high")?,
                low: number(1, "candle low")?,
                close: number(4, "candle close")?,
                volume: number(5, "candle volume")?,
                open_time_ns: (start_s * 1e9) as u64,
                close_time_ns: ((start_s + granularity as f64) * 1e9) as u64,
            };
            kline.validate()?;
            klines.push(kline);
        }
        klines.reverse();
        Ok(RestResponse {
            data: klines,
            rate_headers,
        })
    }

    async fn get_trades(&self, symbol: &str, limit: usize) -> Result<RestResponse<Vec<Trade>>> {
        let product = self.venue_symbol(symbol);
        let canonical = normalize_product(&product);
        let url = format!(
            "{}/products/{}/trades?limit={}",
            self.inner.config.rest_url, product, limit
        );
        let (body, rate_headers) =
            rest_get_json(&self.inner.client, VenueId::Coinbase, &url).await?;

        let rows = body
            .as_array()
            .ok_or_else(|| parse_error("trades response", "not an array"))?;
        let mut trades = Vec::new();
        for row in rows.iter().take(limit) {
            let time = row["time"].as_str().unwrap_or_default();
            let dt = DateTime::parse_from_rfc3339(time)
                .map_err(|e| parse_error("trade timestamp", &e.to_string()))?;
            let trade = Trade {
                symbol: canonical.clone(),
                price: decimal_f64(row["price"].as_str().unwrap_or_default(), "trade price")?,
                size: decimal_f64(row["size"].as_str().unwrap_or_default(), "trade size")?,
                side: if row["side"].as_str() == Some("buy") {
                    Side::Buy
                } else {
                    Side::Sell
                },
                trade_id: row["trade_id"].as_u64().unwrap_or_default().to_string(),
                timestamp_ns: dt.timestamp_nanos_opt().unwrap_or_default() as u64,
            };
            trade.validate()?;
            trades.push(trade);
        }
        trades.reverse();
        Ok(RestResponse {
            data: trades,
            rate_headers,
        })
    }

    async fn get_book_l2(&self, symbol: &str, depth: usize) -> Result<RestResponse<BookL2>> {
        let product = self.venue_symbol(symbol);
        Self::fetch_book(&self.inner, &product, depth).await
    }

    fn venue_symbol(&self, canonical: &str) -> String {
        let upper = canonical.to_ascii_uppercase();
        if upper.contains('-') {
            return upper;
        }
        for quote in ["USDT", "USDC", "USD", "EUR", "GBP"] {
            if let Some(base) = upper.strip_suffix(quote) {
                if !base.is_empty() {
                    return format!("{base}-{quote}");
                }
            }
        }
        upper
    }

    fn normalize_symbol(&self, raw: &str) -> String {
        normalize_product(raw)
    }

    fn normalize_interval(&self, interval: &str) -> Result<String> {
        granularity_seconds(interval).map(|g| g.to_string())
    }

    async fn health(&self) -> AdapterHealth {
        let last = self.inner.last_message_ns.load(Ordering::Relaxed);
        AdapterHealth {
            venue: VenueId::Coinbase,
            ws_connected: self.inner.connection.is_connected().await,
            last_message_ns: (last > 0).then_some(last),
        }
    }
}

/// `BTC-USD` -> `BTCUSD`.
fn normalize_product(product: &str) -> String {
    product.to_ascii_uppercase().replace('-', "")
}

fn granularity_seconds(interval: &str) -> Result<u32> {
    GRANULARITIES
        .iter()
        .find(|(name, _)| *name == interval)
        .map(|(_, secs)| *secs)
        .ok_or_else(|| GatewayError::NotSupported(format!("coinbase interval {interval}")))
}

fn parse_snapshot(msg: &Value, product: &str) -> Result<BookL2> {
    let parse = |side: &str| -> Result<Vec<BookLevel>> {
        let rows = msg[side]
            .as_array()
            .ok_or_else(|| parse_error("snapshot", "missing ladder"))?;
        rows.iter()
            .map(|row| {
                Ok(BookLevel {
                    price: decimal_f64(row[0].as_str().unwrap_or_default(), "snapshot price")?,
                    size: decimal_f64(row[1].as_str().unwrap_or_default(), "snapshot size")?,
                })
            })
            .collect()
    };

    let book = BookL2 {
        symbol: normalize_product(product),
        sequence: types::current_timestamp_ns() / 1_000,
        bids: parse("bids")?,
        asks: parse("asks")?,
        timestamp_ns: types::current_timestamp_ns(),
        resync: false,
    };
    book.validate()?;
    Ok(book)
}

fn parse_l2update(msg: &Value, product: &str) -> Result<BookL2> {
    let time = msg["time"].as_str().unwrap_or_default();
    let timestamp_ns = DateTime::parse_from_rfc3339(time)
        .ok()
        .and_then(|dt| dt.timestamp_nanos_opt())
        .map(|n| n as u64)
        .unwrap_or_else(types::current_timestamp_ns);

    let mut bids = Vec::new();
    let mut asks = Vec::new();
    let changes = msg["changes"]
        .as_array()
        .ok_or_else(|| parse_error("l2update", "missing changes"))?;
    for change in changes {
        let side = change[0].as_str().unwrap_or_default();
        let level = BookLevel {
            price: decimal_f64(change[1].as_str().unwrap_or_default(), "l2update price")?,
            size: decimal_f64(change[2].as_str().unwrap_or_default(), "l2update size")?,
        };
        match side {
            "buy" => bids.push(level),
            "sell" => asks.push(level),
            other => {
                return Err(parse_error(
                    "l2update",
                    &format!("unknown change side {other:?}"),
                ))
            }
        }
    }

    // Deltas are per-level edits; ladder ordering does not apply, so sort
    // them into canonical order before validation.
    bids.sort_by(|a, b| b.price.total_cmp(&a.price));
    asks.sort_by(|a, b| a.price.total_cmp(&b.price));

    let book = BookL2 {
        symbol: normalize_product(product),
        sequence: timestamp_ns / 1_000,
        bids,
        asks,
        timestamp_ns,
        resync: false,
    };
    book.validate()?;
    Ok(book)
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
        venue: VenueId::Coinbase,
        message: message.to_string(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_event_parses_and_converts() {
        let json = r#"{
            "type": "match",
            "trade_id": 865127782,
            "maker_order_id": "5f4bb11b-f065-4025-ad53-2091b10ad2cf",
            "taker_order_id": "66715b57-0167-4ae9-8b2b-75a064a923f4",
            "side": "buy",
            "size": "0.00004147",
            "price": "116827.85",
            "product_id": "BTC-USD",
            "sequence": 110614077300,
            "time": "2026-07-22T20:11:30.012637Z"
        }"#;

        let event: CoinbaseMatchEvent = serde_json::from_str(json).unwrap();
        event.validate().unwrap();

        let trade = Trade::try_from(event).unwrap();
        assert_eq!(trade.symbol, "BTCUSD");
        assert_eq!(trade.side, Side::Buy);
        assert!((trade.price - 116_827.85).abs() < 1e-6);
        assert_eq!(trade.trade_id, "865127782");
    }

    #[test]
    fn match_event_rejects_bad_side_and_price() {
        let base = r#"{
            "type": "match", "trade_id": 1, "side": "SIDE", "size": "1.0",
            "price": "PRICE", "product_id": "BTC-USD", "sequence": 1,
            "time": "2026-07-22T20:11:30.012637Z"
        }"#;

        let bad_side: CoinbaseMatchEvent =
            serde_json::from_str(&base.replace("SIDE", "hold").replace("PRICE", "10")).unwrap();
        assert!(bad_side.validate().is_err());

        let bad_price: CoinbaseMatchEvent =
            serde_json::from_str(&base.replace("SIDE", "buy").replace("PRICE", "0")).unwrap();
        assert!(bad_price.validate().is_err());
    }

    #[test]
    fn l2update_splits_and_sorts_changes() {
        let msg = serde_json::json!({
            "type": "l2update",
            "product_id": "ETH-USD",
            "time": "2026-07-22T20:11:30.012637Z",
            "changes": [
                ["buy", "2999.00", "1.0"],
                ["buy", "3000.10", "1.5"],
                ["sell", "3000.30", "0.2"],
                ["sell", "3000.20", "0.7"]
            ]
        });
        let book = parse_l2update(&msg, "ETH-USD").unwrap();
        assert_eq!(book.symbol, "ETHUSD");
        assert_eq!(book.best_bid(), Some(3000.10));
        assert_eq!(book.best_ask(), Some(3000.20));
        assert!(book.sequence > 0);
    }

    #[test]
    fn snapshot_parses_ladders() {
        let msg = serde_json::json!({
            "type": "snapshot",
            "product_id": "BTC-USD",
            "bids": [["62000.00", "1.0"], ["61999.00", "2.0"]],
            "asks": [["62001.00", "0.5"]]
        });
        let book = parse_snapshot(&msg, "BTC-USD").unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 1);
    }

    #[test]
    fn product_and_interval_mapping() {
        let adapter = CoinbaseAdapter::new(
            CoinbaseConfig::default(),
            Arc::new(CircuitBreaker::new(
                VenueId::Coinbase,
                crate::circuit_breaker::Channel::Ws,
                config::CircuitConfig::default(),
            )),
        );
        assert_eq!(adapter.venue_symbol("BTCUSD"), "BTC-USD");
        assert_eq!(adapter.venue_symbol("ethusdt"), "ETH-USDT");
        assert_eq!(adapter.normalize_symbol("BTC-USD"), "BTCUSD");
        assert_eq!(adapter.normalize_interval("1h").unwrap(), "3600");
        assert!(adapter.normalize_interval("2h").is_err());
    }
}
