//! Kraken WebSocket + REST adapter
//!
//! Kraken mixes JSON control messages with array-based data messages on the
//! same stream, names pairs three different ways (`XBT/USD` on the socket,
//! `XXBTZUSD` in REST results, `XBTUSD` in REST queries), and carries no
//! book sequence numbers. This adapter hides all of it: pairs come out as
//! canonical symbols and book entries carry a synthesized sequence from the
//! venue's microsecond timestamps (non-decreasing, so a regression is a
//! gap).

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::prelude::{FromStr, ToPrimitive};
use rust_decimal::Decimal;
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

/// (canonical, socket pair, legacy REST result key) translation rows.
const PAIRS: &[(&str, &str, &str)] = &[
    ("BTCUSD", "XBT/USD", "XXBTZUSD"),
    ("BTCEUR", "XBT/EUR", "XXBTZEUR"),
    ("ETHUSD", "ETH/USD", "XETHZUSD"),
    ("ETHEUR", "ETH/EUR", "XETHZEUR"),
    ("SOLUSD", "SOL/USD", "SOLUSD"),
    ("DOGEUSD", "XDG/USD", "XDGUSD"),
    ("USDTUSD", "USDT/USD", "USDTZUSD"),
];

/// canonical interval -> kraken minutes.
const INTERVALS: &[(&str, u32)] = &[
    ("1m", 1),
    ("5m", 5),
    ("15m", 15),
    ("30m", 30),
    ("1h", 60),
    ("4h", 240),
    ("1d", 1440),
    ("1w", 10080),
];

/// Configuration for the Kraken adapter.
#[derive(Debug, Clone)]
pub struct KrakenConfig {
    /// WebSocket endpoint
    pub ws_url: String,
    /// REST endpoint
    pub rest_url: String,
    /// Book subscription depth
    pub book_depth: usize,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Stream read timeout
    pub read_timeout: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for KrakenConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.kraken.com".to_string(),
            rest_url: "https://api.kraken.com".to_string(),
            book_depth: 10,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

struct Inner {
    config: KrakenConfig,
    client: reqwest::Client,
    connection: ConnectionManager,
    trades: DashMap<String, TradeCallback>,
    books: DashMap<String, BookCallback>,
    klines: DashMap<String, KlineCallback>,
    seq: BookSequenceTracker,
    last_message_ns: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Kraken venue adapter.
pub struct KrakenAdapter {
    inner: Arc<Inner>,
}

impl KrakenAdapter {
    /// Build the adapter around the facade-owned WS breaker.
    pub fn new(config: KrakenConfig, ws_breaker: Arc<CircuitBreaker>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connection = ConnectionManager::new(
            VenueId::Kraken,
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
                // Timestamp-derived sequences are only non-decreasing.
                seq: BookSequenceTracker::new(false),
                last_message_ns: AtomicU64::new(0),
                shutdown,
                config,
            }),
        }
    }

    async fn send_subscribe(inner: &Inner, pair: &str, subscription: Value) -> Result<()> {
        let request = serde_json::json!({
            "event": "subscribe",
            "pair": [pair],
            "subscription": subscription,
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
                            tracing::warn!(venue = "kraken", error = %e, "message dropped");
                        }
                    }
                    Ok(Some(Message::Ping(_) | Message::Pong(_))) => {}
                    Ok(Some(Message::Close(_))) | Ok(None) => {
                        tracing::info!(venue = "kraken", "stream closed, reconnecting");
                        if Self::recover(&inner).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::warn!(venue = "kraken", error = %e, "stream error, reconnecting");
                        if Self::recover(&inner).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(venue = "kraken", "reader task stopped");
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
            Self::send_subscribe(inner, entry.key(), serde_json::json!({"name": "trade"}))
                .await?;
        }
        for entry in inner.books.iter() {
            Self::send_subscribe(
                inner,
                entry.key(),
                serde_json::json!({"name": "book", "depth": inner.config.book_depth}),
            )
            .await?;
        }
        for entry in inner.klines.iter() {
            if let Some((pair, minutes)) = entry.key().rsplit_once('@') {
                if let Ok(minutes) = minutes.parse::<u32>() {
                    Self::send_subscribe(
                        inner,
                        pair,
                        serde_json::json!({"name": "ohlc", "interval": minutes}),
                    )
                    .await?;
                }
            }
        }

        let pairs: Vec<String> = inner.books.iter().map(|e| e.key().clone()).collect();
        for pair in pairs {
            Self::resync_book(inner, &pair).await;
        }
        Ok(())
    }

    async fn resync_book(inner: &Arc<Inner>, pair: &str) {
        let Some(callback) = inner.books.get(pair).map(|e| e.value().clone()) else {
            return;
        };
        let canonical = normalize_symbol_impl(pair);
        match Self::fetch_book(inner, &canonical, inner.config.book_depth).await {
            Ok(response) => {
                let mut snapshot = response.data;
                snapshot.resync = true;
                inner.seq.reset(&snapshot.symbol, snapshot.sequence);
                callback(snapshot);
            }
            Err(e) => {
                tracing::warn!(
                    venue = "kraken",
                    pair = %pair,
                    error = %e,
                    "book resync failed; will retry on next update"
                );
                inner.seq.clear(&canonical);
            }
        }
    }

    /// Route one stream message. Control messages are JSON objects; data
    /// messages are arrays `[channelId, payload, channelName, pair]`.
    async fn dispatch(inner: &Arc<Inner>, text: &str) -> Result<()> {
        let msg: Value = serde_json::from_str(text)
            .map_err(|e| parse_error("stream message", &e.to_string()))?;

        let Some(parts) = msg.as_array() else {
            match msg["event"].as_str().unwrap_or_default() {
                "subscriptionStatus" => {
                    if msg["status"].as_str() == Some("error") {
                        tracing::warn!(
                            venue = "kraken",
                            error = %msg["errorMessage"].as_str().unwrap_or("unknown"),
                            "subscription rejected"
                        );
                    }
                }
                "heartbeat" | "systemStatus" | "pong" => {}
                other => {
                    tracing::trace!(venue = "kraken", event = %other, "ignoring control message");
                }
            }
            return Ok(());
        };

        if parts.len() < 4 {
            return Ok(());
        }
        let channel = parts[parts.len() - 2].as_str().unwrap_or_default();
        let pair = parts[parts.len() - 1].as_str().unwrap_or_default().to_string();

        if channel == "trade" {
            Self::dispatch_trades(inner, &pair, &parts[1])?;
        } else if channel.starts_with("book") {
            // Kraken may split bids and asks into separate payload objects
            // within one frame; fold them back together.
            let mut merged = serde_json::Map::new();
            for payload in &parts[1..parts.len() - 2] {
                if let Some(object) = payload.as_object() {
                    merged.extend(object.clone());
                }
            }
            Self::dispatch_book(inner, &pair, &Value::Object(merged)).await?;
        } else if channel.starts_with("ohlc") {
            Self::dispatch_kline(inner, &pair, channel, &parts[1])?;
        }
        Ok(())
    }

    fn dispatch_trades(inner: &Arc<Inner>, pair: &str, payload: &Value) -> Result<()> {
        let Some(callback) = inner.trades.get(pair).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let rows = payload
            .as_array()
            .ok_or_else(|| parse_error("trade payload", "not an array"))?;

        let symbol = normalize_symbol_impl(pair);
        for row in rows {
            let trade = parse_trade_row(row, &symbol)?;
            callback(trade);
        }
        Ok(())
    }

    async fn dispatch_book(inner: &Arc<Inner>, pair: &str, payload: &Value) -> Result<()> {
        let Some(callback) = inner.books.get(pair).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let symbol = normalize_symbol_impl(pair);

        // Snapshots use "bs"/"as"; deltas use "b"/"a".
        let is_snapshot = payload.get("bs").is_some() || payload.get("as").is_some();
        let bids = parse_book_side(payload, &["bs", "b"])?;
        let asks = parse_book_side(payload, &["as", "a"])?;
        let sequence = book_sequence(payload);

        let book = BookL2 {
            symbol: symbol.clone(),
            sequence,
            bids,
            asks,
            timestamp_ns: types::current_timestamp_ns(),
            resync: false,
        };
        book.validate()?;

        if is_snapshot {
            inner.seq.reset(&symbol, sequence);
            callback(book);
            return Ok(());
        }

        match inner.seq.observe(&symbol, sequence) {
            SeqCheck::Ok | SeqCheck::First => callback(book),
            SeqCheck::Gap { last, got } => {
                tracing::warn!(
                    venue = "kraken",
                    symbol = %symbol,
                    last,
                    got,
                    "book sequence regression, resyncing"
                );
                Self::resync_book(inner, pair).await;
                return Err(GatewayError::SequenceGap {
                    venue: VenueId::Kraken,
                    symbol,
                    last,
                    got,
                });
            }
        }
        Ok(())
    }

    fn dispatch_kline(
        inner: &Arc<Inner>,
        pair: &str,
        channel: &str,
        payload: &Value,
    ) -> Result<()> {
        let minutes = channel
            .rsplit_once('-')
            .and_then(|(_, m)| m.parse::<u32>().ok())
            .unwrap_or(1);
        let key = format!("{pair}@{minutes}");
        let Some(callback) = inner.klines.get(&key).map(|e| e.value().clone()) else {
            return Ok(());
        };

        let row = payload
            .as_array()
            .ok_or_else(|| parse_error("ohlc payload", "not an array"))?;
        if row.len() < 8 {
            return Err(parse_error("ohlc payload", "short row"));
        }

        let symbol = normalize_symbol_impl(pair);
        let interval = INTERVALS
            .iter()
            .find(|(_, m)| *m == minutes)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| format!("{minutes}m"));

        let end_s = value_f64(&row[1], "ohlc end time")?;
        let kline = Kline {
            symbol,
            interval,
            open: value_f64(&row[2], "ohlc open")?,
            high: value_f64(&row[3], "ohlc high")?,
            low: value_f64(&row[4], "ohlc low")?,
            close: value_f64(&row[5], "ohlc close")?,
            volume: value_f64(&row[7], "ohlc volume")?,
            open_time_ns: ((end_s - 60.0 * minutes as f64).max(0.0) * 1e9) as u64,
            close_time_ns: (end_s * 1e9) as u64,
        };
        kline.validate()?;
        callback(kline);
        Ok(())
    }

    async fn fetch_book(
        inner: &Inner,
        canonical: &str,
        depth: usize,
    ) -> Result<RestResponse<BookL2>> {
        let query_pair = rest_query_pair(canonical);
        let url = format!(
            "{}/0/public/Depth?pair={}&count={}",
            inner.config.rest_url, query_pair, depth
        );
        let (body, rate_headers) = rest_get_json(&inner.client, VenueId::Kraken, &url).await?;
        let result = rest_result(&body)?;

        let (_, pair_body) = result
            .as_object()
            .and_then(|o| o.iter().next())
            .ok_or_else(|| parse_error("depth response", "empty result"))?;

        let parse = |side: &str| -> Result<Vec<BookLevel>> {
            let rows = pair_body[side]
                .as_array()
                .ok_or_else(|| parse_error("depth response", "missing ladder"))?;
            rows.iter()
                .map(|row| {
                    Ok(BookLevel {
                        price: value_f64(&row[0], "depth price")?,
                        size: value_f64(&row[1], "depth size")?,
                    })
                })
                .collect()
        };

        let bids = parse("bids")?;
        let asks = parse("asks")?;
        let sequence = pair_body["bids"]
            .as_array()
            .into_iter()
            .chain(pair_body["asks"].as_array())
            .flatten()
            .filter_map(|row| row.get(2))
            .filter_map(|t| value_f64(t, "depth time").ok())
            .fold(0u64, |acc, t| acc.max((t * 1e6) as u64));

        let book = BookL2 {
            symbol: canonical.to_string(),
            sequence,
            bids,
            asks,
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
impl VenueAdapter for KrakenAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Kraken
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
        let pair = self.venue_symbol(symbol);
        self.inner.trades.insert(pair.clone(), callback);
        Self::send_subscribe(&self.inner, &pair, serde_json::json!({"name": "trade"})).await
    }

    async fn subscribe_book_l2(&self, symbol: &str, callback: BookCallback) -> Result<()> {
        let pair = self.venue_symbol(symbol);
        self.inner.books.insert(pair.clone(), callback);
        Self::send_subscribe(
            &self.inner,
            &pair,
            serde_json::json!({"name": "book", "depth": self.inner.config.book_depth}),
        )
        .await
    }

    async fn subscribe_klines(
        &self,
        symbol: &str,
        interval: &str,
        callback: KlineCallback,
    ) -> Result<()> {
        let minutes = interval_minutes(interval)?;
        let pair = self.venue_symbol(symbol);
        self.inner
            .klines
            .insert(format!("{pair}@{minutes}"), callback);
        Self::send_subscribe(
            &self.inner,
            &pair,
            serde_json::json!({"name": "ohlc", "interval": minutes}),
        )
        .await
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<RestResponse<Vec<Kline>>> {
        let minutes = interval_minutes(interval)?;
        let canonical = self.normalize_symbol(symbol);
        let url = format!(
            "{}/0/public/OHLC?pair={}&interval={}",
            self.inner.config.rest_url,
            rest_query_pair(&canonical),
            minutes
        );
        let (body, rate_headers) =
            rest_get_json(&self.inner.client, VenueId::Kraken, &url).await?;
        let result = rest_result(&body)?;

        let rows = result
            .as_object()
            .and_then(|o| o.iter().find(|(k, _)| *k != "last"))
            .and_then(|(_, v)| v.as_array())
            .ok_or_else(|| parse_error("ohlc response", "missing pair rows"))?;

        let mut klines = Vec::new();
        for row in rows.iter().rev().take(limit) {
            let cols = row
                .as_array()
                .ok_or_else(|| parse_error("ohlc response", "row not an array"))?;
            if cols.len() < 7 {
                return Err(parse_error("ohlc response", "short row"));
            }
            let start_s = value_f64(&cols[0], "ohlc time")?;
            let kline = Kline {
                symbol: canonical.clone(),
                interval: interval.to_string(),
                open: value_f64(&cols[1], "ohlc open")?,
                high: value_f64(&cols[2], "ohlc high")?,
                low: value_f64(&cols[3], "ohlc low")?,
                close: value_f64(&cols[4], "ohlc close")?,
                volume: value_f64(&cols[6], "ohlc volume")?,
                open_time_ns: (start_s * 1e9) as u64,
                close_time_ns: ((start_s + 60.0 * minutes as f64) * 1e9) as u64,
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
        let canonical = self.normalize_symbol(symbol);
        let url = format!(
            "{}/0/public/Trades?pair={}",
            self.inner.config.rest_url,
            rest_query_pair(&canonical)
        );
        let (body, rate_headers) =
            rest_get_json(&self.inner.client, VenueId::Kraken, &url).await?;
        let result = rest_result(&body)?;

        let rows = result
            .as_object()
            .and_then(|o| o.iter().find(|(k, _)| *k != "last"))
            .and_then(|(_, v)| v.as_array())
            .ok_or_else(|| parse_error("trades response", "missing pair rows"))?;

        let mut trades = Vec::new();
        for row in rows.iter().rev().take(limit) {
            trades.push(parse_trade_row(row, &canonical)?);
        }
        trades.reverse();
        Ok(RestResponse {
            data: trades,
            rate_headers,
        })
    }

    async fn get_book_l2(&self, symbol: &str, depth: usize) -> Result<RestResponse<BookL2>> {
        let canonical = self.normalize_symbol(symbol);
        Self::fetch_book(&self.inner, &canonical, depth).await
    }

    fn venue_symbol(&self, canonical: &str) -> String {
        let canonical = canonical.to_ascii_uppercase();
        for (canon, socket, _) in PAIRS {
            if *canon == canonical {
                return socket.to_string();
            }
        }
        // Best effort for unmapped pairs: split a known quote and rejoin
        // with the socket separator.
        for quote in ["USDT", "USDC", "USD", "EUR", "GBP"] {
            if let Some(base) = canonical.strip_suffix(quote) {
                if !base.is_empty() {
                    return format!("{base}/{quote}");
                }
            }
        }
        canonical
    }

    fn normalize_symbol(&self, raw: &str) -> String {
        normalize_symbol_impl(raw)
    }

    fn normalize_interval(&self, interval: &str) -> Result<String> {
        interval_minutes(interval).map(|m| m.to_string())
    }

    async fn health(&self) -> AdapterHealth {
        let last = self.inner.last_message_ns.load(Ordering::Relaxed);
        AdapterHealth {
            venue: VenueId::Kraken,
            ws_connected: self.inner.connection.is_connected().await,
            last_message_ns: (last > 0).then_some(last),
        }
    }
}

/// Canonicalize any of Kraken's pair spellings: `XBT/USD`, `XXBTZUSD`,
/// `XBTUSD` all become `BTCUSD`.
fn normalize_symbol_impl(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();
    for (canonical, socket, legacy) in PAIRS {
        if upper == *socket || upper == *legacy {
            return canonical.to_string();
        }
    }
    let stripped: String = upper.chars().filter(|c| *c != '/').collect();
    for (canonical, socket, _) in PAIRS {
        let socket_stripped: String = socket.chars().filter(|c| *c != '/').collect();
        if stripped == socket_stripped {
            return canonical.to_string();
        }
    }
    stripped.replace("XBT", "BTC").replace("XDG", "DOGE")
}

/// Pair spelling for REST query parameters (`XBTUSD` style).
fn rest_query_pair(canonical: &str) -> String {
    canonical
        .to_ascii_uppercase()
        .replace("BTC", "XBT")
        .replace("DOGE", "XDG")
}

fn rest_result(body: &Value) -> Result<&Value> {
    if let Some(errors) = body["error"].as_array() {
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .filter_map(|e| e.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GatewayError::Parse {
                venue: VenueId::Kraken,
                message: "rest error field".to_string(),
                error: joined,
            });
        }
    }
    Ok(&body["result"])
}

/// Trade rows are `[price, volume, time, side, orderType, misc]` on both
/// the socket and REST.
fn parse_trade_row(row: &Value, symbol: &str) -> Result<Trade> {
    let cols = row
        .as_array()
        .ok_or_else(|| parse_error("trade row", "not an array"))?;
    if cols.len() < 4 {
        return Err(parse_error("trade row", "short row"));
    }

    let time_s = value_f64(&cols[2], "trade time")?;
    let trade = Trade {
        symbol: symbol.to_string(),
        price: value_f64(&cols[0], "trade price")?,
        size: value_f64(&cols[1], "trade volume")?,
        side: match cols[3].as_str() {
            Some("b") => Side::Buy,
            Some("s") => Side::Sell,
            other => {
                return Err(parse_error(
                    "trade row",
                    &format!("unknown side {other:?}"),
                ))
            }
        },
        trade_id: format!("{}-{}", symbol, (time_s * 1e6) as u64),
        timestamp_ns: (time_s * 1e9) as u64,
    };
    trade.validate()?;
    Ok(trade)
}

fn parse_book_side(payload: &Value, keys: &[&str]) -> Result<Vec<BookLevel>> {
    for key in keys {
        if let Some(rows) = payload.get(*key).and_then(|v| v.as_array()) {
            return rows
                .iter()
                .map(|row| {
                    Ok(BookLevel {
                        price: value_f64(&row[0], "book price")?,
                        size: value_f64(&row[1], "book size")?,
                    })
                })
                .collect();
        }
    }
    Ok(Vec::new())
}

/// Synthesized sequence: the max microsecond timestamp in the update.
fn book_sequence(payload: &Value) -> u64 {
    ["bs", "as", "b", "a"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|row| row.get(2))
        .filter_map(|t| value_f64(t, "book time").ok())
        .fold(0u64, |acc, t| acc.max((t * 1e6) as u64))
}

fn interval_minutes(interval: &str) -> Result<u32> {
    INTERVALS
        .iter()
        .find(|(name, _)| *name == interval)
        .map(|(_, minutes)| *minutes)
        .ok_or_else(|| GatewayError::NotSupported(format!("kraken interval {interval}")))
}

/// Numbers arrive as strings (`"113879.3"`) or raw numbers depending on
/// the endpoint.
fn value_f64(value: &Value, what: &str) -> Result<f64> {
    if let Some(text) = value.as_str() {
        return Decimal::from_str(text)
            .ok()
            .and_then(|d| d.to_f64())
            .ok_or_else(|| parse_error(what, &format!("invalid decimal {text:?}")));
    }
    value
        .as_f64()
        .ok_or_else(|| parse_error(what, "not a number"))
}

fn parse_error(message: &str, error: &str) -> GatewayError {
    GatewayError::Parse {
        venue: VenueId::Kraken,
        message: message.to_string(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_spellings_normalize_to_canonical() {
        assert_eq!(normalize_symbol_impl("XBT/USD"), "BTCUSD");
        assert_eq!(normalize_symbol_impl("XXBTZUSD"), "BTCUSD");
        assert_eq!(normalize_symbol_impl("XBTUSD"), "BTCUSD");
        assert_eq!(normalize_symbol_impl("ETH/USD"), "ETHUSD");
        assert_eq!(normalize_symbol_impl("XETHZUSD"), "ETHUSD");
        assert_eq!(normalize_symbol_impl("XDG/USD"), "DOGEUSD");
        assert_eq!(normalize_symbol_impl("SOL/USD"), "SOLUSD");
    }

    #[test]
    fn canonical_maps_back_to_socket_pairs() {
        let adapter = test_adapter();
        assert_eq!(adapter.venue_symbol("BTCUSD"), "XBT/USD");
        assert_eq!(adapter.venue_symbol("btcusd"), "XBT/USD");
        assert_eq!(adapter.venue_symbol("DOGEUSD"), "XDG/USD");
        assert_eq!(adapter.venue_symbol("AVAXUSD"), "AVAX/USD");
        assert_eq!(rest_query_pair("BTCUSD"), "XBTUSD");
    }

    #[test]
    fn intervals_translate_to_minutes() {
        assert_eq!(interval_minutes("1m").unwrap(), 1);
        assert_eq!(interval_minutes("4h").unwrap(), 240);
        assert_eq!(interval_minutes("1d").unwrap(), 1440);
        assert!(interval_minutes("2m").is_err());
    }

    #[test]
    fn trade_rows_parse_both_sides() {
        let row = serde_json::json!(["113879.30000", "0.01317184", "1755750124.577095", "s", "m", ""]);
        let trade = parse_trade_row(&row, "BTCUSD").unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert!((trade.price - 113_879.3).abs() < 1e-6);
        // Microsecond precision survives the float conversion.
        assert!(trade.timestamp_ns > 1_755_750_124_577_000_000);
        assert!(trade.timestamp_ns < 1_755_750_124_578_000_000);

        let row = serde_json::json!(["100.0", "1.0", "1755750124.0", "b", "l", ""]);
        assert_eq!(parse_trade_row(&row, "ETHUSD").unwrap().side, Side::Buy);

        let row = serde_json::json!(["100.0", "1.0", "1755750124.0", "x", "l", ""]);
        assert!(parse_trade_row(&row, "ETHUSD").is_err());
    }

    #[test]
    fn book_payloads_parse_snapshots_and_deltas() {
        let snapshot = serde_json::json!({
            "bs": [["4287.73000", "0.10000000", "1755750122.927411"]],
            "as": [["4287.74000", "0.05000000", "1755750122.927411"]]
        });
        let bids = parse_book_side(&snapshot, &["bs", "b"]).unwrap();
        assert_eq!(bids.len(), 1);
        assert!((bids[0].price - 4287.73).abs() < 1e-9);
        assert!(book_sequence(&snapshot) > 0);

        let delta = serde_json::json!({
            "b": [["4287.75000", "0.20000000", "1755750123.000001"]]
        });
        let bids = parse_book_side(&delta, &["bs", "b"]).unwrap();
        assert_eq!(bids.len(), 1);
        assert!(book_sequence(&delta) > book_sequence(&snapshot));
    }

    #[test]
    fn rest_errors_surface() {
        let body = serde_json::json!({"error": ["EQuery:Unknown asset pair"]});
        assert!(rest_result(&body).is_err());

        let body = serde_json::json!({"error": [], "result": {"XXBTZUSD": []}});
        assert!(rest_result(&body).is_ok());
    }

    fn test_adapter() -> KrakenAdapter {
        KrakenAdapter::new(
            KrakenConfig::default(),
            Arc::new(CircuitBreaker::new(
                VenueId::Kraken,
                crate::circuit_breaker::Channel::Ws,
                config::CircuitConfig::default(),
            )),
        )
    }
}
