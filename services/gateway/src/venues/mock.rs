//! Scriptable in-memory adapter for tests
//!
//! Behaves like a real venue adapter without a network: tests push stream
//! events through it and script its REST responses, including the rate
//! headers the facade feeds into the limiter. Book pushes run through the
//! same sequence tracking and resync semantics as the real adapters.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use types::{BookL2, Kline, Trade, VenueId};

use crate::error::{GatewayError, Result};
use crate::venues::{
    AdapterHealth, BookCallback, BookSequenceTracker, KlineCallback, RestResponse, SeqCheck,
    TradeCallback, VenueAdapter,
};

/// Scriptable venue adapter.
pub struct MockAdapter {
    venue: VenueId,
    connected: AtomicBool,
    trades: DashMap<String, TradeCallback>,
    books: DashMap<String, BookCallback>,
    klines: DashMap<String, KlineCallback>,
    seq: BookSequenceTracker,

    /// Scripted REST payloads
    rest_klines: Mutex<Vec<Kline>>,
    rest_trades: Mutex<Vec<Trade>>,
    rest_book: Mutex<Option<BookL2>>,
    /// Headers attached to every REST response
    rest_headers: Mutex<HashMap<String, String>>,
    /// When set, every REST call fails with a timeout
    fail_rest: AtomicBool,
    /// When set, connect_ws fails
    fail_connect: AtomicBool,
    /// REST calls observed
    pub rest_calls: AtomicU64,
    /// Resyncs performed
    pub resyncs: AtomicU64,
}

impl MockAdapter {
    /// New mock for a venue; contiguous book sequences.
    pub fn new(venue: VenueId) -> Arc<Self> {
        Arc::new(Self {
            venue,
            connected: AtomicBool::new(false),
            trades: DashMap::new(),
            books: DashMap::new(),
            klines: DashMap::new(),
            seq: BookSequenceTracker::new(true),
            rest_klines: Mutex::new(Vec::new()),
            rest_trades: Mutex::new(Vec::new()),
            rest_book: Mutex::new(None),
            rest_headers: Mutex::new(HashMap::new()),
            fail_rest: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            rest_calls: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        })
    }

    /// Script the klines REST response.
    pub fn script_klines(&self, klines: Vec<Kline>) {
        *self.rest_klines.lock() = klines;
    }

    /// Script the trades REST response.
    pub fn script_trades(&self, trades: Vec<Trade>) {
        *self.rest_trades.lock() = trades;
    }

    /// Script the book REST response (also used for resync snapshots).
    pub fn script_book(&self, book: BookL2) {
        *self.rest_book.lock() = Some(book);
    }

    /// Attach rate headers to every subsequent REST response.
    pub fn script_rate_headers(&self, headers: HashMap<String, String>) {
        *self.rest_headers.lock() = headers;
    }

    /// Make every REST call fail with a timeout until cleared.
    pub fn set_rest_failing(&self, failing: bool) {
        self.fail_rest.store(failing, Ordering::SeqCst);
    }

    /// Make connect_ws fail until cleared.
    pub fn set_connect_failing(&self, failing: bool) {
        self.fail_connect.store(failing, Ordering::SeqCst);
    }

    /// Deliver a trade to the subscribed callback.
    pub fn push_trade(&self, trade: Trade) {
        if let Some(callback) = self.trades.get(&trade.symbol).map(|e| e.value().clone()) {
            callback(trade);
        }
    }

    /// Deliver a kline to the subscribed callback.
    pub fn push_kline(&self, kline: Kline) {
        let key = format!("{}@{}", kline.symbol, kline.interval);
        if let Some(callback) = self.klines.get(&key).map(|e| e.value().clone()) {
            callback(kline);
        }
    }

    /// Deliver a book delta. A sequence gap triggers the real resync
    /// semantics: the scripted snapshot is delivered with `resync = true`
    /// and the gapped delta is dropped.
    pub fn push_book(&self, book: BookL2) {
        let Some(callback) = self.books.get(&book.symbol).map(|e| e.value().clone()) else {
            return;
        };
        match self.seq.observe(&book.symbol, book.sequence) {
            SeqCheck::Ok | SeqCheck::First => callback(book),
            SeqCheck::Gap { last, got } => {
                tracing::debug!(symbol = %book.symbol, last, got, "mock gap, resyncing");
                self.resyncs.fetch_add(1, Ordering::SeqCst);
                let snapshot = self.rest_book.lock().clone();
                let mut snapshot = snapshot.unwrap_or(BookL2 {
                    resync: false,
                    ..book
                });
                snapshot.resync = true;
                snapshot.sequence = snapshot.sequence.max(got);
                self.seq.reset(&snapshot.symbol, snapshot.sequence);
                callback(snapshot);
            }
        }
    }

    fn rest_response<T>(&self, data: T) -> Result<RestResponse<T>> {
        self.rest_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_rest.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout {
                venue: self.venue,
                timeout_ms: 1,
            });
        }
        Ok(RestResponse {
            data,
            rate_headers: self.rest_headers.lock().clone(),
        })
    }
}

#[async_trait]
impl VenueAdapter for MockAdapter {
    fn venue(&self) -> VenueId {
        self.venue
    }

    async fn connect_ws(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionFailed {
                venue: self.venue,
                reason: "scripted connect failure".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe_trades(&self, symbol: &str, callback: TradeCallback) -> Result<()> {
        self.trades.insert(symbol.to_ascii_uppercase(), callback);
        Ok(())
    }

    async fn subscribe_book_l2(&self, symbol: &str, callback: BookCallback) -> Result<()> {
        self.books.insert(symbol.to_ascii_uppercase(), callback);
        Ok(())
    }

    async fn subscribe_klines(
        &self,
        symbol: &str,
        interval: &str,
        callback: KlineCallback,
    ) -> Result<()> {
        self.klines
            .insert(format!("{}@{}", symbol.to_ascii_uppercase(), interval), callback);
        Ok(())
    }

    async fn get_klines(
        &self,
        _symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<RestResponse<Vec<Kline>>> {
        let klines: Vec<Kline> = self.rest_klines.lock().iter().take(limit).cloned().collect();
        self.rest_response(klines)
    }

    async fn get_trades(&self, _symbol: &str, limit: usize) -> Result<RestResponse<Vec<Trade>>> {
        let trades: Vec<Trade> = self.rest_trades.lock().iter().take(limit).cloned().collect();
        self.rest_response(trades)
    }

    async fn get_book_l2(&self, _symbol: &str, _depth: usize) -> Result<RestResponse<BookL2>> {
        let book = self.rest_book.lock().clone().ok_or_else(|| {
            GatewayError::NotFound {
                venue: self.venue,
                what: "scripted book".to_string(),
            }
        })?;
        self.rest_response(book)
    }

    fn venue_symbol(&self, canonical: &str) -> String {
        canonical.to_ascii_uppercase()
    }

    fn normalize_symbol(&self, raw: &str) -> String {
        raw.to_ascii_uppercase()
    }

    fn normalize_interval(&self, interval: &str) -> Result<String> {
        Ok(interval.to_string())
    }

    async fn health(&self) -> AdapterHealth {
        AdapterHealth {
            venue: self.venue,
            ws_connected: self.connected.load(Ordering::SeqCst),
            last_message_ns: None,
        }
    }
}
