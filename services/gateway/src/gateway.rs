//! The market-data gateway: one facade over every venue
//!
//! Composes adapters, the protection mesh (rate limiter + breaker pairs),
//! the TTL cache, the PIT store, and the optional bus and repository.
//!
//! Push path: adapter stream -> wrapped callback (attribution, PIT mirror,
//! bus envelope) -> consumer callback. Mirroring runs on a single worker
//! task fed by a bounded channel, which preserves per (venue, symbol, kind)
//! publish order without blocking the stream reader.
//!
//! Pull path: cache -> (miss) limiter -> HTTP breaker -> adapter REST ->
//! cache store + PIT snapshot + health accounting. Non-microstructure pulls
//! may fall back to configured venues when the primary's breaker rejects;
//! book snapshots never fall back.
//!
//! Cancellation is cooperative: dropping a facade future abandons the call
//! promptly, and every background task watches the shutdown channel.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use config::{GatewayConfig, ParseMode};
use message_bus::{build_bus, EventBus, TopicConfig};
use types::{
    BookL2, DataKind, Envelope, Kline, SourceTier, Trade, VenueId,
};

use crate::attribution::SourceAttribution;
use crate::cache::{CachedValue, CacheStats, TtlCache};
use crate::circuit_breaker::{Channel, CircuitSnapshot, VenueBreakers};
use crate::error::{GatewayError, Result};
use crate::health::{HealthState, VenueHealth};
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::pit::PitStore;
use crate::rate_limit::{LimiterSnapshot, RateLimiter, RejectReason};
use crate::repository::Repository;
use crate::venues::{
    binance::{BinanceAdapter, BinanceConfig},
    coinbase::{CoinbaseAdapter, CoinbaseConfig},
    kraken::{KrakenAdapter, KrakenConfig},
    BookCallback, KlineCallback, TradeCallback, VenueAdapter,
};

const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER_SECS: i64 = 10;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const PIT_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// One job for the mirror worker: a record that must reach the PIT store
/// and, when configured, the bus.
struct MirrorJob {
    venue: VenueId,
    kind: DataKind,
    symbol: String,
    payload: Vec<u8>,
}

/// The unified market-data facade.
pub struct MarketGateway {
    config: GatewayConfig,
    adapters: DashMap<VenueId, Arc<dyn VenueAdapter>>,
    limiter: Arc<RateLimiter>,
    breakers: DashMap<VenueId, Arc<VenueBreakers>>,
    cache: Arc<TtlCache>,
    pit: Arc<PitStore>,
    bus: Option<Arc<dyn EventBus>>,
    attribution: Arc<DashMap<VenueId, SourceAttribution>>,
    health: Arc<DashMap<VenueId, VenueHealth>>,
    metrics: Arc<GatewayMetrics>,
    mirror_tx: mpsc::Sender<MirrorJob>,
    mirror_rx: parking_lot::Mutex<Option<mpsc::Receiver<MirrorJob>>>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl MarketGateway {
    /// Build the gateway from a validated config. Any config problem is
    /// fatal here, before anything connects.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let repository = match &config.repository {
            Some(repo) => Some(Arc::new(Repository::open(&repo.path)?)),
            None => None,
        };
        let pit = Arc::new(PitStore::new(&config.pit, repository)?);
        let cache = Arc::new(TtlCache::new(config.cache.clone()));
        let limiter = Arc::new(RateLimiter::new());
        let bus = match &config.bus {
            Some(bus_config) => Some(build_bus(bus_config)?),
            None => None,
        };

        let (shutdown, _) = watch::channel(false);
        let (mirror_tx, mirror_rx) = mpsc::channel(config.hot.buffer_size.max(16));

        let gateway = Self {
            adapters: DashMap::new(),
            limiter,
            breakers: DashMap::new(),
            cache,
            pit,
            bus,
            attribution: Arc::new(DashMap::new()),
            health: Arc::new(DashMap::new()),
            metrics: Arc::new(GatewayMetrics::default()),
            mirror_tx,
            mirror_rx: parking_lot::Mutex::new(Some(mirror_rx)),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
            config,
        };

        let mut venues: Vec<VenueId> = gateway.config.hot_venues();
        for venue in gateway.config.warm_venues() {
            if !venues.contains(&venue) {
                venues.push(venue);
            }
        }
        for venue in venues {
            gateway.register_venue(venue)?;
            let adapter = gateway.build_adapter(venue)?;
            gateway.adapters.insert(venue, adapter);
        }
        Ok(gateway)
    }

    /// Load a config file and build the gateway.
    pub fn from_config_file(path: &str, mode: ParseMode) -> Result<Self> {
        let config = GatewayConfig::load(path, mode)?;
        Self::new(config)
    }

    /// Register the protection-mesh state for a venue.
    fn register_venue(&self, venue: VenueId) -> Result<()> {
        self.limiter
            .register(venue, self.config.rate_limit_for(venue));
        self.breakers.insert(
            venue,
            Arc::new(VenueBreakers::new(venue, &self.config.circuits_for(venue))),
        );
        self.attribution.insert(venue, SourceAttribution::new(venue));
        self.health.insert(venue, VenueHealth::unknown(venue));
        Ok(())
    }

    fn build_adapter(&self, venue: VenueId) -> Result<Arc<dyn VenueAdapter>> {
        let breakers = self
            .breakers
            .get(&venue)
            .ok_or_else(|| GatewayError::UnknownVenue(venue.to_string()))?;
        let ws_breaker = Arc::clone(&breakers.ws);

        let adapter: Arc<dyn VenueAdapter> = match venue {
            VenueId::Binance => {
                Arc::new(BinanceAdapter::new(BinanceConfig::default(), ws_breaker))
            }
            VenueId::Kraken => Arc::new(KrakenAdapter::new(KrakenConfig::default(), ws_breaker)),
            VenueId::Coinbase => {
                Arc::new(CoinbaseAdapter::new(CoinbaseConfig::default(), ws_breaker))
            }
            other => {
                return Err(GatewayError::UnknownVenue(format!(
                    "no adapter for venue {other}"
                )))
            }
        };
        Ok(adapter)
    }

    /// Replace (or add) a venue's adapter. Used by tests to install
    /// scripted adapters and by embedders bringing their own venue.
    pub fn install_adapter(&self, venue: VenueId, adapter: Arc<dyn VenueAdapter>) {
        if !self.breakers.contains_key(&venue) {
            let _ = self.register_venue(venue);
        }
        self.adapters.insert(venue, adapter);
    }

    /// Bring the gateway up: start the bus, connect every hot venue in
    /// parallel, and launch the background tasks. Individual venue
    /// failures leave the venue offline and the gateway degraded, never
    /// aborted.
    pub async fn start(&self) -> Result<()> {
        if let Some(bus) = &self.bus {
            bus.start().await?;
            let partitions = self
                .config
                .bus
                .as_ref()
                .map(|b| b.subscription_workers.max(1))
                .unwrap_or(1);
            for kind in [DataKind::Trade, DataKind::BookL2, DataKind::Kline] {
                bus.create_topic(TopicConfig::new(kind.as_str(), partitions))
                    .await?;
            }
        }

        let hot = self.config.hot_venues();
        let connects = hot.iter().map(|venue| {
            let venue = *venue;
            let adapter = self.adapters.get(&venue).map(|e| Arc::clone(e.value()));
            async move {
                match adapter {
                    Some(adapter) => (venue, adapter.connect_ws().await),
                    None => (
                        venue,
                        Err(GatewayError::UnknownVenue(venue.to_string())),
                    ),
                }
            }
        });
        for (venue, outcome) in join_all(connects).await {
            let mut health = self
                .health
                .entry(venue)
                .or_insert_with(|| VenueHealth::unknown(venue));
            match outcome {
                Ok(()) => {
                    health.set_ws_connected(true);
                    tracing::info!(venue = %venue, "hot venue connected");
                }
                Err(e) => {
                    health.set_ws_connected(false);
                    health.set_rest_healthy(true);
                    health.status = HealthState::Offline;
                    health.recommendation = "stream unavailable; warm tier only".to_string();
                    tracing::warn!(venue = %venue, error = %e, "hot venue offline, degraded start");
                }
            }
        }

        self.spawn_background_tasks();
        tracing::info!("market gateway started");
        Ok(())
    }

    fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks.lock();

        // Mirror worker: single consumer keeps PIT/bus order stable.
        if let Some(mut rx) = self.mirror_rx.lock().take() {
            let pit = Arc::clone(&self.pit);
            let bus = self.bus.clone();
            let metrics = Arc::clone(&self.metrics);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = shutdown.changed() => break,
                        job = rx.recv() => match job {
                            Some(job) => job,
                            None => break,
                        },
                    };
                    mirror_one(&pit, bus.as_deref(), &metrics, job).await;
                }
            }));
        }

        // Health monitor: stream freshness and staleness marking.
        {
            let adapters: Vec<(VenueId, Arc<dyn VenueAdapter>)> = self
                .adapters
                .iter()
                .map(|e| (*e.key(), Arc::clone(e.value())))
                .collect();
            let health = Arc::clone(&self.health);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEALTH_MONITOR_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    for (venue, adapter) in &adapters {
                        let adapter_health = adapter.health().await;
                        if let Some(mut entry) = health.get_mut(venue) {
                            entry.ws_connected = adapter_health.ws_connected;
                            entry.check_staleness(chrono::Duration::seconds(STALE_AFTER_SECS));
                        }
                    }
                }
            }));
        }

        // Cache sweeper.
        tasks.push(
            self.cache
                .start_sweeper(SWEEP_INTERVAL, self.shutdown.subscribe()),
        );

        // PIT retention purge.
        {
            let pit = Arc::clone(&self.pit);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PIT_PURGE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = pit.purge_expired().await {
                        tracing::warn!(error = %e, "pit retention purge failed");
                    }
                }
            }));
        }
    }

    /// Best-effort graceful shutdown: adapters close in parallel, the bus
    /// stops, background tasks exit on the shutdown signal.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let closes: Vec<_> = self
            .adapters
            .iter()
            .map(|entry| {
                let adapter = Arc::clone(entry.value());
                async move {
                    let venue = adapter.venue();
                    if let Err(e) = adapter.close().await {
                        tracing::warn!(venue = %venue, error = %e, "adapter close failed");
                    }
                }
            })
            .collect();
        join_all(closes).await;

        if let Some(bus) = &self.bus {
            if let Err(e) = bus.stop().await {
                tracing::warn!(error = %e, "bus stop failed");
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        tracing::info!("market gateway stopped");
    }

    // ------------------------------------------------------------------
    // HOT tier
    // ------------------------------------------------------------------

    /// Stream trades, mirrored to PIT and bus before the consumer sees
    /// them. Wrapper failures log and never cancel the subscription.
    pub async fn subscribe_trades(
        &self,
        venue: VenueId,
        symbol: &str,
        callback: TradeCallback,
    ) -> Result<()> {
        let adapter = self.adapter(venue)?;
        self.admit_subscription(venue).await?;

        let symbol = adapter.normalize_symbol(symbol);
        let wrapped = self.wrap_trade_callback(venue, callback);
        adapter.subscribe_trades(&symbol, wrapped).await?;
        self.limiter.record_request(venue, "subscribe").ok();
        Ok(())
    }

    /// Stream level-2 books. Resynced snapshots arrive flagged, never
    /// silently.
    pub async fn subscribe_book_l2(
        &self,
        venue: VenueId,
        symbol: &str,
        callback: BookCallback,
    ) -> Result<()> {
        let adapter = self.adapter(venue)?;
        self.admit_subscription(venue).await?;

        let symbol = adapter.normalize_symbol(symbol);
        let wrapped = self.wrap_book_callback(venue, callback);
        adapter.subscribe_book_l2(&symbol, wrapped).await?;
        self.limiter.record_request(venue, "subscribe").ok();
        Ok(())
    }

    /// Stream candles.
    pub async fn subscribe_klines(
        &self,
        venue: VenueId,
        symbol: &str,
        interval: &str,
        callback: KlineCallback,
    ) -> Result<()> {
        let adapter = self.adapter(venue)?;
        self.admit_subscription(venue).await?;

        let symbol = adapter.normalize_symbol(symbol);
        let wrapped = self.wrap_kline_callback(venue, callback);
        adapter.subscribe_klines(&symbol, interval, wrapped).await?;
        self.limiter.record_request(venue, "subscribe").ok();
        Ok(())
    }

    fn wrap_trade_callback(&self, venue: VenueId, callback: TradeCallback) -> TradeCallback {
        let attribution = Arc::clone(&self.attribution);
        let health = Arc::clone(&self.health);
        let metrics = Arc::clone(&self.metrics);
        let mirror = self.mirror_tx.clone();

        Arc::new(move |trade: Trade| {
            GatewayMetrics::bump(&metrics.stream_messages);
            if let Some(mut entry) = attribution.get_mut(&venue) {
                entry.record(DataKind::Trade, None, None);
            }
            if let Some(mut entry) = health.get_mut(&venue) {
                entry.touch();
            }
            match serde_json::to_vec(&trade) {
                Ok(payload) => enqueue_mirror(
                    &mirror,
                    MirrorJob {
                        venue,
                        kind: DataKind::Trade,
                        symbol: trade.symbol.clone(),
                        payload,
                    },
                ),
                Err(e) => tracing::warn!(error = %e, "trade mirror encode failed"),
            }
            callback(trade);
        })
    }

    fn wrap_book_callback(&self, venue: VenueId, callback: BookCallback) -> BookCallback {
        let attribution = Arc::clone(&self.attribution);
        let health = Arc::clone(&self.health);
        let metrics = Arc::clone(&self.metrics);
        let mirror = self.mirror_tx.clone();

        Arc::new(move |book: BookL2| {
            GatewayMetrics::bump(&metrics.stream_messages);
            if book.resync {
                GatewayMetrics::bump(&metrics.resyncs);
            }
            if let Some(mut entry) = attribution.get_mut(&venue) {
                entry.record(DataKind::BookL2, None, None);
            }
            if let Some(mut entry) = health.get_mut(&venue) {
                entry.touch();
            }
            match serde_json::to_vec(&book) {
                Ok(payload) => enqueue_mirror(
                    &mirror,
                    MirrorJob {
                        venue,
                        kind: DataKind::BookL2,
                        symbol: book.symbol.clone(),
                        payload,
                    },
                ),
                Err(e) => tracing::warn!(error = %e, "book mirror encode failed"),
            }
            callback(book);
        })
    }

    fn wrap_kline_callback(&self, venue: VenueId, callback: KlineCallback) -> KlineCallback {
        let attribution = Arc::clone(&self.attribution);
        let health = Arc::clone(&self.health);
        let metrics = Arc::clone(&self.metrics);
        let mirror = self.mirror_tx.clone();

        Arc::new(move |kline: Kline| {
            GatewayMetrics::bump(&metrics.stream_messages);
            if let Some(mut entry) = attribution.get_mut(&venue) {
                entry.record(DataKind::Kline, None, None);
            }
            if let Some(mut entry) = health.get_mut(&venue) {
                entry.touch();
            }
            match serde_json::to_vec(&kline) {
                Ok(payload) => enqueue_mirror(
                    &mirror,
                    MirrorJob {
                        venue,
                        kind: DataKind::Kline,
                        symbol: kline.symbol.clone(),
                        payload,
                    },
                ),
                Err(e) => tracing::warn!(error = %e, "kline mirror encode failed"),
            }
            callback(kline);
        })
    }

    async fn admit_subscription(&self, venue: VenueId) -> Result<()> {
        let budget = self.wait_budget();
        self.limiter
            .acquire(venue, "subscribe", budget)
            .await
            .map_err(|reason| self.admission_error(venue, reason))
    }

    // ------------------------------------------------------------------
    // WARM tier
    // ------------------------------------------------------------------

    /// Cached candles: `klines:{venue}:{symbol}:{interval}:{limit}`.
    pub async fn get_klines(
        &self,
        venue: VenueId,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let adapter = self.adapter(venue)?;
        let symbol = adapter.normalize_symbol(symbol);
        let key = format!("klines:{venue}:{symbol}:{interval}:{limit}");

        let fetched = self
            .cached_pull(venue, DataKind::Kline, &key, "klines", move |adapter| {
                let symbol = symbol.clone();
                let interval = interval.to_string();
                async move {
                    let response = adapter.get_klines(&symbol, &interval, limit).await?;
                    Ok((CachedValue::Klines(response.data), response.rate_headers))
                }
            })
            .await?;

        match fetched {
            CachedValue::Klines(klines) => Ok(klines),
            _ => Err(GatewayError::Internal("cache kind mismatch".to_string())),
        }
    }

    /// Cached trades: `trades:{venue}:{symbol}:{limit}`.
    pub async fn get_trades(
        &self,
        venue: VenueId,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        let adapter = self.adapter(venue)?;
        let symbol = adapter.normalize_symbol(symbol);
        let key = format!("trades:{venue}:{symbol}:{limit}");

        let fetched = self
            .cached_pull(venue, DataKind::Trade, &key, "trades", move |adapter| {
                let symbol = symbol.clone();
                async move {
                    let response = adapter.get_trades(&symbol, limit).await?;
                    Ok((CachedValue::Trades(response.data), response.rate_headers))
                }
            })
            .await?;

        match fetched {
            CachedValue::Trades(trades) => Ok(trades),
            _ => Err(GatewayError::Internal("cache kind mismatch".to_string())),
        }
    }

    /// Cached book snapshot: `book_l2:{venue}:{symbol}:{depth}`.
    /// Microstructure never falls back to another venue.
    pub async fn get_book_l2(
        &self,
        venue: VenueId,
        symbol: &str,
        depth: usize,
    ) -> Result<BookL2> {
        let adapter = self.adapter(venue)?;
        let symbol = adapter.normalize_symbol(symbol);
        let key = format!("book_l2:{venue}:{symbol}:{depth}");

        let fetched = self
            .cached_pull(venue, DataKind::BookL2, &key, "orderbook", move |adapter| {
                let symbol = symbol.clone();
                async move {
                    let response = adapter.get_book_l2(&symbol, depth).await?;
                    Ok((CachedValue::Book(response.data), response.rate_headers))
                }
            })
            .await?;

        match fetched {
            CachedValue::Book(book) => Ok(book),
            _ => Err(GatewayError::Internal("cache kind mismatch".to_string())),
        }
    }

    /// The shared pull pipeline: cache -> limiter -> breaker -> adapter,
    /// then cache store, PIT snapshot, and health accounting. Fallback
    /// venues apply to everything except order books.
    async fn cached_pull<F, Fut>(
        &self,
        venue: VenueId,
        kind: DataKind,
        key: &str,
        endpoint: &str,
        fetch: F,
    ) -> Result<CachedValue>
    where
        F: Fn(Arc<dyn VenueAdapter>) -> Fut + Clone,
        Fut: std::future::Future<Output = Result<(CachedValue, HashMap<String, String>)>>,
    {
        GatewayMetrics::bump(&self.metrics.pull_requests);

        let (value, hit) = {
            let this = &*self;
            let fetch = fetch.clone();
            let key_owned = key.to_string();
            self.cache
                .get_or_fetch(key, move || async move {
                    match this.upstream_pull(venue, kind, endpoint, &fetch).await {
                        Ok(value) => Ok(value),
                        Err(primary_err) if kind != DataKind::BookL2 => {
                            this.try_fallbacks(venue, kind, endpoint, &key_owned, &fetch, primary_err)
                                .await
                        }
                        Err(e) => Err(e),
                    }
                })
                .await?
        };

        if let Some(mut entry) = self.attribution.get_mut(&venue) {
            entry.record(kind, Some(hit), None);
        }
        Ok(value)
    }

    /// One venue's upstream pull: limiter, breaker, adapter, bookkeeping.
    async fn upstream_pull<F, Fut>(
        &self,
        venue: VenueId,
        kind: DataKind,
        endpoint: &str,
        fetch: &F,
    ) -> Result<CachedValue>
    where
        F: Fn(Arc<dyn VenueAdapter>) -> Fut,
        Fut: std::future::Future<Output = Result<(CachedValue, HashMap<String, String>)>>,
    {
        let adapter = self.adapter(venue)?;
        let breakers = self
            .breakers
            .get(&venue)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| GatewayError::UnknownVenue(venue.to_string()))?;

        self.limiter
            .acquire(venue, endpoint, self.wait_budget())
            .await
            .map_err(|reason| self.admission_error(venue, reason))?;

        let started = Instant::now();
        let outcome = breakers.http.call(fetch(adapter)).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;

        match outcome {
            Ok((value, rate_headers)) => {
                // The admission above guarantees the venue is registered.
                self.limiter.record_request(venue, endpoint).ok();
                if !rate_headers.is_empty() {
                    if let Err(e) = self.limiter.ingest_headers(venue, &rate_headers) {
                        tracing::warn!(venue = %venue, error = %e, "header ingestion failed");
                    }
                }
                if let Some(mut entry) = self.health.get_mut(&venue) {
                    entry.record_outcome(true, Some(elapsed_ms));
                }
                self.snapshot_pull(venue, kind, &value).await;
                Ok(value)
            }
            Err(e) => {
                GatewayMetrics::bump(&self.metrics.errors);
                if e.counts_against_breaker() {
                    if let Some(mut entry) = self.health.get_mut(&venue) {
                        entry.record_outcome(false, None);
                        entry.set_rest_healthy(false);
                    }
                }
                Err(e)
            }
        }
    }

    /// Walk the venue's fallback chain for non-microstructure pulls. The
    /// winning value's PIT snapshot is an envelope carrying the chain in
    /// its provenance headers.
    async fn try_fallbacks<F, Fut>(
        &self,
        primary: VenueId,
        kind: DataKind,
        endpoint: &str,
        key: &str,
        fetch: &F,
        primary_err: GatewayError,
    ) -> Result<CachedValue>
    where
        F: Fn(Arc<dyn VenueAdapter>) -> Fut,
        Fut: std::future::Future<Output = Result<(CachedValue, HashMap<String, String>)>>,
    {
        let circuit = self.config.circuits_for(primary).http;
        if !circuit.fallback_enabled || circuit.fallback_venues.is_empty() {
            return Err(primary_err);
        }

        let mut chain = vec![primary.to_string()];
        for name in &circuit.fallback_venues {
            let Ok(venue) = name.parse::<VenueId>() else {
                continue;
            };
            if venue == primary || !self.adapters.contains_key(&venue) {
                continue;
            }

            match self.upstream_pull(venue, kind, endpoint, fetch).await {
                Ok(value) => {
                    chain.push(venue.to_string());
                    tracing::info!(
                        primary = %primary,
                        served_by = %venue,
                        key = %key,
                        "fallback venue answered"
                    );
                    // Cache keys are `{kind}:{venue}:{symbol}...`.
                    let symbol = key.split(':').nth(2).unwrap_or(kind.as_str());
                    self.snapshot_fallback(primary, venue, kind, symbol, &value, &chain)
                        .await;
                    return Ok(value);
                }
                Err(e) => {
                    chain.push(venue.to_string());
                    tracing::warn!(fallback = %venue, error = %e, "fallback venue failed");
                }
            }
        }
        Err(primary_err)
    }

    /// PIT mirror for a successful pull: plain record payload.
    async fn snapshot_pull(&self, venue: VenueId, kind: DataKind, value: &CachedValue) {
        let Ok(payload) = encode_cached(value) else {
            return;
        };
        if let Err(e) = self
            .pit
            .snapshot(kind.as_str(), Utc::now(), &payload, venue.as_str())
            .await
        {
            tracing::warn!(venue = %venue, error = %e, "pull snapshot failed");
        } else {
            GatewayMetrics::bump(&self.metrics.pit_snapshots);
        }
    }

    /// PIT mirror for a fallback-served pull: an envelope whose headers
    /// carry the chain and reduced confidence.
    async fn snapshot_fallback(
        &self,
        primary: VenueId,
        served_by: VenueId,
        kind: DataKind,
        symbol: &str,
        value: &CachedValue,
        chain: &[String],
    ) {
        let Ok(payload) = encode_cached(value) else {
            return;
        };
        let chain_refs: Vec<&str> = chain.iter().map(String::as_str).collect();
        let envelope = Envelope::build(symbol, served_by.as_str(), payload, None)
            .with_identity(served_by, kind, SourceTier::Warm)
            .with_provenance(primary.as_str(), SourceTier::Warm, 0.8, false)
            .with_fallback_chain(&chain_refs);

        let Ok(body) = envelope.to_json() else {
            return;
        };
        if let Err(e) = self
            .pit
            .snapshot(kind.as_str(), Utc::now(), body.as_bytes(), served_by.as_str())
            .await
        {
            tracing::warn!(error = %e, "fallback snapshot failed");
        } else {
            GatewayMetrics::bump(&self.metrics.pit_snapshots);
        }
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Attribution snapshot for a venue.
    pub fn source_attribution(&self, venue: VenueId) -> Option<SourceAttribution> {
        self.attribution.get(&venue).map(|e| e.value().clone())
    }

    /// Health snapshot for a venue.
    pub fn venue_health(&self, venue: VenueId) -> Option<VenueHealth> {
        self.health.get(&venue).map(|e| e.value().clone())
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Limiter snapshot for a venue.
    pub fn rate_limits(&self, venue: VenueId) -> Result<LimiterSnapshot> {
        self.limiter
            .get_limits(venue)
            .map_err(|reason| self.admission_error(venue, reason))
    }

    /// Breaker snapshot for a venue channel.
    pub fn circuit_state(&self, venue: VenueId, channel: Channel) -> Option<CircuitSnapshot> {
        self.breakers
            .get(&venue)
            .map(|pair| pair.channel(channel).snapshot())
    }

    /// Operator override: hold a venue channel open.
    pub fn force_circuit_open(&self, venue: VenueId, channel: Channel) {
        if let Some(pair) = self.breakers.get(&venue) {
            pair.channel(channel).force_open();
        }
    }

    /// Operator override: close a venue channel.
    pub fn force_circuit_close(&self, venue: VenueId, channel: Channel) {
        if let Some(pair) = self.breakers.get(&venue) {
            pair.channel(channel).force_close();
        }
    }

    /// Gateway counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The attached event bus, for downstream consumers that subscribe to
    /// the mirrored envelope topics.
    pub fn event_bus(&self) -> Option<Arc<dyn EventBus>> {
        self.bus.clone()
    }

    /// The PIT store, for replay and backtest readers.
    pub fn pit_store(&self) -> Arc<PitStore> {
        Arc::clone(&self.pit)
    }

    /// Venues eligible for fan-out right now: registered, not offline,
    /// both breaker channels closed.
    pub fn healthy_venues(&self) -> Vec<VenueId> {
        self.adapters
            .iter()
            .map(|e| *e.key())
            .filter(|venue| {
                let breaker_ok = self
                    .breakers
                    .get(venue)
                    .map(|pair| pair.healthy())
                    .unwrap_or(false);
                let health_ok = self
                    .health
                    .get(venue)
                    .map(|h| h.status != HealthState::Offline)
                    .unwrap_or(false);
                breaker_ok && health_ok
            })
            .collect()
    }

    // ------------------------------------------------------------------

    fn adapter(&self, venue: VenueId) -> Result<Arc<dyn VenueAdapter>> {
        self.adapters
            .get(&venue)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| GatewayError::UnknownVenue(venue.to_string()))
    }

    fn wait_budget(&self) -> Duration {
        self.config.warm.backoff_base() * (self.config.warm.max_retries + 1)
    }

    fn admission_error(&self, venue: VenueId, reason: RejectReason) -> GatewayError {
        GatewayMetrics::bump(&self.metrics.errors);
        if matches!(reason, RejectReason::UnknownVenue) {
            GatewayError::UnknownVenue(venue.to_string())
        } else {
            GatewayError::RateLimited { venue, reason }
        }
    }
}

fn enqueue_mirror(mirror: &mpsc::Sender<MirrorJob>, job: MirrorJob) {
    // Stream callbacks are synchronous; a full mirror queue sheds the
    // mirror copy, never the consumer delivery.
    if let Err(e) = mirror.try_send(job) {
        tracing::warn!(error = %e, "mirror queue full, dropping mirror copy");
    }
}

/// Write one stream delivery to the PIT store and publish its envelope.
async fn mirror_one(
    pit: &PitStore,
    bus: Option<&dyn EventBus>,
    metrics: &GatewayMetrics,
    job: MirrorJob,
) {
    let now = Utc::now();
    match pit
        .snapshot(job.kind.as_str(), now, &job.payload, job.venue.as_str())
        .await
    {
        Ok(_) => GatewayMetrics::bump(&metrics.pit_snapshots),
        Err(e) => tracing::warn!(error = %e, "stream snapshot failed"),
    }

    if let Some(bus) = bus {
        let envelope = Envelope::build(&job.symbol, job.venue.as_str(), job.payload, Some(now))
            .with_identity(job.venue, job.kind, SourceTier::Hot)
            .with_provenance(job.venue.as_str(), SourceTier::Hot, 1.0, false);

        match envelope.to_json() {
            Ok(body) => {
                let key = format!("{}:{}", job.venue, job.symbol);
                match bus
                    .publish(job.kind.as_str(), &key, body.into_bytes())
                    .await
                {
                    Ok(()) => GatewayMetrics::bump(&metrics.bus_publishes),
                    Err(e) => tracing::warn!(error = %e, "envelope publish failed"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "envelope encode failed"),
        }
    }
}

fn encode_cached(value: &CachedValue) -> serde_json::Result<Vec<u8>> {
    match value {
        CachedValue::Klines(klines) => serde_json::to_vec(klines),
        CachedValue::Trades(trades) => serde_json::to_vec(trades),
        CachedValue::Book(book) => serde_json::to_vec(book),
        CachedValue::Bytes(bytes) => Ok(bytes.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::mock::MockAdapter;
    use types::Side;

    fn test_config(pit_dir: &std::path::Path) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.hot.venues = vec!["kraken".to_string()];
        config.warm.venues = vec!["kraken".to_string()];
        config.pit.base_path = pit_dir.display().to_string();
        config
    }

    fn sample_trade() -> Trade {
        Trade {
            symbol: "BTCUSD".to_string(),
            price: 62_000.0,
            size: 0.5,
            side: Side::Buy,
            trade_id: "t-1".to_string(),
            timestamp_ns: 1_700_000_000_000_000_000,
        }
    }

    #[tokio::test]
    async fn unknown_venue_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = MarketGateway::new(test_config(dir.path())).unwrap();
        let err = gateway
            .get_klines(VenueId::Okx, "BTCUSD", "1m", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownVenue(_)));
    }

    #[tokio::test]
    async fn cached_pull_hits_after_first_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = MarketGateway::new(test_config(dir.path())).unwrap();

        let mock = MockAdapter::new(VenueId::Kraken);
        mock.script_trades(vec![sample_trade()]);
        gateway.install_adapter(VenueId::Kraken, mock.clone());
        gateway.start().await.unwrap();

        let first = gateway
            .get_trades(VenueId::Kraken, "BTCUSD", 10)
            .await
            .unwrap();
        let second = gateway
            .get_trades(VenueId::Kraken, "BTCUSD", 10)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            mock.rest_calls.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "second call must be served from cache"
        );

        let attribution = gateway.source_attribution(VenueId::Kraken).unwrap();
        assert_eq!(attribution.cache_hits, 1);
        assert_eq!(attribution.cache_misses, 1);

        // Only the upstream fetch counts as a completed request; the cache
        // hit never reached the venue.
        let limits = gateway.rate_limits(VenueId::Kraken).unwrap();
        assert_eq!(limits.completed["trades"], 1);
        assert!(limits.last_request_age_ms.is_some());

        gateway.stop().await;
    }

    #[tokio::test]
    async fn rest_failures_trip_the_http_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.circuits.insert(
            "kraken".to_string(),
            config::VenueCircuitConfig {
                http: config::CircuitConfig {
                    failure_threshold: 2,
                    success_threshold: 1,
                    timeout_ms: 60_000,
                    max_probe: 1,
                    fallback_enabled: false,
                    fallback_venues: Vec::new(),
                },
                ws: config::CircuitConfig::default(),
            },
        );
        let gateway = MarketGateway::new(config).unwrap();

        let mock = MockAdapter::new(VenueId::Kraken);
        mock.set_rest_failing(true);
        gateway.install_adapter(VenueId::Kraken, mock);
        gateway.start().await.unwrap();

        for _ in 0..2 {
            // Distinct limits dodge the cache; each miss hits upstream.
            assert!(gateway
                .get_trades(VenueId::Kraken, "BTCUSD", 1)
                .await
                .is_err());
            gateway.cache.delete("trades:kraken:BTCUSD:1");
        }

        let err = gateway
            .get_trades(VenueId::Kraken, "BTCUSD", 1)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("circuit open") || message.contains("coalesced"),
            "expected circuit rejection, got {message}"
        );

        let snapshot = gateway
            .circuit_state(VenueId::Kraken, Channel::Http)
            .unwrap();
        assert_eq!(snapshot.state, crate::circuit_breaker::CircuitState::Open);

        let health = gateway.venue_health(VenueId::Kraken).unwrap();
        assert!(health.error_rate > 0.0);

        gateway.stop().await;
    }

    #[tokio::test]
    async fn fallback_serves_klines_when_primary_circuit_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.warm.venues = vec!["kraken".to_string(), "binance".to_string()];
        config.circuits.insert(
            "kraken".to_string(),
            config::VenueCircuitConfig {
                http: config::CircuitConfig {
                    failure_threshold: 1,
                    success_threshold: 1,
                    timeout_ms: 60_000,
                    max_probe: 1,
                    fallback_enabled: true,
                    fallback_venues: vec!["binance".to_string()],
                },
                ws: config::CircuitConfig::default(),
            },
        );
        let gateway = MarketGateway::new(config).unwrap();

        let kraken = MockAdapter::new(VenueId::Kraken);
        kraken.set_rest_failing(true);
        let binance = MockAdapter::new(VenueId::Binance);
        binance.script_klines(vec![Kline {
            symbol: "BTCUSD".to_string(),
            interval: "1m".to_string(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            open_time_ns: 1,
            close_time_ns: 60_000_000_001,
        }]);
        gateway.install_adapter(VenueId::Kraken, kraken);
        gateway.install_adapter(VenueId::Binance, binance.clone());
        gateway.start().await.unwrap();

        let klines = gateway
            .get_klines(VenueId::Kraken, "BTCUSD", "1m", 10)
            .await
            .unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(
            binance.rest_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        gateway.stop().await;
    }

    #[tokio::test]
    async fn book_pulls_never_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.warm.venues = vec!["kraken".to_string(), "binance".to_string()];
        config.circuits.insert(
            "kraken".to_string(),
            config::VenueCircuitConfig {
                http: config::CircuitConfig {
                    failure_threshold: 1,
                    success_threshold: 1,
                    timeout_ms: 60_000,
                    max_probe: 1,
                    fallback_enabled: true,
                    fallback_venues: vec!["binance".to_string()],
                },
                ws: config::CircuitConfig::default(),
            },
        );
        let gateway = MarketGateway::new(config).unwrap();

        let kraken = MockAdapter::new(VenueId::Kraken);
        kraken.set_rest_failing(true);
        let binance = MockAdapter::new(VenueId::Binance);
        binance.script_book(BookL2 {
            symbol: "BTCUSD".to_string(),
            sequence: 1,
            bids: vec![],
            asks: vec![],
            timestamp_ns: 1,
            resync: false,
        });
        gateway.install_adapter(VenueId::Kraken, kraken);
        gateway.install_adapter(VenueId::Binance, binance.clone());
        gateway.start().await.unwrap();

        assert!(gateway
            .get_book_l2(VenueId::Kraken, "BTCUSD", 10)
            .await
            .is_err());
        assert_eq!(
            binance.rest_calls.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "microstructure must not be served by a fallback venue"
        );

        gateway.stop().await;
    }

    #[tokio::test]
    async fn degraded_start_reports_offline_venue() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.hot.venues = vec!["kraken".to_string()];
        let gateway = MarketGateway::new(config).unwrap();

        let mock = MockAdapter::new(VenueId::Kraken);
        mock.set_connect_failing(true);
        gateway.install_adapter(VenueId::Kraken, mock);

        // A hot venue that cannot connect leaves the gateway degraded,
        // never aborted.
        gateway.start().await.unwrap();
        let health = gateway.venue_health(VenueId::Kraken).unwrap();
        assert_eq!(health.status, HealthState::Offline);
        assert!(!gateway.healthy_venues().contains(&VenueId::Kraken));

        gateway.stop().await;
    }
}
