//! Multi-tier TTL cache with single-flight coalescing
//!
//! Keys follow the facade convention `{kind}:{venue}:{symbol}[...]`; the
//! leading segment selects the TTL tier. Expired entries are removed lazily
//! on access and periodically by an owned sweeper task. When the entry cap
//! is reached, a cold victim is evicted from a bounded sample of the access
//! ring rather than a full scan.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use types::{BookL2, Kline, Trade};

use crate::error::{GatewayError, Result};

/// Number of ring entries sampled when picking an eviction victim.
const EVICTION_SCAN: usize = 64;

/// TTL tiers, selected by key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// Sub-10s prices (order books, best bid/ask)
    PricesHot,
    /// Tens of seconds (trades, klines)
    PricesWarm,
    /// Minutes (volume aggregates)
    VolumesVadr,
    /// A day (token metadata)
    TokenMeta,
}

impl CacheTier {
    /// Tier for a cache key. Kind-named prefixes map onto tiers; unknown
    /// prefixes take the warm default.
    pub fn for_key(key: &str) -> Self {
        let prefix = key.split(':').next().unwrap_or("");
        match prefix {
            "prices_hot" | "book_l2" => CacheTier::PricesHot,
            "prices_warm" | "trades" | "klines" => CacheTier::PricesWarm,
            "volumes_vadr" | "volumes" => CacheTier::VolumesVadr,
            "token_meta" | "meta" => CacheTier::TokenMeta,
            _ => CacheTier::PricesWarm,
        }
    }

    /// Configured TTL for this tier.
    pub fn ttl(&self, config: &config::CacheConfig) -> Duration {
        let secs = match self {
            CacheTier::PricesHot => config.prices_hot_secs,
            CacheTier::PricesWarm => config.prices_warm_secs,
            CacheTier::VolumesVadr => config.volumes_vadr_secs,
            CacheTier::TokenMeta => config.token_meta_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Closed sum of the shapes the cache holds. The raw arm covers the few
/// callers that genuinely need heterogeneous payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// Candle series
    Klines(Vec<Kline>),
    /// Trade prints
    Trades(Vec<Trade>),
    /// Order book snapshot
    Book(BookL2),
    /// Opaque bytes
    Bytes(Vec<u8>),
}

/// Monotonic cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that missed or found an expired entry
    pub misses: u64,
    /// Entries evicted for capacity
    pub evictions: u64,
    /// Entries removed on expiry
    pub expirations: u64,
    /// Resident entries right now
    pub entries: usize,
}

impl CacheStats {
    /// Hit share of all lookups.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    value: CachedValue,
    tier: CacheTier,
    inserted: Instant,
    ttl: Duration,
    last_access: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted) >= self.ttl
    }
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    /// Access ring for bounded-sample eviction.
    ring: VecDeque<String>,
}

type FlightResult = std::result::Result<CachedValue, String>;

/// TTL cache shared across the facade's pull paths.
pub struct TtlCache {
    config: config::CacheConfig,
    inner: Mutex<Inner>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl TtlCache {
    /// Build an empty cache.
    pub fn new(config: config::CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// TTL the cache would apply to a key.
    pub fn ttl_for(&self, key: &str) -> Duration {
        CacheTier::for_key(key).ttl(&self.config)
    }

    /// Look up a key. Expired entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        enum Lookup {
            Hit(CachedValue),
            Expired,
            Miss,
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        let lookup = match inner.map.get_mut(key) {
            Some(entry) if entry.expired(now) => Lookup::Expired,
            Some(entry) => {
                entry.last_access = now;
                Lookup::Hit(entry.value.clone())
            }
            None => Lookup::Miss,
        };

        match lookup {
            Lookup::Hit(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Lookup::Expired => {
                inner.map.remove(key);
                inner.ring.retain(|k| k != key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Lookup::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert with the key's tier TTL.
    pub fn set(&self, key: &str, value: CachedValue) {
        let ttl = self.ttl_for(key);
        self.set_with_ttl(key, value, ttl);
    }

    /// Insert with an explicit TTL, evicting a cold entry at capacity.
    pub fn set_with_ttl(&self, key: &str, value: CachedValue, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let is_new = !inner.map.contains_key(key);
        if is_new && inner.map.len() >= self.config.max_entries {
            if let Some(victim) = pick_victim(&inner) {
                inner.map.remove(&victim);
                inner.ring.retain(|k| *k != victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(evicted = %victim, "cache at capacity, evicted cold entry");
            }
        }

        inner.map.insert(
            key.to_string(),
            Entry {
                value,
                tier: CacheTier::for_key(key),
                inserted: now,
                ttl,
                last_access: now,
            },
        );
        if is_new {
            inner.ring.push_back(key.to_string());
        }
    }

    /// Remove a key.
    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.map.remove(key);
        inner.ring.retain(|k| k != key);
    }

    /// Coalesced lookup: concurrent misses for the same key produce one
    /// upstream fetch; waiters share the winner's result.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<(CachedValue, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedValue>>,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, true));
        }

        // Either join an in-flight fetch or become the one performing it.
        let flight = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Ok(tx)
                }
            }
        };

        let tx = match flight {
            Err(mut rx) => {
                // The leader always broadcasts before dropping the sender.
                while rx.borrow().is_none() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                let shared = rx.borrow().clone();
                return match shared {
                    Some(Ok(value)) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Ok((value, true))
                    }
                    Some(Err(error)) => Err(GatewayError::Internal(format!(
                        "coalesced fetch failed: {error}"
                    ))),
                    None => Err(GatewayError::Internal(
                        "coalesced fetch abandoned".to_string(),
                    )),
                };
            }
            Ok(tx) => tx,
        };

        let outcome = fetch().await;

        self.inflight.lock().remove(key);
        match outcome {
            Ok(value) => {
                self.set(key, value.clone());
                let _ = tx.send(Some(Ok(value.clone())));
                Ok((value, false))
            }
            Err(error) => {
                let _ = tx.send(Some(Err(error.to_string())));
                Err(error)
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.lock().map.len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Resident entries per tier, for observability.
    pub fn entries_by_tier(&self) -> HashMap<CacheTier, usize> {
        let inner = self.inner.lock();
        let mut counts: HashMap<CacheTier, usize> = HashMap::new();
        for entry in inner.map.values() {
            *counts.entry(entry.tier).or_default() += 1;
        }
        counts
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.map.len();
        inner.map.retain(|_, entry| !entry.expired(now));
        let removed = before - inner.map.len();
        if removed > 0 {
            let map = &inner.map;
            let retained: VecDeque<String> = inner
                .ring
                .iter()
                .filter(|k| map.contains_key(*k))
                .cloned()
                .collect();
            inner.ring = retained;
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "cache sweep removed expired entries");
        }
        removed
    }

    /// Spawn the periodic sweeper. Exits promptly on shutdown.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Select an eviction victim from a bounded prefix of the access ring:
/// the sampled entry with the oldest `last_access` loses.
fn pick_victim(inner: &Inner) -> Option<String> {
    let mut best: Option<(&String, Instant)> = None;
    for key in inner.ring.iter().take(EVICTION_SCAN) {
        let Some(entry) = inner.map.get(key) else {
            continue;
        };
        best = match best {
            None => Some((key, entry.last_access)),
            Some((_, when)) if entry.last_access < when => Some((key, entry.last_access)),
            keep => keep,
        };
    }
    best.map(|(key, _)| key.clone())
        .or_else(|| inner.ring.front().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn small_cache(max_entries: usize) -> TtlCache {
        TtlCache::new(config::CacheConfig {
            prices_hot_secs: 1,
            prices_warm_secs: 30,
            volumes_vadr_secs: 120,
            token_meta_secs: 86_400,
            max_entries,
        })
    }

    #[test]
    fn tier_prefixes_map_to_ttls() {
        let cache = small_cache(10);
        assert_eq!(
            cache.ttl_for("book_l2:kraken:BTCUSD"),
            Duration::from_secs(1)
        );
        assert_eq!(
            cache.ttl_for("klines:binance:ETHUSD:1m:100"),
            Duration::from_secs(30)
        );
        assert_eq!(cache.ttl_for("meta:token:XYZ"), Duration::from_secs(86_400));
        assert_eq!(cache.ttl_for("mystery:key"), Duration::from_secs(30));
    }

    #[test]
    fn set_get_within_ttl_round_trips() {
        let cache = small_cache(10);
        let value = CachedValue::Bytes(vec![1, 2, 3]);
        cache.set_with_ttl("trades:kraken:BTCUSD:50", value.clone(), Duration::from_secs(5));
        assert_eq!(cache.get("trades:kraken:BTCUSD:50"), Some(value));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_never_returned() {
        let cache = small_cache(10);
        cache.set_with_ttl(
            "trades:kraken:BTCUSD:50",
            CachedValue::Bytes(vec![1]),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("trades:kraken:BTCUSD:50").is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn capacity_evicts_the_coldest_sampled_entry() {
        let cache = small_cache(3);
        cache.set_with_ttl("a", CachedValue::Bytes(vec![1]), Duration::from_secs(60));
        cache.set_with_ttl("b", CachedValue::Bytes(vec![2]), Duration::from_secs(60));
        cache.set_with_ttl("c", CachedValue::Bytes(vec![3]), Duration::from_secs(60));

        // Touch a and c so b is the coldest.
        cache.get("a");
        cache.get("c");

        cache.set_with_ttl("d", CachedValue::Bytes(vec![4]), Duration::from_secs(60));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let cache = Arc::new(small_cache(10));
        let fetches = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("klines:kraken:BTCUSD:1m:10", || {
                        let fetches = fetches.clone();
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(CachedValue::Bytes(vec![42]))
                        }
                    })
                    .await
            }));
        }

        for task in tasks {
            let (value, _) = task.await.unwrap().unwrap();
            assert_eq!(value, CachedValue::Bytes(vec![42]));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1, "exactly one upstream fetch");

        // A later get within TTL is a plain hit.
        assert!(cache.get("klines:kraken:BTCUSD:1m:10").is_some());
    }

    #[tokio::test]
    async fn coalesced_error_reaches_all_waiters() {
        let cache = Arc::new(small_cache(10));

        let loser = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_fetch("trades:kraken:BTCUSD:10", || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<CachedValue, _>(GatewayError::Internal("venue down".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let waiter = cache
            .get_or_fetch("trades:kraken:BTCUSD:10", || async {
                panic!("waiter must not fetch")
            })
            .await;

        assert!(loser.await.unwrap().is_err());
        assert!(waiter.is_err());
        // Nothing was cached.
        assert!(cache.get("trades:kraken:BTCUSD:10").is_none());
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries() {
        let cache = Arc::new(small_cache(10));
        cache.set_with_ttl("a", CachedValue::Bytes(vec![1]), Duration::from_millis(10));
        cache.set_with_ttl("b", CachedValue::Bytes(vec![2]), Duration::from_secs(60));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = cache.start_sweeper(Duration::from_millis(20), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.stats().entries, 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper exits on shutdown")
            .unwrap();
    }
}
