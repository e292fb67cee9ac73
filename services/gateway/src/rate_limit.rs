//! Per-venue weighted rate limiting
//!
//! Layers, in precedence order:
//! 1. Provider-dictated `Retry-After` deadlines beat everything.
//! 2. Daily and monthly budget counters with lazy window resets.
//! 3. A sliding weight window when the venue configures a weight ceiling.
//! 4. Per-endpoint pacing buckets for heavy endpoints (weight > 1).
//! 5. The venue's global token bucket, charged by endpoint weight. A
//!    weight that can never fit the bucket's burst is a weight rejection,
//!    not a pacing rejection.
//!
//! Admission denials are typed and never retried internally; callers see
//! the reason and decide whether to back off. All per-venue state sits
//! behind that venue's own lock, so venues do not contend in steady state.

use governor::clock::DefaultClock;
use governor::{Quota, RateLimiter as GovernorLimiter};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use types::VenueId;

type DirectLimiter =
    GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

const WEIGHT_WINDOW: Duration = Duration::from_secs(60);
const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const MONTHLY_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Why an admission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// A provider Retry-After deadline is active
    RetryAfterActive {
        /// Milliseconds until requests may resume
        remaining_ms: u64,
    },
    /// The endpoint's pacing bucket is empty
    EndpointExhausted {
        /// Endpoint name
        endpoint: String,
    },
    /// The venue's global token bucket is empty
    VenueExhausted,
    /// Endpoint weight cannot fit the current weight window or burst
    WeightExceeded {
        /// Weight the endpoint would have consumed
        weight: u32,
    },
    /// Rolling 24 h budget is spent
    DailyBudget,
    /// Rolling 30 d budget is spent
    MonthlyBudget,
    /// Venue was never registered with the limiter
    UnknownVenue,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::RetryAfterActive { remaining_ms } => {
                write!(f, "retry-after active for {remaining_ms}ms")
            }
            RejectReason::EndpointExhausted { endpoint } => {
                write!(f, "endpoint {endpoint} exhausted")
            }
            RejectReason::VenueExhausted => f.write_str("venue bucket exhausted"),
            RejectReason::WeightExceeded { weight } => {
                write!(f, "weight {weight} exceeds window")
            }
            RejectReason::DailyBudget => f.write_str("daily budget exceeded"),
            RejectReason::MonthlyBudget => f.write_str("monthly budget exceeded"),
            RejectReason::UnknownVenue => f.write_str("unknown venue"),
        }
    }
}

/// Per-venue request statistics for monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestStats {
    /// Admission attempts
    pub total: u64,
    /// Admitted requests
    pub admitted: u64,
    /// Rejected requests
    pub rejected: u64,
}

impl RequestStats {
    /// Share of attempts that were admitted.
    pub fn admit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.admitted as f64 / self.total as f64
        }
    }
}

/// Observable limiter state for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSnapshot {
    /// Active configuration
    pub config: config::RateLimitConfig,
    /// Weight accumulated in the current window
    pub window_weight: u64,
    /// Requests used against the daily budget
    pub daily_used: u64,
    /// Requests used against the monthly budget
    pub monthly_used: u64,
    /// Milliseconds until a provider Retry-After deadline lapses
    pub retry_after_ms: Option<u64>,
    /// Request statistics
    pub stats: RequestStats,
    /// Milliseconds since the last completed request, if any
    pub last_request_age_ms: Option<u64>,
    /// Completed requests per endpoint
    pub completed: BTreeMap<String, u64>,
}

struct BudgetWindow {
    started: Instant,
    used: u64,
}

impl BudgetWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            used: 0,
        }
    }

    /// Lazily reset once the window has rolled over.
    fn current_used(&mut self, window: Duration) -> u64 {
        if self.started.elapsed() >= window {
            self.started = Instant::now();
            self.used = 0;
        }
        self.used
    }
}

struct VenueState {
    config: config::RateLimitConfig,
    global: Arc<DirectLimiter>,
    endpoints: HashMap<String, Arc<DirectLimiter>>,
    window_started: Instant,
    window_weight: u64,
    retry_after: Option<Instant>,
    daily: BudgetWindow,
    monthly: BudgetWindow,
    stats: RequestStats,
    last_request: Option<Instant>,
    completed: BTreeMap<String, u64>,
}

impl VenueState {
    fn new(config: config::RateLimitConfig, clock: &DefaultClock) -> Self {
        let global = Arc::new(build_global_bucket(&config, clock));
        let endpoints = build_endpoint_buckets(&config, clock);
        Self {
            config,
            global,
            endpoints,
            window_started: Instant::now(),
            window_weight: 0,
            retry_after: None,
            daily: BudgetWindow::new(),
            monthly: BudgetWindow::new(),
            stats: RequestStats::default(),
            last_request: None,
            completed: BTreeMap::new(),
        }
    }

    fn weight_of(&self, endpoint: &str) -> u32 {
        self.config
            .weight_limits
            .get(endpoint)
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    /// Slide the weight window forward if a full period has passed.
    fn roll_window(&mut self) {
        if self.window_started.elapsed() >= WEIGHT_WINDOW {
            self.window_started = Instant::now();
            self.window_weight = 0;
        }
    }
}

fn nonzero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value.max(1)).unwrap_or(NonZeroU32::MIN)
}

fn build_global_bucket(config: &config::RateLimitConfig, clock: &DefaultClock) -> DirectLimiter {
    let quota = Quota::per_second(nonzero(config.requests_per_second))
        .allow_burst(nonzero(config.burst_allowance));
    GovernorLimiter::direct_with_clock(quota, clock)
}

/// Pacing buckets for heavy endpoints: rate = rps / weight, burst = 1.
/// Weight-1 endpoints ride the global bucket alone.
fn build_endpoint_buckets(
    config: &config::RateLimitConfig,
    clock: &DefaultClock,
) -> HashMap<String, Arc<DirectLimiter>> {
    config
        .weight_limits
        .iter()
        .filter(|(_, weight)| **weight > 1)
        .map(|(endpoint, weight)| {
            let period =
                Duration::from_secs_f64(*weight as f64 / config.requests_per_second.max(1) as f64);
            let quota = Quota::with_period(period)
                .unwrap_or_else(|| Quota::per_second(nonzero(1)))
                .allow_burst(nonzero(1));
            (
                endpoint.clone(),
                Arc::new(GovernorLimiter::direct_with_clock(quota, clock)),
            )
        })
        .collect()
}

/// Provider-aware, weighted rate limiter for all venues.
pub struct RateLimiter {
    venues: DashMap<VenueId, Mutex<VenueState>>,
    clock: DefaultClock,
}

impl RateLimiter {
    /// Empty limiter; venues are added with [`register`].
    ///
    /// [`register`]: RateLimiter::register
    pub fn new() -> Self {
        Self {
            venues: DashMap::new(),
            clock: DefaultClock::default(),
        }
    }

    /// Register or replace a venue's limits.
    pub fn register(&self, venue: VenueId, config: config::RateLimitConfig) {
        self.venues
            .insert(venue, Mutex::new(VenueState::new(config, &self.clock)));
    }

    /// Replace a venue's limits, rebuilding its buckets. Usage counters and
    /// any active Retry-After deadline survive the update.
    pub fn update_limits(
        &self,
        venue: VenueId,
        config: config::RateLimitConfig,
    ) -> Result<(), RejectReason> {
        let entry = self.venues.get(&venue).ok_or(RejectReason::UnknownVenue)?;
        let mut state = entry.lock();
        state.global = Arc::new(build_global_bucket(&config, &self.clock));
        state.endpoints = build_endpoint_buckets(&config, &self.clock);
        state.config = config;
        Ok(())
    }

    /// Admit or reject one request against every applicable limit.
    pub fn allow(&self, venue: VenueId, endpoint: &str) -> Result<(), RejectReason> {
        let entry = self.venues.get(&venue).ok_or(RejectReason::UnknownVenue)?;
        let mut state = entry.lock();
        state.stats.total += 1;

        let decision = Self::check(&mut state, endpoint);
        match decision {
            Ok(()) => state.stats.admitted += 1,
            Err(_) => state.stats.rejected += 1,
        }
        decision
    }

    fn check(state: &mut VenueState, endpoint: &str) -> Result<(), RejectReason> {
        // Retry-After takes absolute precedence.
        if let Some(deadline) = state.retry_after {
            let now = Instant::now();
            if now < deadline {
                return Err(RejectReason::RetryAfterActive {
                    remaining_ms: (deadline - now).as_millis() as u64,
                });
            }
            state.retry_after = None;
        }

        if let Some(daily) = state.config.daily_limit {
            if state.daily.current_used(DAILY_WINDOW) >= daily {
                return Err(RejectReason::DailyBudget);
            }
        }
        if let Some(monthly) = state.config.monthly_limit {
            if state.monthly.current_used(MONTHLY_WINDOW) >= monthly {
                return Err(RejectReason::MonthlyBudget);
            }
        }

        let weight = state.weight_of(endpoint);

        // A weight that can never fit the burst is a weight problem, not a
        // pacing problem.
        if weight > state.config.burst_allowance {
            return Err(RejectReason::WeightExceeded { weight });
        }

        if let Some(limit) = state.config.weight_limit {
            state.roll_window();
            if state.window_weight + weight as u64 > limit as u64 {
                return Err(RejectReason::WeightExceeded { weight });
            }
        }

        if let Some(bucket) = state.endpoints.get(endpoint) {
            if bucket.check().is_err() {
                return Err(RejectReason::EndpointExhausted {
                    endpoint: endpoint.to_string(),
                });
            }
        }

        match state.global.check_n(nonzero(weight)) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(RejectReason::VenueExhausted),
            Err(_) => return Err(RejectReason::WeightExceeded { weight }),
        }

        // Admitted: commit weight and budget usage.
        state.window_weight += weight as u64;
        state.daily.used += 1;
        state.monthly.used += 1;
        Ok(())
    }

    /// Delay after which an admission attempt is worth repeating.
    ///
    /// Retry-After deadlines are exact; bucket pacing is estimated as one
    /// refill period for the endpoint's weight (probing the bucket itself
    /// would consume capacity). Weights that can never fit the burst report
    /// the weight-window roll as the soonest meaningful retry.
    pub fn wait(&self, venue: VenueId, endpoint: &str) -> Duration {
        let Some(entry) = self.venues.get(&venue) else {
            return Duration::ZERO;
        };
        let state = entry.lock();

        if let Some(deadline) = state.retry_after {
            let now = Instant::now();
            if now < deadline {
                return deadline - now;
            }
        }

        let weight = state.weight_of(endpoint);
        if weight > state.config.burst_allowance {
            return WEIGHT_WINDOW;
        }

        Duration::from_secs_f64(
            weight as f64 / state.config.requests_per_second.max(1) as f64,
        )
    }

    /// Sleep until a request is admitted or `budget` elapses. Returns the
    /// final rejection when the budget runs out.
    pub async fn acquire(
        &self,
        venue: VenueId,
        endpoint: &str,
        budget: Duration,
    ) -> Result<(), RejectReason> {
        let deadline = Instant::now() + budget;
        loop {
            match self.allow(venue, endpoint) {
                Ok(()) => return Ok(()),
                Err(RejectReason::UnknownVenue) => return Err(RejectReason::UnknownVenue),
                Err(reason) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(reason);
                    }
                    let wait = self
                        .wait(venue, endpoint)
                        .max(Duration::from_millis(1))
                        .min(deadline - now);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Record a completed request for a venue endpoint.
    ///
    /// Admission accounting (weight, budgets, admit/reject counts) happens
    /// in [`allow`]; this is the observational half the facade calls after
    /// an admitted request actually ran: last-request time and per-endpoint
    /// completion counts.
    ///
    /// [`allow`]: RateLimiter::allow
    pub fn record_request(&self, venue: VenueId, endpoint: &str) -> Result<(), RejectReason> {
        let entry = self.venues.get(&venue).ok_or(RejectReason::UnknownVenue)?;
        let mut state = entry.lock();
        state.last_request = Some(Instant::now());
        *state.completed.entry(endpoint.to_string()).or_default() += 1;
        Ok(())
    }

    /// Ingest provider rate-limit headers (case-sensitive names).
    ///
    /// - `X-MBX-USED-WEIGHT*`: replaces the accumulated window weight.
    /// - `ratelimit-remaining` = 0 with `ratelimit-reset` (unix ms): sets a
    ///   Retry-After deadline at the reset time.
    /// - `Retry-After` (seconds): sets a deadline relative to now.
    ///
    /// Unknown headers are ignored; an unknown venue is an error.
    pub fn ingest_headers(
        &self,
        venue: VenueId,
        headers: &HashMap<String, String>,
    ) -> Result<(), RejectReason> {
        let entry = self.venues.get(&venue).ok_or(RejectReason::UnknownVenue)?;
        let mut state = entry.lock();

        for (name, value) in headers {
            if name.starts_with("X-MBX-USED-WEIGHT") {
                if let Ok(weight) = value.trim().parse::<u64>() {
                    state.roll_window();
                    state.window_weight = state.window_weight.max(weight);
                    tracing::debug!(venue = %venue, weight, "provider weight ingested");
                }
            } else if name == "Retry-After" {
                if let Ok(secs) = value.trim().parse::<u64>() {
                    state.retry_after = Some(Instant::now() + Duration::from_secs(secs));
                    tracing::warn!(venue = %venue, secs, "provider retry-after ingested");
                }
            }
        }

        // remaining/reset pairs only matter once the provider says zero.
        if let Some(remaining) = headers.get("ratelimit-remaining") {
            if remaining.trim().parse::<u64>() == Ok(0) {
                if let Some(reset) = headers.get("ratelimit-reset") {
                    if let Ok(reset_ms) = reset.trim().parse::<u64>() {
                        let now_ms = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0);
                        let delta = Duration::from_millis(reset_ms.saturating_sub(now_ms));
                        state.retry_after = Some(Instant::now() + delta);
                        tracing::warn!(
                            venue = %venue,
                            reset_in_ms = delta.as_millis() as u64,
                            "provider reported zero remaining, pausing"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Observable state for one venue.
    pub fn get_limits(&self, venue: VenueId) -> Result<LimiterSnapshot, RejectReason> {
        let entry = self.venues.get(&venue).ok_or(RejectReason::UnknownVenue)?;
        let mut state = entry.lock();
        let daily_used = state.daily.current_used(DAILY_WINDOW);
        let monthly_used = state.monthly.current_used(MONTHLY_WINDOW);
        state.roll_window();
        Ok(LimiterSnapshot {
            config: state.config.clone(),
            window_weight: state.window_weight,
            daily_used,
            monthly_used,
            retry_after_ms: state.retry_after.and_then(|deadline| {
                let now = Instant::now();
                (now < deadline).then(|| (deadline - now).as_millis() as u64)
            }),
            stats: state.stats.clone(),
            last_request_age_ms: state
                .last_request
                .map(|at| at.elapsed().as_millis() as u64),
            completed: state.completed.clone(),
        })
    }

    /// Venues currently registered.
    pub fn venues(&self) -> Vec<VenueId> {
        self.venues.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn limiter_with(venue: VenueId, config: config::RateLimitConfig) -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter.register(venue, config);
        limiter
    }

    fn weighted_config() -> config::RateLimitConfig {
        let mut weights = BTreeMap::new();
        weights.insert("orderbook".to_string(), 1);
        weights.insert("all_tickers".to_string(), 40);
        config::RateLimitConfig {
            requests_per_second: 10,
            burst_allowance: 20,
            weight_limits: weights,
            weight_limit: None,
            daily_limit: Some(100_000),
            monthly_limit: None,
        }
    }

    #[test]
    fn weighted_burst_scenario() {
        let limiter = limiter_with(VenueId::Binance, weighted_config());

        let mut admitted = 0;
        let mut rejected = 0;
        for _ in 0..50 {
            match limiter.allow(VenueId::Binance, "orderbook") {
                Ok(()) => admitted += 1,
                Err(RejectReason::VenueExhausted) => rejected += 1,
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }
        assert!(admitted >= 20, "burst of 20 should admit at least 20, got {admitted}");
        assert!(rejected > 0);

        // all_tickers weighs 40, which can never fit a burst of 20.
        let err = limiter.allow(VenueId::Binance, "all_tickers").unwrap_err();
        assert!(matches!(err, RejectReason::WeightExceeded { weight: 40 }));
    }

    #[test]
    fn retry_after_header_blocks_then_expires() {
        let limiter = limiter_with(VenueId::Kraken, config::RateLimitConfig::default());

        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "2".to_string());
        limiter.ingest_headers(VenueId::Kraken, &headers).unwrap();

        let err = limiter.allow(VenueId::Kraken, "trades").unwrap_err();
        assert!(matches!(err, RejectReason::RetryAfterActive { .. }));
        assert!(limiter.wait(VenueId::Kraken, "trades") > Duration::from_millis(1500));

        let snapshot = limiter.get_limits(VenueId::Kraken).unwrap();
        assert!(snapshot.retry_after_ms.unwrap() > 1500);
    }

    #[tokio::test]
    async fn retry_after_expiry_resumes_admission() {
        let limiter = limiter_with(VenueId::Kraken, config::RateLimitConfig::default());

        let mut headers = HashMap::new();
        // Provider reports zero remaining with a reset 50ms out.
        let reset_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
            + 50;
        headers.insert("ratelimit-remaining".to_string(), "0".to_string());
        headers.insert("ratelimit-reset".to_string(), reset_ms.to_string());
        limiter.ingest_headers(VenueId::Kraken, &headers).unwrap();

        assert!(limiter.allow(VenueId::Kraken, "trades").is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;
        limiter.allow(VenueId::Kraken, "trades").unwrap();
    }

    #[test]
    fn weight_window_ceiling_applies() {
        let mut config = weighted_config();
        config.weight_limit = Some(5);
        let limiter = limiter_with(VenueId::Binance, config);

        for _ in 0..5 {
            limiter.allow(VenueId::Binance, "orderbook").unwrap();
        }
        let err = limiter.allow(VenueId::Binance, "orderbook").unwrap_err();
        assert!(matches!(err, RejectReason::WeightExceeded { weight: 1 }));
    }

    #[test]
    fn provider_weight_header_consumes_window() {
        let mut config = weighted_config();
        config.weight_limit = Some(100);
        let limiter = limiter_with(VenueId::Binance, config);

        let mut headers = HashMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M".to_string(), "99".to_string());
        limiter.ingest_headers(VenueId::Binance, &headers).unwrap();

        limiter.allow(VenueId::Binance, "orderbook").unwrap(); // 99 + 1 = 100
        let err = limiter.allow(VenueId::Binance, "orderbook").unwrap_err();
        assert!(matches!(err, RejectReason::WeightExceeded { .. }));
    }

    #[test]
    fn daily_budget_is_enforced() {
        let mut config = config::RateLimitConfig::default();
        config.burst_allowance = 100;
        config.requests_per_second = 100;
        config.daily_limit = Some(3);
        let limiter = limiter_with(VenueId::Coinbase, config);

        for _ in 0..3 {
            limiter.allow(VenueId::Coinbase, "klines").unwrap();
        }
        let err = limiter.allow(VenueId::Coinbase, "klines").unwrap_err();
        assert!(matches!(err, RejectReason::DailyBudget));
    }

    #[test]
    fn unknown_venue_is_rejected() {
        let limiter = RateLimiter::new();
        assert!(matches!(
            limiter.allow(VenueId::Okx, "trades").unwrap_err(),
            RejectReason::UnknownVenue
        ));
        assert!(limiter.ingest_headers(VenueId::Okx, &HashMap::new()).is_err());
    }

    #[test]
    fn heavy_endpoints_get_pacing_buckets() {
        let mut weights = BTreeMap::new();
        weights.insert("expensive".to_string(), 5);
        let config = config::RateLimitConfig {
            requests_per_second: 100,
            burst_allowance: 100,
            weight_limits: weights,
            weight_limit: None,
            daily_limit: None,
            monthly_limit: None,
        };
        let limiter = limiter_with(VenueId::Kraken, config);

        limiter.allow(VenueId::Kraken, "expensive").unwrap();
        // Burst of 1 on the sub-bucket: an immediate second call is paced.
        let err = limiter.allow(VenueId::Kraken, "expensive").unwrap_err();
        assert!(matches!(err, RejectReason::EndpointExhausted { .. }));
    }

    #[test]
    fn update_limits_rebuilds_buckets() {
        let limiter = limiter_with(VenueId::Kraken, config::RateLimitConfig::default());
        let mut config = config::RateLimitConfig::default();
        config.burst_allowance = 1;
        config.requests_per_second = 1;
        limiter.update_limits(VenueId::Kraken, config).unwrap();

        limiter.allow(VenueId::Kraken, "trades").unwrap();
        assert!(matches!(
            limiter.allow(VenueId::Kraken, "trades").unwrap_err(),
            RejectReason::VenueExhausted
        ));

        let snapshot = limiter.get_limits(VenueId::Kraken).unwrap();
        assert_eq!(snapshot.config.burst_allowance, 1);
        assert_eq!(snapshot.stats.total, 2);
        assert_eq!(snapshot.stats.admitted, 1);
    }

    #[test]
    fn record_request_tracks_completions_and_freshness() {
        let limiter = limiter_with(VenueId::Kraken, config::RateLimitConfig::default());

        let before = limiter.get_limits(VenueId::Kraken).unwrap();
        assert!(before.last_request_age_ms.is_none());
        assert!(before.completed.is_empty());

        limiter.allow(VenueId::Kraken, "klines").unwrap();
        limiter.record_request(VenueId::Kraken, "klines").unwrap();
        limiter.allow(VenueId::Kraken, "klines").unwrap();
        limiter.record_request(VenueId::Kraken, "klines").unwrap();
        limiter.allow(VenueId::Kraken, "trades").unwrap();
        limiter.record_request(VenueId::Kraken, "trades").unwrap();

        let snapshot = limiter.get_limits(VenueId::Kraken).unwrap();
        assert_eq!(snapshot.completed["klines"], 2);
        assert_eq!(snapshot.completed["trades"], 1);
        assert!(snapshot.last_request_age_ms.unwrap() < 1_000);

        assert!(matches!(
            limiter.record_request(VenueId::Okx, "klines").unwrap_err(),
            RejectReason::UnknownVenue
        ));
    }

    #[tokio::test]
    async fn acquire_waits_for_the_bucket() {
        let mut config = config::RateLimitConfig::default();
        config.requests_per_second = 50;
        config.burst_allowance = 1;
        let limiter = limiter_with(VenueId::Kraken, config);

        limiter.allow(VenueId::Kraken, "trades").unwrap();
        // Bucket refills at 50/s, so ~20ms until the next token.
        limiter
            .acquire(VenueId::Kraken, "trades", Duration::from_millis(500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn acquire_gives_up_after_budget() {
        let mut config = config::RateLimitConfig::default();
        config.requests_per_second = 1;
        config.burst_allowance = 1;
        let limiter = limiter_with(VenueId::Kraken, config);

        limiter.allow(VenueId::Kraken, "trades").unwrap();
        let err = limiter
            .acquire(VenueId::Kraken, "trades", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RejectReason::VenueExhausted));
    }
}
