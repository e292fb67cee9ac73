//! Per-venue source attribution
//!
//! Records which data kinds a venue has actually produced, how the cache
//! behaved for it, and how fresh its data is. Mutated only by the facade
//! under the venue's map entry; consumers get cloned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use types::{DataKind, VenueId};

/// EMA coefficient for per-venue fetch latency.
const LATENCY_ALPHA: f64 = 0.2;

/// Attribution record for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAttribution {
    /// The venue this record describes
    pub venue: VenueId,
    /// Last delivery or fetch involving this venue
    pub last_update: Option<DateTime<Utc>>,
    /// Data kinds observed from this venue
    pub sources: BTreeSet<DataKind>,
    /// Pull requests answered from cache
    pub cache_hits: u64,
    /// Pull requests that went upstream
    pub cache_misses: u64,
    /// EMA fetch latency, milliseconds
    pub latency_ema_ms: f64,
}

impl SourceAttribution {
    /// Empty record for a venue.
    pub fn new(venue: VenueId) -> Self {
        Self {
            venue,
            last_update: None,
            sources: BTreeSet::new(),
            cache_hits: 0,
            cache_misses: 0,
            latency_ema_ms: 0.0,
        }
    }

    /// Record a delivery of `kind`, optionally through the cache.
    pub fn record(&mut self, kind: DataKind, cache_hit: Option<bool>, latency_ms: Option<f64>) {
        self.last_update = Some(Utc::now());
        self.sources.insert(kind);
        match cache_hit {
            Some(true) => self.cache_hits += 1,
            Some(false) => self.cache_misses += 1,
            None => {}
        }
        if let Some(latency) = latency_ms {
            if self.latency_ema_ms == 0.0 {
                self.latency_ema_ms = latency;
            } else {
                self.latency_ema_ms =
                    LATENCY_ALPHA * latency + (1.0 - LATENCY_ALPHA) * self.latency_ema_ms;
            }
        }
    }

    /// Cache hit share of all pull requests.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
