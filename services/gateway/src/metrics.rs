//! Gateway-wide counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the facade's paths.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Stream deliveries handed to consumer callbacks
    pub stream_messages: AtomicU64,
    /// Pull requests answered (cache or upstream)
    pub pull_requests: AtomicU64,
    /// PIT snapshots written
    pub pit_snapshots: AtomicU64,
    /// Envelopes published to the bus
    pub bus_publishes: AtomicU64,
    /// Errors surfaced to callers
    pub errors: AtomicU64,
    /// Book resynchronizations performed
    pub resyncs: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Stream deliveries handed to consumer callbacks
    pub stream_messages: u64,
    /// Pull requests answered (cache or upstream)
    pub pull_requests: u64,
    /// PIT snapshots written
    pub pit_snapshots: u64,
    /// Envelopes published to the bus
    pub bus_publishes: u64,
    /// Errors surfaced to callers
    pub errors: u64,
    /// Book resynchronizations performed
    pub resyncs: u64,
}

impl GatewayMetrics {
    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters out.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stream_messages: self.stream_messages.load(Ordering::Relaxed),
            pull_requests: self.pull_requests.load(Ordering::Relaxed),
            pit_snapshots: self.pit_snapshots.load(Ordering::Relaxed),
            bus_publishes: self.bus_publishes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let metrics = GatewayMetrics::default();
        GatewayMetrics::bump(&metrics.stream_messages);
        GatewayMetrics::bump(&metrics.stream_messages);
        GatewayMetrics::bump(&metrics.errors);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stream_messages, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.pit_snapshots, 0);
    }
}
