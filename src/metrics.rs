use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

/// Lowest trackable latency (1µs)
const MIN_LATENCY_NS: u64 = 1_000;
/// Highest trackable latency (60s)
const MAX_LATENCY_NS: u64 = 60_000_000_000;

/// Publish acknowledgment latency histogram.
///
/// Each client owns one and records into it without locking; the pool merges
/// them once every client has finished.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    inner: Histogram<u64>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // 1µs to 60s with 3 significant figures; the bounds are constant and valid
        let inner = Histogram::new_with_bounds(MIN_LATENCY_NS, MAX_LATENCY_NS, 3)
            .expect("Failed to create HDR histogram");
        Self { inner }
    }

    pub fn record(&mut self, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.inner.saturating_record(ns.clamp(MIN_LATENCY_NS, MAX_LATENCY_NS));
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        // Same bounds on both sides, so the add cannot overflow the range
        let _ = self.inner.add(&other.inner);
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Percentile summary, `None` when nothing was recorded
    pub fn percentiles(&self) -> Option<LatencyPercentiles> {
        if self.is_empty() {
            return None;
        }
        let h = &self.inner;
        Some(LatencyPercentiles {
            count: self.len(),
            min_ms: ns_to_ms(h.min()),
            mean_ms: h.mean() / 1_000_000.0,
            p50_ms: ns_to_ms(h.value_at_percentile(50.0)),
            p95_ms: ns_to_ms(h.value_at_percentile(95.0)),
            p99_ms: ns_to_ms(h.value_at_percentile(99.0)),
            max_ms: ns_to_ms(h.max()),
        })
    }
}

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}
