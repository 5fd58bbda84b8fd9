use crate::snapshot::{LatencySummary, MetricsSnapshot, NodeMetrics, RequestMetrics};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Instant;

/// Decades covered by the histogram: 1us up to 100s.
const DECADES: usize = 8;
/// Nine bins per decade (leading digit 1-9) plus one overflow bin.
const NUM_HISTOGRAM_BINS: usize = DECADES * 9 + 1;

/// Lock-free latency histogram with logarithmic bins.
///
/// Each decade is split by leading digit, so the bin for 3_400us covers
/// 3_000-3_999us. Samples of 100s and above share the last bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    /// Running sum of all latencies for average calculation
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        let bin = Self::latency_to_bin(latency_us);
        self.bins[bin].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        let v = latency_us.max(1);
        let decade = v.ilog10() as usize;
        if decade >= DECADES {
            return NUM_HISTOGRAM_BINS - 1;
        }
        let leading = (v / 10u64.pow(decade as u32)) as usize;
        decade * 9 + (leading - 1)
    }

    /// `[lower, upper)` bounds of a bin in microseconds.
    fn bin_bounds(bin: usize) -> (u64, u64) {
        if bin >= NUM_HISTOGRAM_BINS - 1 {
            let lower = 10u64.pow(DECADES as u32);
            return (lower, lower * 10);
        }
        let decade = (bin / 9) as u32;
        let leading = (bin % 9) as u64 + 1;
        let unit = 10u64.pow(decade);
        (leading * unit, (leading + 1) * unit)
    }

    /// Estimates the latency at `percentile` (0-100), interpolating
    /// linearly inside the bin that holds it.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile) + 99) / 100;
        let target = target.max(1);
        let mut cumulative = 0;

        for (bin_idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if cumulative + count >= target {
                let (start, end) = Self::bin_bounds(bin_idx);
                let fraction = (target - cumulative) as f64 / count as f64;
                return start + ((end - start) as f64 * fraction) as u64 - 1;
            }
            cumulative += count;
        }

        Self::bin_bounds(NUM_HISTOGRAM_BINS - 1).1
    }

    fn summary(&self) -> LatencySummary {
        let samples = self.sample_count.load(Ordering::Relaxed);
        if samples == 0 {
            return LatencySummary::default();
        }

        LatencySummary {
            samples,
            avg_us: self.total_latency.load(Ordering::Relaxed) / samples,
            p50_us: self.estimate_percentile(50),
            p95_us: self.estimate_percentile(95),
            p99_us: self.estimate_percentile(99),
        }
    }
}

#[derive(Debug)]
struct NodeStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    latency: LatencyHistogram,
}

impl NodeStats {
    fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self, node_addr: &str) -> NodeMetrics {
        NodeMetrics {
            node_addr: node_addr.to_string(),
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            latency: self.latency.summary(),
        }
    }
}

/// Thread-safe metrics registry.
///
/// Counters are relaxed atomics: they are independent of each other and a
/// snapshot is a best-effort point-in-time view. The per-node and per-error
/// maps sit behind a `RwLock` that is written only when an entry is first
/// created; increments on existing entries take the read lock.
///
/// # Example
///
/// ```rust
/// use tessera_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_submitted();
/// registry.record_attempt("10.0.0.1:9042");
/// registry.record_attempt_outcome("10.0.0.1:9042", 850, true);
/// registry.record_success(900);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.requests.succeeded, 1);
/// assert_eq!(snapshot.nodes["10.0.0.1:9042"].attempts, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    ignored: AtomicU64,
    overall_timeouts: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    speculative_executions: AtomicU64,
    request_latency: LatencyHistogram,
    errors: StdRwLock<HashMap<String, Arc<AtomicU64>>>,
    nodes: StdRwLock<HashMap<String, Arc<NodeStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            overall_timeouts: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            speculative_executions: AtomicU64::new(0),
            request_latency: LatencyHistogram::new(),
            errors: StdRwLock::new(HashMap::new()),
            nodes: StdRwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, latency_us: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.request_latency.record(latency_us);
    }

    /// A request that completed with an empty result after an ignored error.
    pub fn record_ignored(&self, latency_us: u64) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
        self.record_success(latency_us);
    }

    /// A request that failed terminally with the given error kind.
    pub fn record_failure(&self, kind: &str, latency_us: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.request_latency.record(latency_us);
        self.error_counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overall_timeout(&self) {
        self.overall_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_speculative_execution(&self) {
        self.speculative_executions.fetch_add(1, Ordering::Relaxed);
    }

    /// An attempt sent to `node_addr`.
    pub fn record_attempt(&self, node_addr: &str) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.node_stats(node_addr).attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt_outcome(&self, node_addr: &str, latency_us: u64, success: bool) {
        let stats = self.node_stats(node_addr);
        if success {
            stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        stats.latency.record(latency_us);
    }

    /// Drops the entry of a node removed from the cluster.
    pub fn remove_node(&self, node_addr: &str) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_addr);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = RequestMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            overall_timeouts: self.overall_timeouts.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            speculative_executions: self.speculative_executions.load(Ordering::Relaxed),
            latency: self.request_latency.summary(),
        };

        let errors = self
            .errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(kind, count)| (kind.clone(), count.load(Ordering::Relaxed)))
            .collect();

        let nodes = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(addr, stats)| (addr.clone(), stats.snapshot(addr)))
            .collect();

        MetricsSnapshot {
            uptime_ms: self.uptime_ms(),
            requests,
            errors,
            nodes,
        }
    }

    fn node_stats(&self, node_addr: &str) -> Arc<NodeStats> {
        if let Some(stats) = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_addr)
        {
            return stats.clone();
        }
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node_addr.to_string())
            .or_insert_with(|| Arc::new(NodeStats::new()))
            .clone()
    }

    fn error_counter(&self, kind: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self
            .errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
        {
            return counter.clone();
        }
        self.errors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
