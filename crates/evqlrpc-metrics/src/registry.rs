use crate::snapshot::{HostMetrics, LatencySummary, MetricsSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

const NUM_HISTOGRAM_BINS: usize = 64;

/// Power-of-two latency histogram.
///
/// Bin `i` counts samples in `[2^(i-1), 2^i)` microseconds (bin 0 holds zero).
/// Percentiles report the upper bound of the bin that contains them, so they
/// are accurate to within a factor of two. Recording is a single atomic add.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
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
        self.bins[Self::latency_to_bin(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        let bits = (u64::BITS - latency_us.leading_zeros()) as usize;
        bits.min(NUM_HISTOGRAM_BINS - 1)
    }

    fn bin_upper_bound(bin: usize) -> u64 {
        if bin == 0 {
            0
        } else {
            1u64.checked_shl(bin as u32).map_or(u64::MAX, |v| v - 1)
        }
    }

    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        // rank of the sample we are looking for, 1-based
        let target = ((total * percentile) / 100).max(1);
        let mut cumulative = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return Self::bin_upper_bound(bin);
            }
        }
        Self::bin_upper_bound(NUM_HISTOGRAM_BINS - 1)
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

/// Per-host counters.
#[derive(Debug, Default)]
struct HostStats {
    open_connections: AtomicU64,
    peak_open_connections: AtomicU64,
    tasks_started: AtomicU64,
    failures: AtomicU64,
}

impl HostStats {
    fn snapshot(&self, host: &str) -> HostMetrics {
        HostMetrics {
            host: host.to_string(),
            open_connections: self.open_connections.load(Ordering::Relaxed),
            peak_open_connections: self.peak_open_connections.load(Ordering::Relaxed),
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing dispatcher activity.
///
/// The dispatcher owns the only writer; observers hold an `Arc` and call
/// [`snapshot`](DispatchMetrics::snapshot) from any thread. Global counters are
/// lock-free atomics with relaxed ordering, so a snapshot taken while a batch
/// is running may be a few events behind. The per-host table is guarded by an
/// `RwLock` that is only written when a host is seen for the first time.
///
/// # Example
///
/// ```rust
/// use evqlrpc_metrics::DispatchMetrics;
///
/// let metrics = DispatchMetrics::new();
/// metrics.task_enqueued();
/// metrics.connection_opened("node-a");
/// metrics.task_started("node-a", 1);
/// metrics.task_succeeded(250);
///
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.tasks_succeeded, 1);
/// assert_eq!(snapshot.hosts["node-a"].peak_open_connections, 1);
/// ```
#[derive(Debug)]
pub struct DispatchMetrics {
    tasks_enqueued: AtomicU64,
    tasks_started: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_running: AtomicU64,
    peak_tasks_running: AtomicU64,
    failovers: AtomicU64,
    connections_opened: AtomicU64,
    connections_reused: AtomicU64,
    connections_closed: AtomicU64,
    connections_pooled: AtomicU64,
    timeouts: AtomicU64,
    task_latency: LatencyHistogram,
    hosts: RwLock<HashMap<String, Arc<HostStats>>>,
    start_time: Instant,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            tasks_enqueued: AtomicU64::new(0),
            tasks_started: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_running: AtomicU64::new(0),
            peak_tasks_running: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_reused: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_pooled: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            task_latency: LatencyHistogram::new(),
            hosts: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    fn host(&self, host: &str) -> Arc<HostStats> {
        if let Some(stats) = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
        {
            return stats.clone();
        }

        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    pub fn task_enqueued(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// A task was bound to a connection to `host`. `running` is the number of
    /// tasks in flight after the start.
    pub fn task_started(&self, host: &str, running: u64) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
        self.set_running(running);
        self.host(host).tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: u64) {
        self.tasks_running.store(running, Ordering::Relaxed);
        self.peak_tasks_running.fetch_max(running, Ordering::Relaxed);
    }

    pub fn task_succeeded(&self, latency_us: u64) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.task_latency.record(latency_us);
    }

    pub fn task_failed(&self, latency_us: u64) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.task_latency.record(latency_us);
    }

    /// An attempt against `host` failed and the task moved on.
    pub fn failover(&self, host: &str) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
        self.host_failed(host);
    }

    /// An attempt against `host` failed, whether or not another host follows.
    pub fn host_failed(&self, host: &str) {
        self.host(host).failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A new connection to `host` started counting against its limit.
    pub fn connection_opened(&self, host: &str) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.connection_acquired(host);
    }

    /// A pooled connection to `host` was taken back into service.
    pub fn connection_reused(&self, host: &str) {
        self.connections_reused.fetch_add(1, Ordering::Relaxed);
        self.connection_acquired(host);
    }

    fn connection_acquired(&self, host: &str) {
        let stats = self.host(host);
        let open = stats.open_connections.fetch_add(1, Ordering::Relaxed) + 1;
        stats.peak_open_connections.fetch_max(open, Ordering::Relaxed);
    }

    /// A connection to `host` stopped counting against its limit.
    pub fn connection_released(&self, host: &str) {
        let stats = self.host(host);
        // saturate so a stray release can never wrap the gauge
        let _ = stats
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_pooled(&self) {
        self.connections_pooled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hosts = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(host, stats)| (host.clone(), stats.snapshot(host)))
            .collect();

        MetricsSnapshot {
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_running: self.tasks_running.load(Ordering::Relaxed),
            peak_tasks_running: self.peak_tasks_running.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_reused: self.connections_reused.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_pooled: self.connections_pooled.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            task_latency: self.task_latency.summary(),
            hosts,
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
