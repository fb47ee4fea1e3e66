use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Task latency summary, enqueue to completion, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Counters for a single remote host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub host: String,
    /// Connections currently counted against the host's concurrency limit.
    pub open_connections: u64,
    /// Highest value `open_connections` ever reached.
    pub peak_open_connections: u64,
    pub tasks_started: u64,
    pub failures: u64,
}

impl HostMetrics {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }
}

/// Point-in-time copy of all dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_enqueued: u64,
    /// Attempts started, so a task that failed over counts once per host tried.
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_running: u64,
    pub peak_tasks_running: u64,
    pub failovers: u64,
    pub connections_opened: u64,
    pub connections_reused: u64,
    pub connections_closed: u64,
    pub connections_pooled: u64,
    pub timeouts: u64,
    pub uptime_ms: u64,
    pub task_latency: LatencySummary,
    pub hosts: HashMap<String, HostMetrics>,
}

impl MetricsSnapshot {
    /// Tasks that reached a terminal state.
    pub fn tasks_complete(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed
    }

    /// Highest per-host connection count across all hosts.
    pub fn max_host_peak(&self) -> u64 {
        self.hosts
            .values()
            .map(|h| h.peak_open_connections)
            .max()
            .unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
