//! EventQL RPC Dispatcher Metrics
//!
//! Lock-free counters describing what a fan-out dispatcher is doing: task
//! admission and completion, failovers, connection churn, pool reuse and
//! timeouts, plus per-host connection gauges with their high-water marks.
//!
//! # Components
//!
//! - [`DispatchMetrics`]: Atomic counters updated by the dispatcher
//! - [`MetricsSnapshot`]: Serializable point-in-time copy
//!
//! # Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//! use evqlrpc_metrics::DispatchMetrics;
//!
//! let metrics = Arc::new(DispatchMetrics::new());
//! metrics.task_enqueued();
//!
//! // any thread holding the Arc can observe the dispatcher
//! let snapshot = metrics.snapshot();
//! println!("{}", snapshot.to_json().unwrap());
//! ```
//!
//! # Thread Safety
//!
//! Counters use relaxed atomics. Peaks are maintained with `fetch_max`, so a
//! peak never under-reports even when read concurrently with updates.

mod registry;
mod snapshot;

pub use registry::DispatchMetrics;
pub use snapshot::{HostMetrics, LatencySummary, MetricsSnapshot};
