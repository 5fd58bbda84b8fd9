//! Tessera Metrics Collection
//!
//! Thread-safe counters and latency histograms for the request engine.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free counters for requests, attempts, retries
//!   and speculative executions, plus per-node and per-error-kind entries
//! - [`MetricsSnapshot`]: serializable point-in-time copy of the registry
//!
//! A session owns one registry and hands it to its orchestrator; nothing is
//! global.
//!
//! # Usage Example
//!
//! ```rust
//! use tessera_metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new();
//! registry.record_submitted();
//! registry.record_retry();
//! registry.record_failure("NoNodeAvailable", 1_200);
//!
//! let snapshot = registry.snapshot();
//! assert_eq!(snapshot.requests.failed, 1);
//! assert_eq!(snapshot.errors["NoNodeAvailable"], 1);
//! ```

mod registry;
mod snapshot;

pub use registry::MetricsRegistry;
pub use snapshot::{LatencySummary, MetricsSnapshot, NodeMetrics, RequestMetrics};
