//! In-process metrics for denials and cache behaviour.
//!
//! Counters are atomics keyed by sorted label sets and rendered in the
//! Prometheus text format on demand. Nothing is exported automatically.

pub mod metrics;

pub use metrics::{metrics, EngineMetrics};
