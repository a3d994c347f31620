//! tierscale-metrics — live metrics for the autoscaler.
//!
//! Fetches per-tier metrics from cluster members and Prometheus, protects
//! each source with a circuit breaker, normalizes readings against the
//! configured targets, and exposes scaling activity for scraping.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector::collect(cluster)
//!   ├── single-flight + TTL cache per cluster
//!   ├── SourceResolver → [MemberProbe, PrometheusQuery, ...]
//!   ├── bounded worker pool, per-source timeout
//!   ├── CircuitBreaker per source
//!   └── aggregate → ClusterMetrics (degraded on partial failure)
//!
//! normalize(specs, NodeMetrics) → ratios → composite_score()
//!
//! ScalingRecorder
//!   └── PrometheusRecorder::render() → text/plain exposition
//! ```

pub mod breaker;
pub mod cancel;
pub mod collector;
pub mod http;
pub mod normalize;
pub mod recorder;
pub mod source;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cancel::Cancellation;
pub use collector::{MetricsCollector, TierSpecs};
pub use normalize::{composite_score, normalize, parse_target, MetricRatio, Normalized, Target, TargetForm};
pub use recorder::{NoopRecorder, PrometheusRecorder, ScalingRecorder, ValidationOutcome};
pub use source::{BoxFuture, HttpSourceResolver, MemberProbe, MetricSource, PrometheusQuery, SourceReading, SourceResolver};
