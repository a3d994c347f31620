//! tierscale-core — shared types for the tierscale autoscaler.
//!
//! Defines the data model exchanged between the metrics collector, the
//! decision engine and the webhook override, the TOML configuration
//! schema, and the error kinds every stage degrades through.
//!
//! # Layout
//!
//! ```text
//! config    AutoscalerConfig (TOML) + validation
//! duration  "30s" / "500ms" / "5m" parsing and serde adapter
//! error     ScaleError / ScaleResult
//! types     Tier, MetricSpec, NodeMetrics, ClusterMetrics,
//!           ScalingDecision, HistoryEntry, ZonePlan, QuorumState
//! ```

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{
    AutoscalerConfig, Arbitration, BehaviorConfig, CollectorConfig, EngineConfig, PolicyKind,
    QuorumConfig, ScalingRules, SelectPolicy, StepPolicy, TierConfig, TriggerPolicy,
    WebhookConfig, ZoneConfig,
};
pub use duration::parse_duration;
pub use error::{ScaleError, ScaleResult};
pub use types::*;
