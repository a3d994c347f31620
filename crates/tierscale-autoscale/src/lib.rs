//! tierscale-autoscale — scaling decisions for a clustered database.
//!
//! Primaries carry quorum, so their count stays odd and never drops below
//! the healthy floor. Secondaries are read replicas spread across zones.
//! Both tiers are scored from live metrics, held back by cooldown and
//! behavior policies, and optionally overridden by an external webhook.
//!
//! # Pipeline
//!
//! ```text
//! MetricsCollector::collect()
//!   └── DecisionEngine::decide() per tier
//!         composite = Σ(ratio × weight) / Σ(weight)
//!         up:   any ratio > 1 + tolerance
//!         down: every ratio < 1 - tolerance
//!         raw target = ceil(current × worst ratio), clamped to bounds
//!
//! WebhookClient::propose() → arbitrate(internal, webhook)
//!
//! primaries:   QuorumGuard → behavior::clamp → QuorumGuard
//! secondaries: behavior::clamp → ZonePlanner::plan
//!
//! → ScalingDecision per tier, appended to history
//! ```
//!
//! Nothing here changes the cluster. The caller applies the decisions.

pub mod autoscaler;
pub mod behavior;
pub mod engine;
pub mod history;
pub mod quorum;
pub mod webhook;
pub mod zones;

pub use autoscaler::{Autoscaler, LiveState, ReconcileOutcome, TierOutcome};
pub use engine::DecisionEngine;
pub use history::{ClusterHistory, History, HistoryStore};
pub use quorum::{GuardOutcome, QuorumGuard};
pub use webhook::{arbitrate, DecisionSource, WebhookClient, WebhookResponse, WebhookTargets};
pub use zones::{PlanOutcome, ZonePlanner};
