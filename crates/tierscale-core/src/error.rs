//! Error kinds for the autoscaling pipeline.
//!
//! None of these stall a reconciliation: each stage maps its error to the
//! safe default of "no change" and records the reason on the decision.

use std::time::Duration;

use thiserror::Error;

use crate::types::Tier;

/// Result type alias for autoscaler operations.
pub type ScaleResult<T> = Result<T, ScaleError>;

/// Errors raised while collecting metrics or computing a decision.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScaleError {
    #[error("metrics unavailable for {tier}: every source failed")]
    MetricsUnavailable { tier: Tier },

    #[error("invalid target {raw:?} for metric {metric}")]
    InvalidMetricTarget { metric: String, raw: String },

    #[error("quorum veto: {0}")]
    QuorumVeto(String),

    #[error("webhook timed out after {0:?}")]
    WebhookTimeout(Duration),

    #[error("webhook error: {0}")]
    Webhook(String),

    #[error("zone plan infeasible: {0}")]
    ZonePlanInfeasible(String),

    #[error("source {source_id} failed: {reason}")]
    SourceFailed { source_id: String, reason: String },

    #[error("circuit open for source {0}")]
    CircuitOpen(String),

    #[error("reconciliation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ScaleError {
    /// Build a `SourceFailed` from any displayable error.
    pub fn source_failed(source_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ScaleError::SourceFailed {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }
}
