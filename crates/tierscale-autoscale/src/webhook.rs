//! Webhook override — an external algorithm proposing its own targets.
//!
//! The webhook is advisory. Any failure (timeout, transport, status,
//! malformed body) falls back to the internal decision.

use http::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tierscale_core::{
    Arbitration, ClusterMetrics, ClusterRef, ScaleError, ScaleResult, ScalingAction, ScalingDecision, Tier,
    TierReplicas, WebhookConfig,
};
use tierscale_metrics::http::{self as client, HttpError};

#[derive(Debug, Serialize)]
struct WebhookRequest<'a> {
    cluster: &'a str,
    namespace: &'a str,
    metrics: &'a ClusterMetrics,
    current_replicas: TierReplicas,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookTargets {
    #[serde(default)]
    pub primaries: Option<u32>,
    #[serde(default)]
    pub secondaries: Option<u32>,
}

/// Parsed and range-checked webhook answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub action: ScalingAction,
    #[serde(default)]
    pub target_replicas: WebhookTargets,
    #[serde(default)]
    pub reason: String,
    pub confidence: f64,
}

impl WebhookResponse {
    /// The webhook's proposal for one tier, if it named a target for it.
    pub fn proposal(&self, tier: Tier, current: u32, now_ms: u64) -> Option<ScalingDecision> {
        let target = match tier {
            Tier::Primaries => self.target_replicas.primaries,
            Tier::Secondaries => self.target_replicas.secondaries,
        }?;
        let reason = if self.reason.is_empty() {
            "webhook proposal".to_string()
        } else {
            format!("webhook: {}", self.reason)
        };
        Some(ScalingDecision {
            action: ScalingAction::between(current, target),
            target_replicas: target,
            reason,
            confidence: self.confidence,
            timestamp: now_ms,
        })
    }
}

pub struct WebhookClient {
    config: WebhookConfig,
    method: Method,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> ScaleResult<Self> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ScaleError::Config(format!("webhook: invalid method {}", config.method)))?;
        Ok(Self { config, method })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Ask the webhook for a decision. Bounded by the configured timeout.
    pub async fn propose(
        &self,
        cluster: &ClusterRef,
        metrics: &ClusterMetrics,
        current: TierReplicas,
    ) -> ScaleResult<WebhookResponse> {
        let body = serde_json::to_vec(&WebhookRequest {
            cluster: &cluster.name,
            namespace: &cluster.namespace,
            metrics,
            current_replicas: current,
        })
        .map_err(|e| ScaleError::Webhook(format!("encode request: {e}")))?;

        let resp = client::send(self.method.clone(), &self.config.url, Some(body), self.config.timeout)
            .await
            .map_err(|e| match e {
                HttpError::Timeout(d) => ScaleError::WebhookTimeout(d),
                other => ScaleError::Webhook(other.to_string()),
            })?;

        if !resp.is_success() {
            return Err(ScaleError::Webhook(format!("status {}", resp.status)));
        }

        let parsed: WebhookResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| ScaleError::Webhook(format!("malformed response: {e}")))?;

        if !(parsed.confidence.is_finite() && (0.0..=1.0).contains(&parsed.confidence)) {
            return Err(ScaleError::Webhook(format!(
                "confidence {} outside [0, 1]",
                parsed.confidence
            )));
        }

        debug!(
            cluster = %cluster.key(),
            action = %parsed.action,
            confidence = parsed.confidence,
            "webhook answered"
        );
        Ok(parsed)
    }
}

/// Which proposal a tier acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Internal,
    Webhook,
}

/// Pick between the engine's proposal and the webhook's.
pub fn arbitrate(mode: Arbitration, internal: &ScalingDecision, webhook: Option<&ScalingDecision>) -> DecisionSource {
    let Some(webhook) = webhook else {
        return DecisionSource::Internal;
    };
    let adopt = match mode {
        Arbitration::HigherConfidence => webhook.confidence > internal.confidence,
        Arbitration::PreferWebhook => true,
        Arbitration::InternalOnly => false,
    };
    if adopt {
        DecisionSource::Webhook
    } else {
        DecisionSource::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(target: u32, confidence: f64) -> ScalingDecision {
        ScalingDecision {
            action: ScalingAction::ScaleUp,
            target_replicas: target,
            reason: String::new(),
            confidence,
            timestamp: 0,
        }
    }

    #[test]
    fn higher_confidence_wins() {
        let internal = decision(5, 0.4);
        assert_eq!(
            arbitrate(Arbitration::HigherConfidence, &internal, Some(&decision(6, 0.9))),
            DecisionSource::Webhook
        );
        assert_eq!(
            arbitrate(Arbitration::HigherConfidence, &internal, Some(&decision(6, 0.4))),
            DecisionSource::Internal
        );
        assert_eq!(
            arbitrate(Arbitration::HigherConfidence, &internal, None),
            DecisionSource::Internal
        );
    }

    #[test]
    fn modes_override_confidence() {
        let internal = decision(5, 0.9);
        let webhook = decision(6, 0.1);
        assert_eq!(arbitrate(Arbitration::PreferWebhook, &internal, Some(&webhook)), DecisionSource::Webhook);
        assert_eq!(
            arbitrate(Arbitration::InternalOnly, &decision(5, 0.0), Some(&decision(6, 1.0))),
            DecisionSource::Internal
        );
    }

    #[test]
    fn response_parses_partial_targets() {
        let resp: WebhookResponse = serde_json::from_str(
            r#"{"action":"scale_up","target_replicas":{"secondaries":6},"reason":"read burst","confidence":0.9}"#,
        )
        .unwrap();
        assert_eq!(resp.target_replicas.primaries, None);
        let p = resp.proposal(Tier::Secondaries, 4, 10).unwrap();
        assert_eq!(p.target_replicas, 6);
        assert_eq!(p.action, ScalingAction::ScaleUp);
        assert_eq!(p.reason, "webhook: read burst");
        assert!(resp.proposal(Tier::Primaries, 3, 10).is_none());
    }

    #[test]
    fn none_action_parses() {
        let resp: WebhookResponse =
            serde_json::from_str(r#"{"action":"none","confidence":0.2}"#).unwrap();
        assert_eq!(resp.action, ScalingAction::NoChange);
    }

    #[test]
    fn invalid_method_rejected() {
        let config = WebhookConfig {
            url: "http://127.0.0.1:1/decide".to_string(),
            method: "PO ST".to_string(),
            timeout: std::time::Duration::from_secs(1),
            enabled: true,
        };
        assert!(matches!(WebhookClient::new(config), Err(ScaleError::Config(_))));
    }
}
