//! Autoscaler — one reconciliation cycle per call.
//!
//! Collects metrics, runs the decision engine for both tiers, consults
//! the webhook, then pushes each tier through its safety stages:
//!
//! ```text
//! primaries:   proposal → quorum guard → behavior clamp → quorum guard
//! secondaries: proposal → behavior clamp → bounds → zone planner
//! ```
//!
//! The final decisions are appended to the cluster's history and reported
//! to the recorder. The actual replica change is left to the caller.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use tierscale_core::{
    AutoscalerConfig, ClusterKey, ClusterRef, HistoryEntry, QuorumState, ScaleError, ScaleResult,
    ScalingAction, ScalingDecision, Tier, TierConfig, TierReplicas, ZonePlan,
};
use tierscale_metrics::{
    Cancellation, MetricsCollector, NoopRecorder, ScalingRecorder, TierSpecs, ValidationOutcome,
};

use crate::behavior;
use crate::engine::DecisionEngine;
use crate::history::{ClusterHistory, History, HistoryStore};
use crate::quorum::{GuardOutcome, QuorumGuard};
use crate::webhook::{arbitrate, DecisionSource, WebhookClient, WebhookResponse};
use crate::zones::ZonePlanner;

/// Live cluster state supplied by the orchestrator for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveState {
    pub replicas: TierReplicas,
    pub healthy_primaries: u32,
}

/// Everything decided for one tier in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TierOutcome {
    pub tier: Tier,
    /// What the executor should apply.
    pub decision: ScalingDecision,
    /// The engine's own proposal, before any safety stage.
    pub internal: ScalingDecision,
    /// The webhook's proposal for this tier, when it gave one.
    pub webhook: Option<ScalingDecision>,
    pub source: DecisionSource,
    /// Primaries only.
    pub validation: Option<ValidationOutcome>,
    /// Secondaries with zone-aware config only.
    pub zone_plan: Option<ZonePlan>,
}

impl TierOutcome {
    fn hold(tier: Tier, current: u32, reason: &str, now_ms: u64) -> Self {
        let decision = ScalingDecision::hold(current, reason, now_ms);
        Self {
            tier,
            internal: decision.clone(),
            decision,
            webhook: None,
            source: DecisionSource::Internal,
            validation: None,
            zone_plan: None,
        }
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub cluster: ClusterKey,
    pub primaries: TierOutcome,
    pub secondaries: TierOutcome,
    /// Some metric source failed; decisions used partial data.
    pub degraded: bool,
    /// The cycle was cancelled; nothing was recorded.
    pub cancelled: bool,
}

impl ReconcileOutcome {
    pub fn tier(&self, tier: Tier) -> &TierOutcome {
        match tier {
            Tier::Primaries => &self.primaries,
            Tier::Secondaries => &self.secondaries,
        }
    }

    fn hold(cluster: ClusterKey, live: LiveState, reason: &str, now_ms: u64) -> Self {
        Self {
            cluster,
            primaries: TierOutcome::hold(Tier::Primaries, live.replicas.primaries, reason, now_ms),
            secondaries: TierOutcome::hold(Tier::Secondaries, live.replicas.secondaries, reason, now_ms),
            degraded: false,
            cancelled: false,
        }
    }
}

/// The autoscaler evaluates cluster metrics and decides how each tier
/// should scale. Construct once and share across reconciliations.
pub struct Autoscaler {
    config: AutoscalerConfig,
    engine: DecisionEngine,
    collector: Arc<MetricsCollector>,
    webhook: Option<WebhookClient>,
    recorder: Arc<dyn ScalingRecorder>,
    histories: HistoryStore,
}

impl Autoscaler {
    /// Create an autoscaler collecting over HTTP. Rejects invalid config.
    pub fn new(config: AutoscalerConfig) -> ScaleResult<Self> {
        config.validate()?;
        let webhook = config.webhook.clone().map(WebhookClient::new).transpose()?;
        Ok(Self {
            engine: DecisionEngine::new(config.engine.clone()),
            collector: Arc::new(MetricsCollector::with_http_sources(config.collector.clone())),
            webhook,
            recorder: Arc::new(NoopRecorder),
            histories: HistoryStore::new(config.engine.history_capacity),
            config,
        })
    }

    /// Use a specific collector (e.g. one shared with other components).
    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// Set the sink for scaling metrics.
    pub fn with_recorder(mut self, recorder: Arc<dyn ScalingRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn config(&self) -> &AutoscalerConfig {
        &self.config
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    /// Copy of a cluster's decision history.
    pub async fn history(&self, cluster: &str) -> Option<ClusterHistory> {
        self.histories.snapshot(cluster).await
    }

    /// Run one cycle at the current wall-clock time.
    pub async fn reconcile(&self, cluster: &ClusterRef, live: LiveState, cancel: &Cancellation) -> ReconcileOutcome {
        self.reconcile_at(cluster, live, cancel, epoch_millis()).await
    }

    /// Run one cycle as of `now_ms` (Unix milliseconds).
    pub async fn reconcile_at(
        &self,
        cluster: &ClusterRef,
        live: LiveState,
        cancel: &Cancellation,
        now_ms: u64,
    ) -> ReconcileOutcome {
        let key = cluster.key();
        if cancel.is_cancelled() {
            return cancelled(key, live, now_ms);
        }
        let mut waiter = cancel.clone();

        let mut history = tokio::select! {
            biased;
            _ = waiter.cancelled() => return cancelled(key.clone(), live, now_ms),
            guard = self.histories.lock(&key) => guard,
        };

        let specs = TierSpecs {
            primaries: &self.config.primaries.metrics,
            secondaries: &self.config.secondaries.metrics,
        };
        let metrics = match self.collector.collect(cluster, specs, cancel).await {
            Ok(metrics) => metrics,
            Err(ScaleError::Cancelled) => return cancelled(key, live, now_ms),
            Err(e) => {
                warn!(cluster = %key, error = %e, "metrics unavailable, holding both tiers");
                let outcome = ReconcileOutcome::hold(key, live, &e.to_string(), now_ms);
                self.commit(&mut history, &outcome, live, now_ms);
                return outcome;
            }
        };

        let internal = Tier::ALL.map(|tier| {
            self.engine.decide(
                tier,
                self.config.tier(tier),
                live.replicas.get(tier),
                metrics.tier(tier),
                history.tier(tier),
                now_ms,
            )
        });
        let cooling = Tier::ALL.map(|tier| self.engine.cooldown_remaining(history.tier(tier), now_ms).is_some());

        let response = match &self.webhook {
            Some(client) if client.enabled() && cooling.contains(&false) => {
                tokio::select! {
                    biased;
                    _ = waiter.cancelled() => return cancelled(key.clone(), live, now_ms),
                    result = client.propose(cluster, &metrics, live.replicas) => match result {
                        Ok(response) => Some(response),
                        Err(e) => {
                            warn!(cluster = %key, error = %e, "webhook failed, falling back to internal decision");
                            None
                        }
                    },
                }
            }
            _ => None,
        };

        let [internal_p, internal_s] = internal;
        let primaries = self.finish_primaries(
            live,
            internal_p,
            proposal(&response, Tier::Primaries, live, now_ms),
            cooling[0],
            history.tier(Tier::Primaries),
            now_ms,
        );
        let secondaries = self.finish_secondaries(
            live,
            internal_s,
            proposal(&response, Tier::Secondaries, live, now_ms),
            cooling[1],
            history.tier(Tier::Secondaries),
            now_ms,
        );

        let outcome = ReconcileOutcome {
            cluster: key,
            primaries,
            secondaries,
            degraded: metrics.degraded,
            cancelled: false,
        };
        self.commit(&mut history, &outcome, live, now_ms);
        outcome
    }

    /// Pick the proposal a tier acts on and keep it within bounds.
    fn choose(
        &self,
        tier_config: &TierConfig,
        current: u32,
        internal: &ScalingDecision,
        webhook: Option<&ScalingDecision>,
        cooling: bool,
    ) -> (ScalingDecision, DecisionSource) {
        let source = if cooling {
            DecisionSource::Internal
        } else {
            arbitrate(self.config.engine.arbitration, internal, webhook)
        };
        match (source, webhook) {
            (DecisionSource::Webhook, Some(proposal)) => {
                let mut chosen = proposal.clone();
                let bounded = tier_config.clamp(chosen.target_replicas);
                if bounded != chosen.target_replicas {
                    chosen.reason.push_str(&format!(
                        "; webhook target {} clamped to [{}, {}]",
                        chosen.target_replicas, tier_config.min_replicas, tier_config.max_replicas
                    ));
                    chosen.target_replicas = bounded;
                }
                chosen.action = ScalingAction::between(current, bounded);
                (chosen, DecisionSource::Webhook)
            }
            _ => (internal.clone(), DecisionSource::Internal),
        }
    }

    fn finish_primaries(
        &self,
        live: LiveState,
        internal: ScalingDecision,
        webhook: Option<ScalingDecision>,
        cooling: bool,
        history: &History,
        now_ms: u64,
    ) -> TierOutcome {
        let tier_config = &self.config.primaries;
        let current = live.replicas.primaries;
        let (chosen, source) = self.choose(tier_config, current, &internal, webhook.as_ref(), cooling);

        let quorum = &self.config.quorum;
        let guard = QuorumGuard::new(tier_config, quorum.min_healthy_primaries);
        let state = QuorumState {
            current_healthy_primaries: live.healthy_primaries,
            min_healthy_primaries: quorum.min_healthy_primaries,
            allow_quorum_break: quorum.allow_quorum_break,
        };

        let mut notes = Vec::new();

        // A cooling tier holds as-is; parity repair waits for the next cycle.
        if cooling {
            if current % 2 == 0 {
                notes.push(format!("primaries count {current} is even, repaired after cooldown"));
            }
            return TierOutcome {
                tier: Tier::Primaries,
                decision: finalize(current, &chosen, current, notes, now_ms),
                internal,
                webhook,
                source,
                validation: None,
                zone_plan: None,
            };
        }

        let first = guard.guard(current, chosen.target_replicas, &state);
        notes.extend(first.reason.clone());
        if first.vetoed {
            warn!(current, candidate = chosen.target_replicas, "primaries scale-down vetoed by quorum guard");
            return TierOutcome {
                tier: Tier::Primaries,
                decision: finalize(current, &chosen, current, notes, now_ms),
                internal,
                webhook,
                source,
                validation: Some(ValidationOutcome::Vetoed),
                zone_plan: None,
            };
        }

        let requested = i64::from(first.allowed) - i64::from(current);
        let clamped = behavior::clamp(requested, current, &tier_config.behavior, history, now_ms);
        let limited = clamped.delta != requested;
        notes.extend(clamped.reason);
        let stepped = step(current, clamped.delta);

        // Step limits can land on an even count; normalize again.
        let second = guard.guard(current, stepped, &state);
        if second.allowed != stepped {
            if limited {
                notes.push(format!(
                    "odd primaries count overrides behavior limit: {stepped} -> {}",
                    second.allowed
                ));
            } else {
                notes.extend(second.reason.clone());
            }
        }

        let validation = combine(&first, &second);
        if validation == ValidationOutcome::Vetoed {
            warn!(current, candidate = stepped, "primaries scale-down vetoed by quorum guard");
        }

        TierOutcome {
            tier: Tier::Primaries,
            decision: finalize(current, &chosen, second.allowed, notes, now_ms),
            internal,
            webhook,
            source,
            validation: Some(validation),
            zone_plan: None,
        }
    }

    fn finish_secondaries(
        &self,
        live: LiveState,
        internal: ScalingDecision,
        webhook: Option<ScalingDecision>,
        cooling: bool,
        history: &History,
        now_ms: u64,
    ) -> TierOutcome {
        let tier_config = &self.config.secondaries;
        let current = live.replicas.secondaries;
        let (chosen, source) = self.choose(tier_config, current, &internal, webhook.as_ref(), cooling);

        let mut notes = Vec::new();
        let clamped = behavior::clamp(
            i64::from(chosen.target_replicas) - i64::from(current),
            current,
            &tier_config.behavior,
            history,
            now_ms,
        );
        notes.extend(clamped.reason);
        let target = tier_config.clamp(step(current, clamped.delta));

        let zone_plan = self.config.zones.as_ref().map(|zones| {
            let outcome = ZonePlanner::from_config(zones).plan(target);
            notes.extend(outcome.notes.iter().map(ToString::to_string));
            outcome.plan
        });

        TierOutcome {
            tier: Tier::Secondaries,
            decision: finalize(current, &chosen, target, notes, now_ms),
            internal,
            webhook,
            source,
            validation: None,
            zone_plan,
        }
    }

    /// Append final decisions to history and report them.
    fn commit(&self, history: &mut ClusterHistory, outcome: &ReconcileOutcome, live: LiveState, now_ms: u64) {
        let retention = self.retention();
        let cluster = outcome.cluster.as_str();

        for tier in Tier::ALL {
            let t = outcome.tier(tier);
            let current = live.replicas.get(tier);
            let h = history.tier_mut(tier);
            h.push(HistoryEntry::from_decision(current, &t.decision));
            h.prune(now_ms, retention);

            self.recorder
                .record_decision(cluster, tier, t.decision.action, t.decision.confidence);
            self.recorder.set_replicas(cluster, tier, t.decision.target_replicas);
            if let Some(validation) = t.validation {
                self.recorder.record_validation(cluster, validation);
            }

            if t.decision.is_change() {
                info!(
                    %cluster,
                    %tier,
                    from = current,
                    to = t.decision.target_replicas,
                    action = %t.decision.action,
                    source = ?t.source,
                    confidence = t.decision.confidence,
                    reason = %t.decision.reason,
                    "scaling decision"
                );
            } else {
                debug!(%cluster, %tier, replicas = current, reason = %t.decision.reason, "holding");
            }
        }
    }

    /// Oldest history any rule can still look at.
    fn retention(&self) -> Duration {
        let mut longest = self.config.engine.cooldown;
        for tier in Tier::ALL {
            let behavior = &self.config.tier(tier).behavior;
            for rules in [&behavior.scale_up, &behavior.scale_down] {
                longest = longest.max(rules.stabilization_window);
                for policy in &rules.policies {
                    longest = longest.max(policy.period);
                }
            }
        }
        longest
    }
}

fn proposal(
    response: &Option<WebhookResponse>,
    tier: Tier,
    live: LiveState,
    now_ms: u64,
) -> Option<ScalingDecision> {
    response
        .as_ref()
        .and_then(|r| r.proposal(tier, live.replicas.get(tier), now_ms))
}

fn cancelled(cluster: ClusterKey, live: LiveState, now_ms: u64) -> ReconcileOutcome {
    debug!(%cluster, "reconcile cancelled, holding");
    let mut outcome = ReconcileOutcome::hold(cluster, live, &ScaleError::Cancelled.to_string(), now_ms);
    outcome.cancelled = true;
    outcome
}

fn step(current: u32, delta: i64) -> u32 {
    u32::try_from(i64::from(current) + delta).unwrap_or(current)
}

fn combine(first: &GuardOutcome, second: &GuardOutcome) -> ValidationOutcome {
    let outcomes = [first.outcome, second.outcome];
    if outcomes.contains(&ValidationOutcome::Vetoed) {
        ValidationOutcome::Vetoed
    } else if outcomes.contains(&ValidationOutcome::QuorumBreak) {
        ValidationOutcome::QuorumBreak
    } else if outcomes.contains(&ValidationOutcome::Adjusted) {
        ValidationOutcome::Adjusted
    } else {
        ValidationOutcome::Allowed
    }
}

fn finalize(current: u32, chosen: &ScalingDecision, target: u32, notes: Vec<String>, now_ms: u64) -> ScalingDecision {
    let mut reason = chosen.reason.clone();
    for note in notes {
        reason.push_str("; ");
        reason.push_str(&note);
    }
    ScalingDecision {
        action: ScalingAction::between(current, target),
        target_replicas: target,
        reason,
        confidence: chosen.confidence,
        timestamp: now_ms,
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
