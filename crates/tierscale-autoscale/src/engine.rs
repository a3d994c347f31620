//! Decision engine — composite scoring and raw target per tier.
//!
//! `decide` is pure: identical `(metrics, config, history, now)` always
//! yields the identical decision. The caller owns history appends.

use std::time::Duration;

use tracing::debug;

use tierscale_core::{
    EngineConfig, NodeMetrics, ScalingAction, ScalingDecision, Tier, TierConfig, TriggerPolicy,
};
use tierscale_metrics::{composite_score, normalize, MetricRatio};

use crate::history::History;

pub const COOLDOWN_REASON: &str = "cooldown active";

pub struct DecisionEngine {
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Time left before the tier may act again, if any.
    pub fn cooldown_remaining(&self, history: &History, now_ms: u64) -> Option<Duration> {
        let last = history.last_change()?;
        let elapsed = Duration::from_millis(now_ms.saturating_sub(last));
        self.config.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Propose an action and raw target for one tier.
    pub fn decide(
        &self,
        tier: Tier,
        tier_config: &TierConfig,
        current: u32,
        metrics: &NodeMetrics,
        history: &History,
        now_ms: u64,
    ) -> ScalingDecision {
        if let Some(left) = self.cooldown_remaining(history, now_ms) {
            debug!(%tier, remaining_ms = left.as_millis() as u64, "cooldown active, holding");
            return ScalingDecision::hold(current, COOLDOWN_REASON, now_ms);
        }

        let normalized = normalize(&tier_config.metrics, metrics);
        let Some(composite) = composite_score(&normalized.ratios) else {
            let mut decision = ScalingDecision::hold(current, "no scoreable metrics", now_ms);
            // Out-of-range counts are repaired even without a signal.
            decision.target_replicas = tier_config.clamp(current);
            decision.action = ScalingAction::between(current, decision.target_replicas);
            return decision;
        };

        let upper = 1.0 + self.config.tolerance;
        let lower = 1.0 - self.config.tolerance;
        let complete = normalized.ratios.len() == normalized.configured;

        let (action, driver) = match self.config.trigger_policy {
            TriggerPolicy::EagerUpConservativeDown => {
                let worst = worst_ratio(&normalized.ratios);
                if worst > upper {
                    (ScalingAction::ScaleUp, worst)
                } else if complete && worst < lower {
                    // `worst` is the highest ratio, so every metric is below the band.
                    (ScalingAction::ScaleDown, worst)
                } else {
                    (ScalingAction::NoChange, worst)
                }
            }
            TriggerPolicy::Composite => {
                if composite > upper {
                    (ScalingAction::ScaleUp, composite)
                } else if complete && composite < lower {
                    (ScalingAction::ScaleDown, composite)
                } else {
                    (ScalingAction::NoChange, composite)
                }
            }
        };

        let raw = match action {
            ScalingAction::NoChange => current,
            // A tier at zero still grows from a single replica.
            ScalingAction::ScaleUp => proportional(current.max(1), driver),
            ScalingAction::ScaleDown => proportional(current, driver),
        };
        let target = tier_config.clamp(raw);
        let action = ScalingAction::between(current, target);

        let severity = ((composite - 1.0).abs() / self.config.severity_scale).min(1.0);
        let confidence = (normalized.availability() * severity).clamp(0.0, 1.0);

        let mut reason = describe(&normalized.ratios, composite, lower, upper, action);
        if raw != target {
            reason.push_str(&format!(
                "; raw target {raw} clamped to [{}, {}]",
                tier_config.min_replicas, tier_config.max_replicas
            ));
        }
        if !normalized.skipped.is_empty() {
            let skipped: Vec<String> = normalized
                .skipped
                .iter()
                .map(|(label, why)| format!("{label} ({why})"))
                .collect();
            reason.push_str(&format!("; skipped {}", skipped.join(", ")));
        }

        debug!(
            %tier,
            current,
            target,
            composite,
            confidence,
            action = %action,
            "tier evaluated"
        );

        ScalingDecision {
            action,
            target_replicas: target,
            reason,
            confidence,
            timestamp: now_ms,
        }
    }
}

fn proportional(base: u32, driver: f64) -> u32 {
    // Epsilon keeps float noise from adding a replica on exact products.
    (f64::from(base) * driver - 1e-9).ceil().max(0.0) as u32
}

/// Ratio of the metric furthest above its target.
fn worst_ratio(ratios: &[MetricRatio]) -> f64 {
    ratios.iter().map(|r| r.ratio).fold(f64::NEG_INFINITY, f64::max)
}

fn describe(ratios: &[MetricRatio], composite: f64, lower: f64, upper: f64, action: ScalingAction) -> String {
    let parts: Vec<String> = ratios
        .iter()
        .map(|r| format!("{} {:.3}", r.label, r.ratio))
        .collect();
    let verdict = match action {
        ScalingAction::ScaleUp => "above band",
        ScalingAction::ScaleDown => "below band",
        ScalingAction::NoChange => "within band",
    };
    format!(
        "{verdict} [{lower:.2}, {upper:.2}]: composite {composite:.3} ({})",
        parts.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierscale_core::{HistoryEntry, MetricField, MetricKind, MetricSpec, Reading};

    const NOW: u64 = 1_700_000_000_000;

    fn cpu_memory() -> TierConfig {
        TierConfig::new(
            3,
            9,
            vec![
                MetricSpec::new(MetricKind::Cpu, "70", 1.0),
                MetricSpec::new(MetricKind::Memory, "80", 1.0),
            ],
        )
    }

    fn live(cpu: f64, memory: f64) -> NodeMetrics {
        let mut m = NodeMetrics::default();
        m.set(&MetricField::Cpu, Reading::fresh(cpu));
        m.set(&MetricField::Memory, Reading::fresh(memory));
        m
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(EngineConfig::default())
    }

    #[test]
    fn any_metric_above_band_scales_up() {
        let d = engine().decide(Tier::Secondaries, &cpu_memory(), 4, &live(85.0, 50.0), &History::new(8), NOW);
        assert_eq!(d.action, ScalingAction::ScaleUp);
        // ceil(4 × 85/70)
        assert_eq!(d.target_replicas, 5);
    }

    #[test]
    fn scale_down_needs_every_metric_below_band() {
        let d = engine().decide(Tier::Secondaries, &cpu_memory(), 6, &live(40.0, 90.0), &History::new(8), NOW);
        assert_eq!(d.action, ScalingAction::NoChange);
        assert_eq!(d.target_replicas, 6);

        let d = engine().decide(Tier::Secondaries, &cpu_memory(), 6, &live(35.0, 40.0), &History::new(8), NOW);
        assert_eq!(d.action, ScalingAction::ScaleDown);
        // ceil(6 × 0.5)
        assert_eq!(d.target_replicas, 3);
    }

    #[test]
    fn scale_down_held_when_a_metric_is_missing() {
        let mut m = NodeMetrics::default();
        m.set(&MetricField::Cpu, Reading::fresh(20.0));
        let d = engine().decide(Tier::Secondaries, &cpu_memory(), 6, &m, &History::new(8), NOW);
        assert_eq!(d.action, ScalingAction::NoChange);
        assert!(d.reason.contains("skipped memory"));
    }

    #[test]
    fn target_clamped_to_bounds() {
        let d = engine().decide(Tier::Secondaries, &cpu_memory(), 8, &live(210.0, 10.0), &History::new(8), NOW);
        assert_eq!(d.target_replicas, 9);
        assert!(d.reason.contains("clamped"));
    }

    #[test]
    fn cooldown_holds_second_decision() {
        let e = engine();
        let mut h = History::new(8);
        let first = e.decide(Tier::Secondaries, &cpu_memory(), 4, &live(85.0, 50.0), &h, NOW);
        assert!(first.is_change());
        h.push(HistoryEntry::from_decision(4, &first));

        let second = e.decide(Tier::Secondaries, &cpu_memory(), 5, &live(95.0, 50.0), &h, NOW + 60_000);
        assert_eq!(second.action, ScalingAction::NoChange);
        assert_eq!(second.reason, COOLDOWN_REASON);

        let later = e.decide(Tier::Secondaries, &cpu_memory(), 5, &live(95.0, 50.0), &h, NOW + 301_000);
        assert_eq!(later.action, ScalingAction::ScaleUp);
    }

    #[test]
    fn hold_does_not_start_cooldown() {
        let e = engine();
        let mut h = History::new(8);
        h.push(HistoryEntry::from_decision(4, &ScalingDecision::hold(4, "within band", NOW)));
        assert!(e.cooldown_remaining(&h, NOW + 1).is_none());
    }

    #[test]
    fn composite_policy_ignores_single_spike() {
        let config = EngineConfig {
            trigger_policy: TriggerPolicy::Composite,
            ..Default::default()
        };
        // cpu 1.214, memory 0.625 → composite ≈ 0.92
        let d = DecisionEngine::new(config).decide(
            Tier::Secondaries,
            &cpu_memory(),
            4,
            &live(85.0, 50.0),
            &History::new(8),
            NOW,
        );
        assert_eq!(d.action, ScalingAction::NoChange);
    }

    #[test]
    fn confidence_scales_with_availability_and_severity() {
        let e = engine();
        let full = e.decide(Tier::Secondaries, &cpu_memory(), 4, &live(140.0, 160.0), &History::new(8), NOW);
        assert!((full.confidence - 1.0).abs() < 1e-9);

        let mut partial = NodeMetrics::default();
        partial.set(&MetricField::Cpu, Reading::fresh(140.0));
        let half = e.decide(Tier::Secondaries, &cpu_memory(), 4, &partial, &History::new(8), NOW);
        assert!((half.confidence - 0.5).abs() < 1e-9);
        assert!(half.confidence >= 0.0 && half.confidence <= 1.0);
    }

    #[test]
    fn no_metrics_holds() {
        let d = engine().decide(Tier::Secondaries, &cpu_memory(), 4, &NodeMetrics::default(), &History::new(8), NOW);
        assert_eq!(d.action, ScalingAction::NoChange);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn no_metrics_still_repairs_out_of_range_count() {
        let d = engine().decide(Tier::Secondaries, &cpu_memory(), 1, &NodeMetrics::default(), &History::new(8), NOW);
        assert_eq!(d.action, ScalingAction::ScaleUp);
        assert_eq!(d.target_replicas, 3);
    }

    #[test]
    fn empty_tier_scales_up_from_zero() {
        let spec = MetricSpec::custom("read_qps", "sum(rate(reads_total[1m]))", "100", 1.0);
        let mut m = NodeMetrics::default();
        m.set(&spec.field(), Reading::fresh(250.0));
        let config = TierConfig::new(0, 5, vec![spec]);
        let d = engine().decide(Tier::Secondaries, &config, 0, &m, &History::new(8), NOW);
        assert_eq!(d.action, ScalingAction::ScaleUp);
        // ceil(1 × 2.5)
        assert_eq!(d.target_replicas, 3);
    }

    #[test]
    fn decide_is_deterministic() {
        let e = engine();
        let h = History::new(8);
        let a = e.decide(Tier::Primaries, &cpu_memory(), 3, &live(85.0, 60.0), &h, NOW);
        let b = e.decide(Tier::Primaries, &cpu_memory(), 3, &live(85.0, 60.0), &h, NOW);
        assert_eq!(a, b);
    }
}
