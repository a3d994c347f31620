//! Scaling observability — counters and gauges for decisions, quorum
//! validation and replica counts, with Prometheus text exposition.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tierscale_core::{ScalingAction, Tier};

/// How the quorum guard treated a primaries candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValidationOutcome {
    /// Candidate passed unchanged.
    Allowed,
    /// Candidate was rounded to an odd count or raised to the floor.
    Adjusted,
    /// Candidate was rejected; the tier holds.
    Vetoed,
    /// Candidate would break quorum but was let through by config.
    QuorumBreak,
}

impl ValidationOutcome {
    pub const ALL: [ValidationOutcome; 4] = [
        ValidationOutcome::Allowed,
        ValidationOutcome::Adjusted,
        ValidationOutcome::Vetoed,
        ValidationOutcome::QuorumBreak,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationOutcome::Allowed => "allowed",
            ValidationOutcome::Adjusted => "adjusted",
            ValidationOutcome::Vetoed => "vetoed",
            ValidationOutcome::QuorumBreak => "quorum_break",
        }
    }
}

/// Sink for scaling events. Implementations must be cheap and non-blocking.
pub trait ScalingRecorder: Send + Sync {
    fn record_decision(&self, cluster: &str, tier: Tier, action: ScalingAction, confidence: f64);

    fn record_validation(&self, cluster: &str, outcome: ValidationOutcome);

    fn set_replicas(&self, cluster: &str, tier: Tier, replicas: u32);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl ScalingRecorder for NoopRecorder {
    fn record_decision(&self, _: &str, _: Tier, _: ScalingAction, _: f64) {}
    fn record_validation(&self, _: &str, _: ValidationOutcome) {}
    fn set_replicas(&self, _: &str, _: Tier, _: u32) {}
}

/// Per-(cluster, tier) bucket.
#[derive(Default)]
struct TierMetrics {
    scale_up: AtomicU64,
    scale_down: AtomicU64,
    no_change: AtomicU64,
    replicas: AtomicU64,
    /// Last confidence, as `f64::to_bits`.
    confidence_bits: AtomicU64,
}

#[derive(Default)]
struct ClusterCounters {
    tiers: [TierMetrics; 2],
    validations: [AtomicU64; 4],
}

impl ClusterCounters {
    fn tier(&self, tier: Tier) -> &TierMetrics {
        match tier {
            Tier::Primaries => &self.tiers[0],
            Tier::Secondaries => &self.tiers[1],
        }
    }

    fn validation(&self, outcome: ValidationOutcome) -> &AtomicU64 {
        &self.validations[outcome as usize]
    }
}

/// In-memory recorder rendering Prometheus text format.
#[derive(Default)]
pub struct PrometheusRecorder {
    clusters: RwLock<BTreeMap<String, Arc<ClusterCounters>>>,
}

impl PrometheusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn cluster(&self, cluster: &str) -> Arc<ClusterCounters> {
        if let Some(m) = self
            .clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster)
        {
            return m.clone();
        }
        self.clusters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cluster.to_string())
            .or_default()
            .clone()
    }

    /// Scaling events for one cluster tier and direction.
    pub fn decisions(&self, cluster: &str, tier: Tier, action: ScalingAction) -> u64 {
        let m = self.cluster(cluster);
        let t = m.tier(tier);
        match action {
            ScalingAction::ScaleUp => t.scale_up.load(Ordering::Relaxed),
            ScalingAction::ScaleDown => t.scale_down.load(Ordering::Relaxed),
            ScalingAction::NoChange => t.no_change.load(Ordering::Relaxed),
        }
    }

    pub fn validations(&self, cluster: &str, outcome: ValidationOutcome) -> u64 {
        self.cluster(cluster).validation(outcome).load(Ordering::Relaxed)
    }

    pub fn replicas(&self, cluster: &str, tier: Tier) -> u64 {
        self.cluster(cluster).tier(tier).replicas.load(Ordering::Relaxed)
    }

    /// Render everything recorded so far.
    pub fn render(&self) -> String {
        let clusters: Vec<(String, Arc<ClusterCounters>)> = self
            .clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut out = String::new();

        out.push_str("# HELP tierscale_scaling_events_total Scaling decisions by direction.\n");
        out.push_str("# TYPE tierscale_scaling_events_total counter\n");
        for (cluster, m) in &clusters {
            for tier in Tier::ALL {
                let t = m.tier(tier);
                for (direction, counter) in [
                    (ScalingAction::ScaleUp, &t.scale_up),
                    (ScalingAction::ScaleDown, &t.scale_down),
                    (ScalingAction::NoChange, &t.no_change),
                ] {
                    let _ = writeln!(
                        out,
                        "tierscale_scaling_events_total{{cluster=\"{cluster}\",tier=\"{tier}\",direction=\"{}\"}} {}",
                        direction.as_str(),
                        counter.load(Ordering::Relaxed)
                    );
                }
            }
        }

        out.push_str("# HELP tierscale_quorum_validations_total Quorum guard outcomes for primaries.\n");
        out.push_str("# TYPE tierscale_quorum_validations_total counter\n");
        for (cluster, m) in &clusters {
            for outcome in ValidationOutcome::ALL {
                let _ = writeln!(
                    out,
                    "tierscale_quorum_validations_total{{cluster=\"{cluster}\",outcome=\"{}\"}} {}",
                    outcome.as_str(),
                    m.validation(outcome).load(Ordering::Relaxed)
                );
            }
        }

        out.push_str("# HELP tierscale_replicas Replica count after the last decision.\n");
        out.push_str("# TYPE tierscale_replicas gauge\n");
        for (cluster, m) in &clusters {
            for tier in Tier::ALL {
                let _ = writeln!(
                    out,
                    "tierscale_replicas{{cluster=\"{cluster}\",tier=\"{tier}\"}} {}",
                    m.tier(tier).replicas.load(Ordering::Relaxed)
                );
            }
        }

        out.push_str("# HELP tierscale_decision_confidence Confidence of the last decision (0.0-1.0).\n");
        out.push_str("# TYPE tierscale_decision_confidence gauge\n");
        for (cluster, m) in &clusters {
            for tier in Tier::ALL {
                let bits = m.tier(tier).confidence_bits.load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "tierscale_decision_confidence{{cluster=\"{cluster}\",tier=\"{tier}\"}} {:.4}",
                    f64::from_bits(bits)
                );
            }
        }

        out
    }
}

impl ScalingRecorder for PrometheusRecorder {
    fn record_decision(&self, cluster: &str, tier: Tier, action: ScalingAction, confidence: f64) {
        let m = self.cluster(cluster);
        let t = m.tier(tier);
        let counter = match action {
            ScalingAction::ScaleUp => &t.scale_up,
            ScalingAction::ScaleDown => &t.scale_down,
            ScalingAction::NoChange => &t.no_change,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        t.confidence_bits
            .store(confidence.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn record_validation(&self, cluster: &str, outcome: ValidationOutcome) {
        self.cluster(cluster)
            .validation(outcome)
            .fetch_add(1, Ordering::Relaxed);
    }

    fn set_replicas(&self, cluster: &str, tier: Tier, replicas: u32) {
        self.cluster(cluster)
            .tier(tier)
            .replicas
            .store(u64::from(replicas), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty_still_declares_types() {
        let output = PrometheusRecorder::new().render();
        assert!(output.contains("# TYPE tierscale_scaling_events_total counter"));
        assert!(output.contains("# TYPE tierscale_replicas gauge"));
    }

    #[test]
    fn counts_decisions_by_direction() {
        let r = PrometheusRecorder::new();
        r.record_decision("db/graph", Tier::Primaries, ScalingAction::ScaleUp, 0.8);
        r.record_decision("db/graph", Tier::Primaries, ScalingAction::ScaleUp, 0.6);
        r.record_decision("db/graph", Tier::Secondaries, ScalingAction::NoChange, 0.0);

        assert_eq!(r.decisions("db/graph", Tier::Primaries, ScalingAction::ScaleUp), 2);
        assert_eq!(r.decisions("db/graph", Tier::Primaries, ScalingAction::ScaleDown), 0);
        assert_eq!(r.decisions("db/graph", Tier::Secondaries, ScalingAction::NoChange), 1);

        let output = r.render();
        assert!(output.contains(
            "tierscale_scaling_events_total{cluster=\"db/graph\",tier=\"primaries\",direction=\"scale_up\"} 2"
        ));
        assert!(output.contains(
            "tierscale_decision_confidence{cluster=\"db/graph\",tier=\"primaries\"} 0.6000"
        ));
    }

    #[test]
    fn validation_outcomes_and_replicas() {
        let r = PrometheusRecorder::new();
        r.record_validation("db/graph", ValidationOutcome::Vetoed);
        r.set_replicas("db/graph", Tier::Secondaries, 7);

        assert_eq!(r.validations("db/graph", ValidationOutcome::Vetoed), 1);
        assert_eq!(r.replicas("db/graph", Tier::Secondaries), 7);

        let output = r.render();
        assert!(output.contains("tierscale_quorum_validations_total{cluster=\"db/graph\",outcome=\"vetoed\"} 1"));
        assert!(output.contains("tierscale_replicas{cluster=\"db/graph\",tier=\"secondaries\"} 7"));
    }

    #[test]
    fn every_sample_line_has_labels() {
        let r = PrometheusRecorder::new();
        r.set_replicas("a/b", Tier::Primaries, 3);
        for line in r.render().lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(line.contains('{') && line.contains('}'), "line should have labels: {line}");
        }
    }
}
