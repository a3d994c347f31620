//! Metric normalization: target strings to comparable ratios.
//!
//! Targets come in three forms:
//!
//! | Written as | Parsed as | Live value compared |
//! |---|---|---|
//! | `"70"` | absolute 70 | as reported |
//! | `"70%"` | fraction 0.70 | scaled to a fraction (cpu/memory report percent) |
//! | `"200ms"`, `"1.5s"` | duration, in the live unit | as reported |
//!
//! Each `MetricKind` is bound to an `Evaluator` describing its live units.
//! Metrics without a fresh live value are skipped, never zero-filled.

use std::time::Duration;

use tracing::warn;

use tierscale_core::duration::has_duration_suffix;
use tierscale_core::{parse_duration, MetricKind, MetricSpec, NodeMetrics, ScaleError, ScaleResult};

/// How a kind's live values relate to target notations.
#[derive(Debug, Clone, Copy)]
struct Evaluator {
    /// Multiplier taking a live value to a fraction, for `%` targets.
    fraction_scale: f64,
    /// Duration → live unit. `None` rejects duration targets.
    from_duration: Option<fn(Duration) -> f64>,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn seconds(d: Duration) -> f64 {
    d.as_secs_f64()
}

fn evaluator(kind: MetricKind) -> Evaluator {
    match kind {
        MetricKind::Cpu | MetricKind::Memory => Evaluator {
            fraction_scale: 0.01,
            from_duration: None,
        },
        MetricKind::QueryLatency => Evaluator {
            fraction_scale: 1.0,
            from_duration: Some(millis as fn(Duration) -> f64),
        },
        MetricKind::ConnectionCount | MetricKind::Throughput => Evaluator {
            fraction_scale: 1.0,
            from_duration: None,
        },
        MetricKind::Custom => Evaluator {
            fraction_scale: 1.0,
            from_duration: Some(seconds as fn(Duration) -> f64),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetForm {
    Absolute,
    Fraction,
    Duration,
}

/// A parsed, strictly positive target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub value: f64,
    pub form: TargetForm,
}

/// Parse `spec.target_raw` into a target in the metric's live units.
pub fn parse_target(spec: &MetricSpec) -> ScaleResult<Target> {
    let raw = spec.target_raw.trim();
    let invalid = || ScaleError::InvalidMetricTarget {
        metric: spec.label(),
        raw: spec.target_raw.clone(),
    };

    let target = if let Some(pct) = raw.strip_suffix('%') {
        let value: f64 = pct.trim().parse().map_err(|_| invalid())?;
        Target {
            value: value / 100.0,
            form: TargetForm::Fraction,
        }
    } else if let Ok(value) = raw.parse::<f64>() {
        Target {
            value,
            form: TargetForm::Absolute,
        }
    } else if has_duration_suffix(raw) {
        let convert = evaluator(spec.kind).from_duration.ok_or_else(invalid)?;
        let duration = parse_duration(raw).ok_or_else(invalid)?;
        Target {
            value: convert(duration),
            form: TargetForm::Duration,
        }
    } else {
        return Err(invalid());
    };

    if !target.value.is_finite() || target.value <= 0.0 {
        return Err(invalid());
    }
    Ok(target)
}

/// One metric's contribution to scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRatio {
    pub label: String,
    pub kind: MetricKind,
    /// Live value in target units.
    pub current: f64,
    pub target: f64,
    /// `current / target`.
    pub ratio: f64,
    pub weight: f64,
}

/// Ratios for every metric present on both sides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub ratios: Vec<MetricRatio>,
    /// Number of metrics configured for the tier.
    pub configured: usize,
    /// Metrics dropped from scoring and why.
    pub skipped: Vec<(String, String)>,
}

impl Normalized {
    /// Fraction of configured metrics that made it into scoring.
    pub fn availability(&self) -> f64 {
        if self.configured == 0 {
            0.0
        } else {
            self.ratios.len() as f64 / self.configured as f64
        }
    }
}

/// Normalize a tier's live snapshot against its configured metrics.
pub fn normalize(specs: &[MetricSpec], metrics: &NodeMetrics) -> Normalized {
    let mut out = Normalized {
        configured: specs.len(),
        ..Default::default()
    };

    for spec in specs {
        let label = spec.label();

        if !(spec.weight.is_finite() && spec.weight > 0.0) {
            out.skipped.push((label, "non-positive weight".to_string()));
            continue;
        }

        let target = match parse_target(spec) {
            Ok(t) => t,
            Err(e) => {
                warn!(metric = %label, error = %e, "skipping metric with invalid target");
                out.skipped.push((label, e.to_string()));
                continue;
            }
        };

        let Some(live) = metrics.reading(&spec.field()).live() else {
            out.skipped.push((label, "no live value".to_string()));
            continue;
        };

        let current = match target.form {
            TargetForm::Fraction => live * evaluator(spec.kind).fraction_scale,
            TargetForm::Absolute | TargetForm::Duration => live,
        };

        out.ratios.push(MetricRatio {
            label,
            kind: spec.kind,
            current,
            target: target.value,
            ratio: current / target.value,
            weight: spec.weight,
        });
    }

    out
}

/// `Σ(ratio × weight) / Σ(weight)`, or `None` when nothing is scoreable.
pub fn composite_score(ratios: &[MetricRatio]) -> Option<f64> {
    let total_weight: f64 = ratios.iter().map(|r| r.weight).sum();
    if ratios.is_empty() || total_weight <= 0.0 {
        return None;
    }
    Some(ratios.iter().map(|r| r.ratio * r.weight).sum::<f64>() / total_weight)
}
