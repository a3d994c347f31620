//! Behavior policies — stabilization windows and step limits.

use tracing::debug;

use tierscale_core::{BehaviorConfig, PolicyKind, ScalingAction, ScalingRules, SelectPolicy, StepPolicy};

use crate::history::History;

/// A clamped delta and, when it differs from the raw one, why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clamped {
    pub delta: i64,
    pub reason: Option<String>,
}

impl Clamped {
    fn unchanged(delta: i64) -> Self {
        Self { delta, reason: None }
    }
}

/// Limit `raw_delta` replicas of change from `current`.
///
/// The result keeps the sign of `raw_delta` and never exceeds it in
/// magnitude.
pub fn clamp(
    raw_delta: i64,
    current: u32,
    behavior: &BehaviorConfig,
    history: &History,
    now_ms: u64,
) -> Clamped {
    let direction = match raw_delta.signum() {
        1 => ScalingAction::ScaleUp,
        -1 => ScalingAction::ScaleDown,
        _ => return Clamped::unchanged(0),
    };
    let rules = match direction {
        ScalingAction::ScaleUp => &behavior.scale_up,
        _ => &behavior.scale_down,
    };

    if let Some(reason) = stabilization_blocks(direction, rules, history, now_ms) {
        debug!(%direction, raw_delta, "suppressed by stabilization window");
        return Clamped { delta: 0, reason: Some(reason) };
    }

    let Some(cap) = step_cap(direction, rules, current, history, now_ms) else {
        return Clamped::unchanged(raw_delta);
    };

    let magnitude = raw_delta.unsigned_abs();
    if magnitude <= u64::from(cap) {
        return Clamped::unchanged(raw_delta);
    }

    let delta = raw_delta.signum() * i64::from(cap);
    let reason = if rules.select_policy == SelectPolicy::Disabled {
        format!("{direction} disabled by behavior policy")
    } else {
        format!("{direction} step limited to {cap} (requested {magnitude})")
    };
    debug!(%direction, raw_delta, delta, "step policy applied");
    Clamped { delta, reason: Some(reason) }
}

/// An opposing action inside the window blocks this one.
fn stabilization_blocks(
    direction: ScalingAction,
    rules: &ScalingRules,
    history: &History,
    now_ms: u64,
) -> Option<String> {
    if rules.stabilization_window.is_zero() {
        return None;
    }
    let opposite = direction.opposite();
    history
        .within(now_ms, rules.stabilization_window)
        .filter(|e| e.action == opposite)
        .max_by_key(|e| e.timestamp)
        .map(|e| {
            format!(
                "stabilization: {opposite} {}ms ago inside {:?} window",
                now_ms.saturating_sub(e.timestamp),
                rules.stabilization_window
            )
        })
}

/// Replicas this direction may still move now. `None` is unbounded.
fn step_cap(
    direction: ScalingAction,
    rules: &ScalingRules,
    current: u32,
    history: &History,
    now_ms: u64,
) -> Option<u32> {
    if rules.select_policy == SelectPolicy::Disabled {
        return Some(0);
    }
    let caps = rules
        .policies
        .iter()
        .map(|p| policy_budget(p, direction, current, history, now_ms));
    match rules.select_policy {
        SelectPolicy::Max => caps.max(),
        SelectPolicy::Min => caps.min(),
        SelectPolicy::Disabled => Some(0),
    }
}

/// A policy's per-period allowance minus what was already moved in
/// the same direction during that period.
fn policy_budget(
    policy: &StepPolicy,
    direction: ScalingAction,
    current: u32,
    history: &History,
    now_ms: u64,
) -> u32 {
    let allowance = match policy.kind {
        PolicyKind::Pods => policy.value,
        PolicyKind::Percent => {
            let step = (u64::from(current) * u64::from(policy.value)).div_ceil(100);
            // Percent of zero replicas would pin the tier at zero.
            let step = if policy.value > 0 { step.max(1) } else { 0 };
            u32::try_from(step).unwrap_or(u32::MAX)
        }
    };
    let moved: u32 = history
        .within(now_ms, policy.period)
        .filter(|e| e.action == direction)
        .map(|e| e.magnitude())
        .sum();
    allowance.saturating_sub(moved)
}
