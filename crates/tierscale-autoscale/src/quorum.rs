//! Quorum guard for the primary tier.
//!
//! Every count leaving `guard` is odd, within the tier bounds and at least
//! `min_healthy_primaries`, except a veto: scale-downs that would leave
//! fewer healthy primaries than the floor hold the current count unless
//! quorum breaks are allowed.

use tracing::warn;

use tierscale_core::{QuorumState, ScaleError, ScalingAction, TierConfig};
use tierscale_metrics::ValidationOutcome;

/// Result of validating one primaries candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardOutcome {
    pub allowed: u32,
    pub vetoed: bool,
    pub outcome: ValidationOutcome,
    /// Set whenever the candidate was changed, vetoed or flagged.
    pub reason: Option<String>,
}

pub struct QuorumGuard {
    /// Lowest odd count satisfying both `min_replicas` and the healthy floor.
    lowest: u32,
    /// Highest odd count within `max_replicas`.
    highest: u32,
}

impl QuorumGuard {
    pub fn new(tier: &TierConfig, min_healthy: u32) -> Self {
        let floor = tier.min_replicas.max(min_healthy).max(1);
        let lowest = floor | 1;
        let highest = if tier.max_replicas % 2 == 1 {
            tier.max_replicas
        } else {
            tier.max_replicas.saturating_sub(1)
        };
        Self {
            lowest,
            // Quorum floor wins over an unsatisfiable ceiling.
            highest: highest.max(lowest),
        }
    }

    /// Validate moving from `current` to `candidate` primaries.
    pub fn guard(&self, current: u32, candidate: u32, state: &QuorumState) -> GuardOutcome {
        let direction = ScalingAction::between(current, candidate);
        let allowed = self.normalize(candidate, direction);

        if allowed < current {
            let removed = current - allowed;
            let remaining = i64::from(state.current_healthy_primaries) - i64::from(removed);
            if remaining < i64::from(state.min_healthy_primaries) {
                let detail = format!(
                    "removing {removed} of {} healthy primaries leaves {remaining}, below minimum {}",
                    state.current_healthy_primaries, state.min_healthy_primaries
                );
                if state.allow_quorum_break {
                    warn!(current, allowed, "quorum exception: {detail}");
                    return GuardOutcome {
                        allowed,
                        vetoed: false,
                        outcome: ValidationOutcome::QuorumBreak,
                        reason: Some(format!("QUORUM EXCEPTION: {detail} (allow_quorum_break)")),
                    };
                }
                let mut reason = ScaleError::QuorumVeto(detail).to_string();
                if current % 2 == 0 {
                    reason.push_str(&format!("; primaries count {current} is even, held until the veto clears"));
                }
                return GuardOutcome {
                    allowed: current,
                    vetoed: true,
                    outcome: ValidationOutcome::Vetoed,
                    reason: Some(reason),
                };
            }
        }

        if allowed == candidate {
            GuardOutcome {
                allowed,
                vetoed: false,
                outcome: ValidationOutcome::Allowed,
                reason: None,
            }
        } else {
            GuardOutcome {
                allowed,
                vetoed: false,
                outcome: ValidationOutcome::Adjusted,
                reason: Some(format!("primaries adjusted {candidate} -> {allowed} (odd count, quorum floor)")),
            }
        }
    }

    /// Odd, in-range count closest to `candidate` in its direction.
    /// Even counts round up when growing or holding, down when shrinking.
    fn normalize(&self, candidate: u32, direction: ScalingAction) -> u32 {
        let odd = if candidate % 2 == 1 {
            candidate
        } else {
            match direction {
                ScalingAction::ScaleDown => candidate.saturating_sub(1),
                ScalingAction::ScaleUp | ScalingAction::NoChange => {
                    if candidate + 1 > self.highest {
                        candidate.saturating_sub(1)
                    } else {
                        candidate + 1
                    }
                }
            }
        };
        odd.clamp(self.lowest, self.highest)
    }
}
