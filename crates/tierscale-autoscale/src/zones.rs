//! Zone distribution planner for the secondary tier.
//!
//! Deterministic: the same inputs always give the same plan. Units are
//! handed out one at a time to the least-filled zone, which is also the
//! choice that minimizes resulting skew; ties go to the preferred zone.

use std::collections::BTreeMap;

use tracing::warn;

use tierscale_core::{ScaleError, ZoneConfig, ZonePlan};

/// A plan plus anything that had to be relaxed to build it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub plan: ZonePlan,
    /// `ZonePlanInfeasible` notes, for the decision reason.
    pub notes: Vec<ScaleError>,
}

impl PlanOutcome {
    pub fn feasible(&self) -> bool {
        self.notes.is_empty()
    }
}

pub struct ZonePlanner<'a> {
    zones: &'a [String],
    preference: &'a [String],
    min_per_zone: u32,
    max_skew: u32,
}

impl<'a> ZonePlanner<'a> {
    pub fn new(zones: &'a [String], preference: &'a [String], min_per_zone: u32, max_skew: u32) -> Self {
        Self {
            zones,
            preference,
            min_per_zone,
            max_skew,
        }
    }

    pub fn from_config(config: &'a ZoneConfig) -> Self {
        Self::new(
            &config.zones,
            &config.zone_preference,
            config.min_replicas_per_zone,
            config.max_zone_skew,
        )
    }

    /// Spread `total` replicas across the zones.
    pub fn plan(&self, total: u32) -> PlanOutcome {
        let mut notes = Vec::new();
        if self.zones.is_empty() {
            notes.push(ScaleError::ZonePlanInfeasible("no zones configured".to_string()));
            return PlanOutcome {
                plan: ZonePlan::default(),
                notes,
            };
        }

        let ranked = self.ranked();
        let n = ranked.len() as u32;

        let mut floor = self.min_per_zone;
        if floor.saturating_mul(n) > total {
            let relaxed = total / n;
            let note = format!(
                "{total} replicas cannot give {} zones {floor} each; relaxed to {relaxed} per zone",
                n
            );
            warn!(total, zones = n, min_per_zone = floor, relaxed, "zone minimum relaxed");
            notes.push(ScaleError::ZonePlanInfeasible(note));
            floor = relaxed;
        }

        let mut counts = vec![floor; ranked.len()];
        for _ in 0..(total - floor * n) {
            // `ranked` is in preference order, so `min_by_key` keeps the
            // most preferred zone among equally filled ones.
            let Some((idx, _)) = counts.iter().enumerate().min_by_key(|&(_, c)| *c) else {
                break;
            };
            counts[idx] += 1;
        }

        let plan = ZonePlan::new(
            ranked
                .iter()
                .zip(&counts)
                .map(|(zone, count)| (zone.to_string(), *count))
                .collect::<BTreeMap<_, _>>(),
        );

        if plan.skew() > self.max_skew {
            let note = format!(
                "{total} replicas over {n} zones leaves skew {}, above maximum {}",
                plan.skew(),
                self.max_skew
            );
            warn!(total, skew = plan.skew(), max_skew = self.max_skew, "zone skew unavoidable");
            notes.push(ScaleError::ZonePlanInfeasible(note));
        }

        PlanOutcome { plan, notes }
    }

    /// Zones in tie-break order: preferred zones first, in preference
    /// order, then the rest in configured order.
    fn ranked(&self) -> Vec<&'a str> {
        let mut ranked: Vec<&str> = Vec::with_capacity(self.zones.len());
        for zone in self.preference {
            if self.zones.contains(zone) && !ranked.contains(&zone.as_str()) {
                ranked.push(zone);
            }
        }
        for zone in self.zones {
            if !ranked.contains(&zone.as_str()) {
                ranked.push(zone);
            }
        }
        ranked
    }
}
