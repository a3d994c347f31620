//! Domain types for the autoscaling pipeline.
//!
//! Everything here is a plain value: snapshots are built fresh each
//! reconciliation, decisions are handed to the external executor, and
//! history entries live only in process memory.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster identity used to key caches, breakers and histories
/// (`{namespace}/{name}`).
pub type ClusterKey = String;

// ── Cluster ───────────────────────────────────────────────────────

/// The two independently scaled tiers of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Quorum-bearing members. Count must stay odd.
    Primaries,
    /// Read replicas, spread across zones.
    Secondaries,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Primaries, Tier::Secondaries];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primaries => "primaries",
            Tier::Secondaries => "secondaries",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live view of the cluster being reconciled, supplied by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
    /// Member metric endpoints (`host:port`) of the primary tier.
    pub primary_members: Vec<String>,
    /// Member metric endpoints (`host:port`) of the secondary tier.
    pub secondary_members: Vec<String>,
    /// Base URL of the Prometheus HTTP API, for custom queries.
    pub prometheus_url: Option<String>,
}

impl ClusterRef {
    /// Build the composite key used by every per-cluster map.
    pub fn key(&self) -> ClusterKey {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn members(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Primaries => &self.primary_members,
            Tier::Secondaries => &self.secondary_members,
        }
    }
}

/// Current replica counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierReplicas {
    pub primaries: u32,
    pub secondaries: u32,
}

impl TierReplicas {
    pub fn get(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Primaries => self.primaries,
            Tier::Secondaries => self.secondaries,
        }
    }
}

// ── Metric configuration ──────────────────────────────────────────

/// Closed set of metric kinds the engine knows how to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// CPU utilisation, reported in percent (0–100).
    Cpu,
    /// Memory utilisation, reported in percent (0–100).
    Memory,
    /// Query latency, reported in milliseconds.
    QueryLatency,
    /// Open client connections per member.
    ConnectionCount,
    /// Queries per second per member.
    Throughput,
    /// Arbitrary Prometheus query, keyed by metric name.
    Custom,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::QueryLatency => "query_latency",
            MetricKind::ConnectionCount => "connection_count",
            MetricKind::Throughput => "throughput",
            MetricKind::Custom => "custom",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a metric's live value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Per-member metrics endpoint.
    Member,
    /// Prometheus instant query.
    Prometheus,
}

/// One configured scaling metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSpec {
    pub kind: MetricKind,
    /// Target as written by the cluster owner: `"70"`, `"70%"`, `"200ms"`.
    #[serde(rename = "target")]
    pub target_raw: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Name under which a custom metric is stored in the snapshot.
    #[serde(default)]
    pub name: Option<String>,
    /// PromQL expression; required for `custom` and for `source = "prometheus"`.
    #[serde(default)]
    pub custom_query: Option<String>,
    #[serde(default)]
    pub source: Option<SourceKind>,
}

fn default_weight() -> f64 {
    1.0
}

impl MetricSpec {
    /// Convenience constructor for a member-sourced metric.
    pub fn new(kind: MetricKind, target_raw: &str, weight: f64) -> Self {
        Self {
            kind,
            target_raw: target_raw.to_string(),
            weight,
            name: None,
            custom_query: None,
            source: None,
        }
    }

    /// Convenience constructor for a Prometheus-backed custom metric.
    pub fn custom(name: &str, query: &str, target_raw: &str, weight: f64) -> Self {
        Self {
            kind: MetricKind::Custom,
            target_raw: target_raw.to_string(),
            weight,
            name: Some(name.to_string()),
            custom_query: Some(query.to_string()),
            source: Some(SourceKind::Prometheus),
        }
    }

    /// Effective source; custom metrics always come from Prometheus.
    pub fn source_kind(&self) -> SourceKind {
        match (self.kind, self.source) {
            (MetricKind::Custom, _) => SourceKind::Prometheus,
            (_, Some(source)) => source,
            (_, None) => SourceKind::Member,
        }
    }

    /// Slot in `NodeMetrics` this metric reads from.
    pub fn field(&self) -> MetricField {
        match self.kind {
            MetricKind::Cpu => MetricField::Cpu,
            MetricKind::Memory => MetricField::Memory,
            MetricKind::QueryLatency => MetricField::QueryLatency,
            MetricKind::ConnectionCount => MetricField::ConnectionCount,
            MetricKind::Throughput => MetricField::Throughput,
            MetricKind::Custom => MetricField::Custom(self.label()),
        }
    }

    /// Human-readable label used in logs and reasons.
    pub fn label(&self) -> String {
        match (&self.name, &self.custom_query) {
            (Some(name), _) => name.clone(),
            (None, Some(query)) if self.kind == MetricKind::Custom => query.clone(),
            _ => self.kind.as_str().to_string(),
        }
    }
}

// ── Live metrics ──────────────────────────────────────────────────

/// Addressable slot in a `NodeMetrics` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricField {
    Cpu,
    Memory,
    QueryLatency,
    ConnectionCount,
    Throughput,
    Custom(String),
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricField::Cpu => f.write_str("cpu"),
            MetricField::Memory => f.write_str("memory"),
            MetricField::QueryLatency => f.write_str("query_latency"),
            MetricField::ConnectionCount => f.write_str("connection_count"),
            MetricField::Throughput => f.write_str("throughput"),
            MetricField::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// A single live value. `fresh == false` means the source failed this
/// cycle and the value must not be scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub fresh: bool,
}

impl Reading {
    pub fn fresh(value: f64) -> Self {
        Self { value, fresh: true }
    }

    /// The value, if it was collected this cycle.
    pub fn live(&self) -> Option<f64> {
        self.fresh.then_some(self.value)
    }
}

/// Per-tier metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu: Reading,
    pub memory: Reading,
    pub query_latency: Reading,
    pub connection_count: Reading,
    pub throughput: Reading,
    #[serde(default)]
    pub custom: BTreeMap<String, Reading>,
}

impl NodeMetrics {
    pub fn reading(&self, field: &MetricField) -> Reading {
        match field {
            MetricField::Cpu => self.cpu,
            MetricField::Memory => self.memory,
            MetricField::QueryLatency => self.query_latency,
            MetricField::ConnectionCount => self.connection_count,
            MetricField::Throughput => self.throughput,
            MetricField::Custom(name) => self.custom.get(name).copied().unwrap_or_default(),
        }
    }

    pub fn set(&mut self, field: &MetricField, reading: Reading) {
        match field {
            MetricField::Cpu => self.cpu = reading,
            MetricField::Memory => self.memory = reading,
            MetricField::QueryLatency => self.query_latency = reading,
            MetricField::ConnectionCount => self.connection_count = reading,
            MetricField::Throughput => self.throughput = reading,
            MetricField::Custom(name) => {
                self.custom.insert(name.clone(), reading);
            }
        }
    }

    /// Whether any field was collected this cycle.
    pub fn has_fresh(&self) -> bool {
        [
            self.cpu,
            self.memory,
            self.query_latency,
            self.connection_count,
            self.throughput,
        ]
        .iter()
        .chain(self.custom.values())
        .any(|r| r.fresh)
    }
}

/// Snapshot of both tiers for one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub primary: NodeMetrics,
    pub secondary: NodeMetrics,
    /// Unix timestamp (milliseconds) of collection.
    pub collected_at: u64,
    /// At least one source failed; some fields are stale.
    pub degraded: bool,
}

impl ClusterMetrics {
    pub fn tier(&self, tier: Tier) -> &NodeMetrics {
        match tier {
            Tier::Primaries => &self.primary,
            Tier::Secondaries => &self.secondary,
        }
    }

    pub fn tier_mut(&mut self, tier: Tier) -> &mut NodeMetrics {
        match tier {
            Tier::Primaries => &mut self.primary,
            Tier::Secondaries => &mut self.secondary,
        }
    }
}

// ── Decisions ─────────────────────────────────────────────────────

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    #[serde(rename = "none")]
    NoChange,
}

impl ScalingAction {
    /// Action implied by moving from `current` to `target` replicas.
    pub fn between(current: u32, target: u32) -> Self {
        match target.cmp(&current) {
            std::cmp::Ordering::Greater => ScalingAction::ScaleUp,
            std::cmp::Ordering::Less => ScalingAction::ScaleDown,
            std::cmp::Ordering::Equal => ScalingAction::NoChange,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            ScalingAction::ScaleUp => ScalingAction::ScaleDown,
            ScalingAction::ScaleDown => ScalingAction::ScaleUp,
            ScalingAction::NoChange => ScalingAction::NoChange,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::NoChange => "none",
        }
    }
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one reconciliation for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub target_replicas: u32,
    pub reason: String,
    /// 0.0–1.0.
    pub confidence: f64,
    /// Unix timestamp (milliseconds).
    pub timestamp: u64,
}

impl ScalingDecision {
    /// A decision that keeps `current` replicas.
    pub fn hold(current: u32, reason: impl Into<String>, timestamp: u64) -> Self {
        Self {
            action: ScalingAction::NoChange,
            target_replicas: current,
            reason: reason.into(),
            confidence: 0.0,
            timestamp,
        }
    }

    pub fn is_change(&self) -> bool {
        self.action != ScalingAction::NoChange
    }
}

/// One remembered decision, used for cooldown and stabilization lookups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: ScalingAction,
    pub from_replicas: u32,
    pub to_replicas: u32,
    /// Unix timestamp (milliseconds).
    pub timestamp: u64,
}

impl HistoryEntry {
    pub fn from_decision(current: u32, decision: &ScalingDecision) -> Self {
        Self {
            action: decision.action,
            from_replicas: current,
            to_replicas: decision.target_replicas,
            timestamp: decision.timestamp,
        }
    }

    /// Replicas moved by this entry.
    pub fn magnitude(&self) -> u32 {
        self.from_replicas.abs_diff(self.to_replicas)
    }
}

// ── Placement & quorum ────────────────────────────────────────────

/// Per-zone replica counts for the secondary tier. Built once by the
/// zone planner and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePlan(BTreeMap<String, u32>);

impl ZonePlan {
    pub fn new(counts: BTreeMap<String, u32>) -> Self {
        Self(counts)
    }

    pub fn get(&self, zone: &str) -> Option<u32> {
        self.0.get(zone).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(z, c)| (z.as_str(), *c))
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    /// `max(count) − min(count)`, 0 for an empty plan.
    pub fn skew(&self) -> u32 {
        let max = self.0.values().max().copied().unwrap_or(0);
        let min = self.0.values().min().copied().unwrap_or(0);
        max - min
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Quorum inputs for the primary tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumState {
    pub current_healthy_primaries: u32,
    pub min_healthy_primaries: u32,
    pub allow_quorum_break: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_key_is_namespaced() {
        let cluster = ClusterRef {
            namespace: "db".to_string(),
            name: "graph".to_string(),
            primary_members: vec![],
            secondary_members: vec![],
            prometheus_url: None,
        };
        assert_eq!(cluster.key(), "db/graph");
    }

    #[test]
    fn custom_spec_reads_custom_field() {
        let spec = MetricSpec::custom("page_cache_hit", "avg(hits)", "0.9", 1.0);
        assert_eq!(spec.field(), MetricField::Custom("page_cache_hit".to_string()));
        assert_eq!(spec.source_kind(), SourceKind::Prometheus);
    }

    #[test]
    fn builtin_spec_defaults_to_member_source() {
        let spec = MetricSpec::new(MetricKind::Cpu, "70", 1.0);
        assert_eq!(spec.source_kind(), SourceKind::Member);
        assert_eq!(spec.field(), MetricField::Cpu);
    }

    #[test]
    fn stale_readings_are_not_live() {
        let mut metrics = NodeMetrics::default();
        assert_eq!(metrics.cpu.live(), None);
        assert!(!metrics.has_fresh());

        metrics.set(&MetricField::Cpu, Reading::fresh(42.0));
        assert_eq!(metrics.reading(&MetricField::Cpu).live(), Some(42.0));
        assert!(metrics.has_fresh());
    }

    #[test]
    fn action_between_counts() {
        assert_eq!(ScalingAction::between(3, 5), ScalingAction::ScaleUp);
        assert_eq!(ScalingAction::between(5, 3), ScalingAction::ScaleDown);
        assert_eq!(ScalingAction::between(3, 3), ScalingAction::NoChange);
    }

    #[test]
    fn action_serializes_snake_case() {
        let json = serde_json::to_string(&ScalingAction::NoChange).unwrap();
        assert_eq!(json, "\"none\"");
        let up: ScalingAction = serde_json::from_str("\"scale_up\"").unwrap();
        assert_eq!(up, ScalingAction::ScaleUp);
    }

    #[test]
    fn zone_plan_skew_and_total() {
        let plan = ZonePlan::new(BTreeMap::from([
            ("a".to_string(), 3),
            ("b".to_string(), 2),
            ("c".to_string(), 2),
        ]));
        assert_eq!(plan.total(), 7);
        assert_eq!(plan.skew(), 1);
        assert_eq!(ZonePlan::default().skew(), 0);
    }
}
