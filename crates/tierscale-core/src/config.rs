//! Autoscaler configuration (TOML).
//!
//! ```toml
//! [engine]
//! cooldown = "5m"
//!
//! [primaries]
//! min_replicas = 3
//! max_replicas = 7
//!
//! [[primaries.metrics]]
//! kind = "cpu"
//! target = "70"
//! weight = 1.0
//!
//! [secondaries]
//! min_replicas = 1
//! max_replicas = 12
//!
//! [zones]
//! zones = ["a", "b", "c"]
//! max_zone_skew = 1
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{ScaleError, ScaleResult};
use crate::types::{MetricKind, MetricSpec, SourceKind, Tier};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoscalerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    pub primaries: TierConfig,
    pub secondaries: TierConfig,
    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub zones: Option<ZoneConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

/// Replica bounds, metrics and behavior for one tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

impl TierConfig {
    pub fn new(min_replicas: u32, max_replicas: u32, metrics: Vec<MetricSpec>) -> Self {
        Self {
            min_replicas,
            max_replicas,
            metrics,
            behavior: BehaviorConfig::default(),
        }
    }

    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }
}

// ── Behavior ──────────────────────────────────────────────────────

/// Flap-prevention rules, configured independently per direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BehaviorConfig {
    #[serde(default)]
    pub scale_up: ScalingRules,
    #[serde(default)]
    pub scale_down: ScalingRules,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingRules {
    /// An opposing decision inside this window suppresses the action.
    #[serde(default, with = "serde_str")]
    pub stabilization_window: Duration,
    /// Empty means the step size is unbounded.
    #[serde(default)]
    pub policies: Vec<StepPolicy>,
    #[serde(default)]
    pub select_policy: SelectPolicy,
}

impl Default for ScalingRules {
    fn default() -> Self {
        Self {
            stabilization_window: Duration::ZERO,
            policies: Vec::new(),
            select_policy: SelectPolicy::Max,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepPolicy {
    #[serde(rename = "type")]
    pub kind: PolicyKind,
    pub value: u32,
    #[serde(default = "default_period", with = "serde_str")]
    pub period: Duration,
}

fn default_period() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    /// Fixed number of replicas per period.
    Pods,
    /// Percentage of current replicas per period.
    Percent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectPolicy {
    /// Most permissive policy wins.
    #[default]
    Max,
    /// Most conservative policy wins.
    Min,
    /// No scaling in this direction.
    Disabled,
}

// ── Quorum & zones ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuorumConfig {
    #[serde(default = "default_min_healthy")]
    pub min_healthy_primaries: u32,
    #[serde(default)]
    pub allow_quorum_break: bool,
}

fn default_min_healthy() -> u32 {
    1
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            min_healthy_primaries: default_min_healthy(),
            allow_quorum_break: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneConfig {
    pub zones: Vec<String>,
    /// Tie-break order; zones not listed follow in `zones` order.
    #[serde(default)]
    pub zone_preference: Vec<String>,
    #[serde(default = "default_one")]
    pub min_replicas_per_zone: u32,
    #[serde(default = "default_one")]
    pub max_zone_skew: u32,
}

fn default_one() -> u32 {
    1
}

// ── Webhook ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_webhook_timeout", with = "serde_str")]
    pub timeout: Duration,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

// ── Collector ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorConfig {
    #[serde(default = "default_cache_ttl", with = "serde_str")]
    pub cache_ttl: Duration,
    #[serde(default = "default_fetch_timeout", with = "serde_str")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown", with = "serde_str")]
    pub breaker_cooldown: Duration,
    #[serde(default = "default_one")]
    pub breaker_success_threshold: u32,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_concurrency() -> usize {
    4
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_breaker_cooldown() -> Duration {
    Duration::from_secs(30)
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            fetch_timeout: default_fetch_timeout(),
            max_concurrency: default_concurrency(),
            breaker_failure_threshold: default_failure_threshold(),
            breaker_cooldown: default_breaker_cooldown(),
            breaker_success_threshold: 1,
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────

/// How per-metric ratios turn into a direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Any metric above the band scales up; all metrics below it scale down.
    #[default]
    EagerUpConservativeDown,
    /// Only the weighted composite score is compared with the band.
    Composite,
}

/// Which proposal wins when both the engine and the webhook produce one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arbitration {
    /// Webhook wins only with strictly higher confidence.
    #[default]
    HigherConfidence,
    /// Webhook wins whenever it answers validly.
    PreferWebhook,
    /// Webhook proposals are recorded but never applied.
    InternalOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Minimum time between scaling actions on the same tier.
    #[serde(default = "default_cooldown", with = "serde_str")]
    pub cooldown: Duration,
    /// Half-width of the no-action band around ratio 1.0.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub trigger_policy: TriggerPolicy,
    /// Entries kept per cluster tier.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Composite deviation that maps to full severity.
    #[serde(default = "default_severity_scale")]
    pub severity_scale: f64,
    #[serde(default)]
    pub arbitration: Arbitration,
}

fn default_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_tolerance() -> f64 {
    0.15
}

fn default_history_capacity() -> usize {
    64
}

fn default_severity_scale() -> f64 {
    0.5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            tolerance: default_tolerance(),
            trigger_policy: TriggerPolicy::default(),
            history_capacity: default_history_capacity(),
            severity_scale: default_severity_scale(),
            arbitration: Arbitration::default(),
        }
    }
}

// ── Loading & validation ──────────────────────────────────────────

impl AutoscalerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid autoscaler config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AutoscalerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A config with the given tier bounds and defaults everywhere else.
    pub fn with_tiers(primaries: TierConfig, secondaries: TierConfig) -> Self {
        Self {
            engine: EngineConfig::default(),
            collector: CollectorConfig::default(),
            primaries,
            secondaries,
            quorum: QuorumConfig::default(),
            zones: None,
            webhook: None,
        }
    }

    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Primaries => &self.primaries,
            Tier::Secondaries => &self.secondaries,
        }
    }

    /// Reject specs the engine cannot act on safely.
    pub fn validate(&self) -> ScaleResult<()> {
        for tier in Tier::ALL {
            validate_tier(tier, self.tier(tier))?;
        }

        let p = &self.primaries;
        let floor = p.min_replicas.max(self.quorum.min_healthy_primaries);
        let lowest_odd = if floor % 2 == 0 { floor + 1 } else { floor };
        if lowest_odd > p.max_replicas {
            return Err(config_err(format!(
                "primaries: no odd replica count in [{floor}, {}]",
                p.max_replicas
            )));
        }

        if let Some(zones) = &self.zones {
            if zones.zones.is_empty() {
                return Err(config_err("zones: at least one zone is required"));
            }
            let known: HashSet<&str> = zones.zones.iter().map(String::as_str).collect();
            if known.len() != zones.zones.len() {
                return Err(config_err("zones: duplicate zone names"));
            }
            if let Some(unknown) = zones
                .zone_preference
                .iter()
                .find(|z| !known.contains(z.as_str()))
            {
                return Err(config_err(format!("zones: preference names unknown zone {unknown}")));
            }
            if zones.max_zone_skew == 0 {
                return Err(config_err("zones: max_zone_skew must be at least 1"));
            }
        }

        if let Some(webhook) = &self.webhook {
            if !webhook.url.starts_with("http://") {
                return Err(config_err(format!("webhook: unsupported url {}", webhook.url)));
            }
            if webhook.timeout.is_zero() {
                return Err(config_err("webhook: timeout must be positive"));
            }
        }

        let c = &self.collector;
        if !(1..=8).contains(&c.max_concurrency) {
            return Err(config_err("collector: max_concurrency must be within 1..=8"));
        }
        if c.fetch_timeout < Duration::from_secs(1) || c.fetch_timeout > Duration::from_secs(30) {
            return Err(config_err("collector: fetch_timeout must be within 1s..=30s"));
        }
        if c.breaker_failure_threshold == 0 {
            return Err(config_err("collector: breaker_failure_threshold must be positive"));
        }

        let e = &self.engine;
        if !(0.0..1.0).contains(&e.tolerance) {
            return Err(config_err("engine: tolerance must be within [0, 1)"));
        }
        if e.severity_scale <= 0.0 {
            return Err(config_err("engine: severity_scale must be positive"));
        }
        if e.history_capacity == 0 {
            return Err(config_err("engine: history_capacity must be positive"));
        }
        Ok(())
    }
}

fn validate_tier(tier: Tier, config: &TierConfig) -> ScaleResult<()> {
    if config.min_replicas > config.max_replicas {
        return Err(config_err(format!(
            "{tier}: min_replicas {} exceeds max_replicas {}",
            config.min_replicas, config.max_replicas
        )));
    }
    for spec in &config.metrics {
        if !(spec.weight.is_finite() && spec.weight > 0.0) {
            return Err(config_err(format!(
                "{tier}: metric {} has non-positive weight",
                spec.label()
            )));
        }
        let needs_query =
            spec.kind == MetricKind::Custom || spec.source_kind() == SourceKind::Prometheus;
        if needs_query && spec.custom_query.is_none() {
            return Err(config_err(format!(
                "{tier}: metric {} needs custom_query",
                spec.label()
            )));
        }
        if spec.kind == MetricKind::Custom && spec.name.is_none() {
            return Err(config_err(format!("{tier}: custom metric needs a name")));
        }
    }
    Ok(())
}

fn config_err(msg: impl Into<String>) -> ScaleError {
    ScaleError::Config(msg.into())
}
