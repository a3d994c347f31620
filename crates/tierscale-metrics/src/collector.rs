//! Metrics collector — concurrent, cached, single-flight per cluster.
//!
//! Each `collect()` resolves the cluster's sources, fans them out over a
//! bounded worker pool (one task per source, individually timed out and
//! circuit-broken) and folds the readings into a `ClusterMetrics`.
//!
//! State is split per cluster: the outer map lock is held only long
//! enough to find the cluster's slot, so clusters never contend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use tierscale_core::{
    ClusterKey, ClusterMetrics, ClusterRef, CollectorConfig, MetricField, MetricSpec, Reading,
    ScaleError, ScaleResult, Tier,
};

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::cancel::Cancellation;
use crate::source::{HttpSourceResolver, MetricSource, SourceReading, SourceResolver};

/// Metric specs for both tiers of one cluster.
#[derive(Debug, Clone, Copy)]
pub struct TierSpecs<'a> {
    pub primaries: &'a [MetricSpec],
    pub secondaries: &'a [MetricSpec],
}

impl<'a> TierSpecs<'a> {
    pub fn for_tier(&self, tier: Tier) -> &'a [MetricSpec] {
        match tier {
            Tier::Primaries => self.primaries,
            Tier::Secondaries => self.secondaries,
        }
    }
}

struct CachedSnapshot {
    metrics: ClusterMetrics,
    fetched_at: Instant,
}

#[derive(Default)]
struct SlotState {
    cached: Option<CachedSnapshot>,
    /// Outcome of the most recent completed fetch, handed to callers that
    /// queued behind it.
    last: Option<ScaleResult<ClusterMetrics>>,
}

/// Everything the collector keeps for one cluster.
#[derive(Default)]
struct ClusterSlot {
    /// Bumped after every completed fetch.
    generation: AtomicU64,
    fetch: tokio::sync::Mutex<SlotState>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ClusterSlot {
    fn breaker(&self, source_id: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(source_id, config)))
            .clone()
    }
}

/// Result of one source task.
struct FetchOutcome {
    tier: Tier,
    source_id: String,
    result: ScaleResult<SourceReading>,
}

/// Collects per-tier metrics for clusters. Construct once per process and
/// share by reference.
pub struct MetricsCollector {
    config: CollectorConfig,
    resolver: Arc<dyn SourceResolver>,
    clusters: RwLock<HashMap<ClusterKey, Arc<ClusterSlot>>>,
}

impl MetricsCollector {
    pub fn new(config: CollectorConfig, resolver: Arc<dyn SourceResolver>) -> Self {
        Self {
            config,
            resolver,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    /// Collector fetching over HTTP from members and Prometheus.
    pub fn with_http_sources(config: CollectorConfig) -> Self {
        let resolver = Arc::new(HttpSourceResolver::new(config.fetch_timeout));
        Self::new(config, resolver)
    }

    /// Collect metrics for `cluster`.
    ///
    /// Serves a fresh cached snapshot when one exists. Concurrent callers
    /// for the same cluster share one fetch. Fails only when every source
    /// of a tier failed, or when `cancel` fires.
    pub async fn collect(
        &self,
        cluster: &ClusterRef,
        specs: TierSpecs<'_>,
        cancel: &Cancellation,
    ) -> ScaleResult<ClusterMetrics> {
        let key = cluster.key();
        let slot = self.slot(&key).await;
        let mut cancel = cancel.clone();

        let observed = slot.generation.load(Ordering::Acquire);
        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScaleError::Cancelled),
            guard = slot.fetch.lock() => guard,
        };

        if slot.generation.load(Ordering::Acquire) != observed
            && let Some(last) = &state.last
        {
            debug!(cluster = %key, "joined in-flight metrics fetch");
            return last.clone();
        }

        if let Some(cached) = &state.cached
            && cached.fetched_at.elapsed() < self.config.cache_ttl
        {
            debug!(cluster = %key, "serving cached metrics");
            return Ok(cached.metrics.clone());
        }

        let result = self.fetch_all(cluster, specs, &slot, &mut cancel).await;
        if matches!(result, Err(ScaleError::Cancelled)) {
            return result;
        }

        if let Ok(metrics) = &result {
            state.cached = Some(CachedSnapshot {
                metrics: metrics.clone(),
                fetched_at: Instant::now(),
            });
        }
        state.last = Some(result.clone());
        slot.generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Drop the cached snapshot for a cluster.
    pub async fn invalidate(&self, cluster_key: &str) {
        let slot = self.clusters.read().await.get(cluster_key).cloned();
        if let Some(slot) = slot {
            slot.fetch.lock().await.cached = None;
        }
    }

    /// Current breaker state for a source, if it has been used.
    pub async fn breaker_state(&self, cluster_key: &str, source_id: &str) -> Option<BreakerState> {
        let slot = self.clusters.read().await.get(cluster_key).cloned()?;
        let breakers = slot.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.get(source_id).map(|b| b.state())
    }

    async fn slot(&self, key: &str) -> Arc<ClusterSlot> {
        if let Some(slot) = self.clusters.read().await.get(key) {
            return slot.clone();
        }
        self.clusters
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    async fn fetch_all(
        &self,
        cluster: &ClusterRef,
        specs: TierSpecs<'_>,
        slot: &ClusterSlot,
        cancel: &mut Cancellation,
    ) -> ScaleResult<ClusterMetrics> {
        let key = cluster.key();
        let mut seen = HashSet::new();
        let sources: Vec<Arc<dyn MetricSource>> = Tier::ALL
            .iter()
            .flat_map(|&tier| self.resolver.resolve(cluster, tier, specs.for_tier(tier)))
            .filter(|s| seen.insert(s.id().to_string()))
            .collect();

        let mut attempted: HashMap<Tier, usize> = HashMap::new();
        for source in &sources {
            *attempted.entry(source.tier()).or_default() += 1;
        }

        let pool = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let breaker_config = BreakerConfig::from(&self.config);
        let timeout = self.config.fetch_timeout;
        let mut tasks = JoinSet::new();

        for source in sources {
            let breaker = slot.breaker(source.id(), breaker_config);
            let pool = pool.clone();
            tasks.spawn(async move {
                let tier = source.tier();
                let source_id = source.id().to_string();
                let result = match pool.acquire_owned().await {
                    Err(_) => Err(ScaleError::source_failed(&source_id, "worker pool closed")),
                    Ok(_permit) => {
                        if !breaker.allow() {
                            Err(ScaleError::CircuitOpen(source_id.clone()))
                        } else {
                            let result = match tokio::time::timeout(timeout, source.fetch()).await {
                                Ok(r) => r,
                                Err(_) => Err(ScaleError::source_failed(
                                    &source_id,
                                    format!("timed out after {timeout:?}"),
                                )),
                            };
                            match &result {
                                Ok(_) => breaker.record_success(),
                                Err(_) => breaker.record_failure(),
                            }
                            result
                        }
                    }
                };
                FetchOutcome { tier, source_id, result }
            });
        }

        let mut outcomes = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    debug!(cluster = %key, "metrics collection cancelled");
                    return Err(ScaleError::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => warn!(cluster = %key, error = %e, "metric fetch task failed"),
                },
            }
        }

        aggregate(&key, &attempted, outcomes)
    }
}

/// Fold source readings into a snapshot. Values reported by several
/// sources of the same tier (one per member) are averaged.
fn aggregate(
    cluster: &str,
    attempted: &HashMap<Tier, usize>,
    mut outcomes: Vec<FetchOutcome>,
) -> ScaleResult<ClusterMetrics> {
    // Join order is nondeterministic; sort so float sums are reproducible.
    outcomes.sort_by(|a, b| a.source_id.cmp(&b.source_id));

    let mut sums: BTreeMap<(Tier, MetricField), (f64, u32)> = BTreeMap::new();
    let mut succeeded: HashMap<Tier, usize> = HashMap::new();
    let mut degraded = false;

    for outcome in outcomes {
        match outcome.result {
            Ok(reading) => {
                *succeeded.entry(outcome.tier).or_default() += 1;
                for (field, value) in reading.values {
                    let entry = sums.entry((outcome.tier, field)).or_insert((0.0, 0));
                    entry.0 += value;
                    entry.1 += 1;
                }
            }
            Err(e) => {
                degraded = true;
                warn!(
                    %cluster,
                    tier = %outcome.tier,
                    source = %outcome.source_id,
                    error = %e,
                    "metric source failed, continuing degraded"
                );
            }
        }
    }

    for tier in Tier::ALL {
        let tried = attempted.get(&tier).copied().unwrap_or(0);
        if tried > 0 && succeeded.get(&tier).copied().unwrap_or(0) == 0 {
            return Err(ScaleError::MetricsUnavailable { tier });
        }
    }

    let mut metrics = ClusterMetrics {
        collected_at: epoch_millis(),
        degraded,
        ..Default::default()
    };
    for ((tier, field), (sum, count)) in sums {
        metrics
            .tier_mut(tier)
            .set(&field, Reading::fresh(sum / f64::from(count)));
    }
    Ok(metrics)
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
