//! Metric sources: member probes and Prometheus instant queries.
//!
//! A source is one independently failing fetch. The collector runs each
//! source in its own task behind its own circuit breaker.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use tierscale_core::{ClusterRef, MetricField, MetricSpec, ScaleError, ScaleResult, SourceKind, Tier};

use crate::http;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Values returned by one successful fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceReading {
    pub values: Vec<(MetricField, f64)>,
}

/// A single fetchable metric source.
pub trait MetricSource: Send + Sync {
    /// Stable identifier; breakers are keyed by it.
    fn id(&self) -> &str;

    fn tier(&self) -> Tier;

    fn fetch(&self) -> BoxFuture<'_, ScaleResult<SourceReading>>;
}

/// Turns a cluster and its metric specs into the sources to fetch.
pub trait SourceResolver: Send + Sync {
    fn resolve(
        &self,
        cluster: &ClusterRef,
        tier: Tier,
        specs: &[MetricSpec],
    ) -> Vec<Arc<dyn MetricSource>>;
}

// ── Member probe ──────────────────────────────────────────────────

/// JSON served by a member's metrics endpoint. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct MemberPayload {
    cpu: Option<f64>,
    memory: Option<f64>,
    query_latency_ms: Option<f64>,
    connections: Option<f64>,
    throughput: Option<f64>,
}

/// Probes `GET http://{address}/metrics` on one cluster member.
pub struct MemberProbe {
    id: String,
    tier: Tier,
    address: String,
    timeout: Duration,
}

impl MemberProbe {
    pub fn new(tier: Tier, address: &str, timeout: Duration) -> Self {
        Self {
            id: format!("{tier}/member/{address}"),
            tier,
            address: address.to_string(),
            timeout,
        }
    }

    async fn probe(&self) -> ScaleResult<SourceReading> {
        let url = format!("http://{}/metrics", self.address);
        let resp = http::get(&url, self.timeout)
            .await
            .map_err(|e| ScaleError::source_failed(&self.id, e))?;
        if !resp.is_success() {
            return Err(ScaleError::source_failed(
                &self.id,
                format!("status {}", resp.status),
            ));
        }
        let payload: MemberPayload = serde_json::from_slice(&resp.body)
            .map_err(|e| ScaleError::source_failed(&self.id, e))?;

        let values = [
            (MetricField::Cpu, payload.cpu),
            (MetricField::Memory, payload.memory),
            (MetricField::QueryLatency, payload.query_latency_ms),
            (MetricField::ConnectionCount, payload.connections),
            (MetricField::Throughput, payload.throughput),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.filter(|v| v.is_finite()).map(|v| (field, v)))
        .collect();

        Ok(SourceReading { values })
    }
}

impl MetricSource for MemberProbe {
    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn fetch(&self) -> BoxFuture<'_, ScaleResult<SourceReading>> {
        Box::pin(self.probe())
    }
}

// ── Prometheus query ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: serde_json::Value,
}

impl PromData {
    /// The sample string of a scalar, or of the first vector element.
    fn first_sample(&self) -> Option<&str> {
        let pair = match self.result_type.as_str() {
            "vector" => self.result.get(0)?.get("value")?,
            "scalar" => &self.result,
            _ => return None,
        };
        pair.get(1)?.as_str()
    }
}

/// Runs one PromQL instant query and stores the first sample in `field`.
pub struct PrometheusQuery {
    id: String,
    tier: Tier,
    url: String,
    field: MetricField,
    timeout: Duration,
}

impl PrometheusQuery {
    pub fn new(tier: Tier, base_url: &str, query: &str, field: MetricField, timeout: Duration) -> Self {
        Self {
            id: format!("{tier}/prometheus/{field}"),
            tier,
            url: format!(
                "{}/api/v1/query?query={}",
                base_url.trim_end_matches('/'),
                http::encode_query_component(query)
            ),
            field,
            timeout,
        }
    }

    async fn query(&self) -> ScaleResult<SourceReading> {
        let resp = http::get(&self.url, self.timeout)
            .await
            .map_err(|e| ScaleError::source_failed(&self.id, e))?;
        let parsed: PromResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| ScaleError::source_failed(&self.id, e))?;
        if parsed.status != "success" {
            return Err(ScaleError::source_failed(
                &self.id,
                parsed.error.unwrap_or_else(|| parsed.status.clone()),
            ));
        }

        let raw = parsed
            .data
            .as_ref()
            .and_then(PromData::first_sample)
            .ok_or_else(|| ScaleError::source_failed(&self.id, "query returned no samples"))?;

        let value: f64 = raw
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| ScaleError::source_failed(&self.id, format!("non-numeric sample {raw:?}")))?;

        Ok(SourceReading {
            values: vec![(self.field.clone(), value)],
        })
    }
}

impl MetricSource for PrometheusQuery {
    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn fetch(&self) -> BoxFuture<'_, ScaleResult<SourceReading>> {
        Box::pin(self.query())
    }
}

// ── Resolver ──────────────────────────────────────────────────────

/// Default resolver: one probe per member when any member-sourced metric
/// is configured, plus one query per Prometheus-sourced metric.
pub struct HttpSourceResolver {
    timeout: Duration,
}

impl HttpSourceResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SourceResolver for HttpSourceResolver {
    fn resolve(
        &self,
        cluster: &ClusterRef,
        tier: Tier,
        specs: &[MetricSpec],
    ) -> Vec<Arc<dyn MetricSource>> {
        let mut sources: Vec<Arc<dyn MetricSource>> = Vec::new();

        if specs.iter().any(|s| s.source_kind() == SourceKind::Member) {
            for member in cluster.members(tier) {
                sources.push(Arc::new(MemberProbe::new(tier, member, self.timeout)));
            }
        }

        let mut seen = HashSet::new();
        for spec in specs.iter().filter(|s| s.source_kind() == SourceKind::Prometheus) {
            let (Some(base), Some(query)) = (&cluster.prometheus_url, &spec.custom_query) else {
                warn!(
                    cluster = %cluster.key(),
                    %tier,
                    metric = %spec.label(),
                    "prometheus metric configured without url or query, skipping"
                );
                continue;
            };
            let field = spec.field();
            if seen.insert(field.clone()) {
                sources.push(Arc::new(PrometheusQuery::new(tier, base, query, field, self.timeout)));
            }
        }

        sources
    }
}
