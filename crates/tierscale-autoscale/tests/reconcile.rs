//! End-to-end reconciliation tests.
//!
//! Member metrics endpoints, Prometheus and the webhook are stood in for
//! by local HTTP/1 servers on 127.0.0.1.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use tierscale_autoscale::*;
use tierscale_core::*;
use tierscale_metrics::{Cancellation, PrometheusRecorder};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Test servers ──────────────────────────────────────────────────

/// Serve `body` after `delay` to every request, capturing request bodies.
async fn serve(body: &'static str, delay: Duration, seen: Arc<Mutex<Vec<Bytes>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let seen = seen.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let seen = seen.clone();
                    async move {
                        let bytes = req.into_body().collect().await.unwrap().to_bytes();
                        seen.lock().unwrap().push(bytes);
                        tokio::time::sleep(delay).await;
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("content-type", "application/json")
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    addr
}

async fn member(body: &'static str) -> String {
    serve(body, Duration::ZERO, Arc::default()).await.to_string()
}

/// An address nothing listens on.
async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

// ── Fixtures ──────────────────────────────────────────────────────

fn cluster(primaries: Vec<String>, secondaries: Vec<String>) -> ClusterRef {
    ClusterRef {
        namespace: "prod".to_string(),
        name: "graph".to_string(),
        primary_members: primaries,
        secondary_members: secondaries,
        prometheus_url: None,
    }
}

fn live(primaries: u32, secondaries: u32) -> LiveState {
    LiveState {
        replicas: TierReplicas { primaries, secondaries },
        healthy_primaries: primaries,
    }
}

fn base_config() -> AutoscalerConfig {
    let cpu = || vec![MetricSpec::new(MetricKind::Cpu, "70", 1.0)];
    let mut config = AutoscalerConfig::with_tiers(TierConfig::new(3, 7, cpu()), TierConfig::new(2, 10, cpu()));
    config.quorum.min_healthy_primaries = 3;
    config
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn primaries_scale_up_to_next_odd_count() {
    init_tracing();
    let p = member(r#"{"cpu": 85.0}"#).await;
    let s = member(r#"{"cpu": 70.0}"#).await;

    let autoscaler = Autoscaler::new(base_config()).unwrap();
    let out = autoscaler
        .reconcile(&cluster(vec![p], vec![s]), live(3, 4), &Cancellation::never())
        .await;

    assert_eq!(out.primaries.decision.action, ScalingAction::ScaleUp);
    assert_eq!(out.primaries.decision.target_replicas, 5);
    assert!(out.primaries.decision.confidence > 0.0);
    assert_eq!(out.secondaries.decision.action, ScalingAction::NoChange);
    assert!(!out.degraded);
}

#[tokio::test]
async fn eager_up_and_conservative_down_over_http() {
    init_tracing();
    let mut config = base_config();
    config.secondaries.metrics = vec![
        MetricSpec::new(MetricKind::Cpu, "70", 1.0),
        MetricSpec::new(MetricKind::Memory, "80", 1.0),
    ];

    let up = member(r#"{"cpu": 85.0, "memory": 50.0}"#).await;
    let p = member(r#"{"cpu": 70.0}"#).await;
    let out = Autoscaler::new(config.clone())
        .unwrap()
        .reconcile(&cluster(vec![p.clone()], vec![up]), live(3, 4), &Cancellation::never())
        .await;
    assert_eq!(out.secondaries.decision.action, ScalingAction::ScaleUp);

    let mixed = member(r#"{"cpu": 40.0, "memory": 90.0}"#).await;
    let out = Autoscaler::new(config)
        .unwrap()
        .reconcile(&cluster(vec![p], vec![mixed]), live(3, 4), &Cancellation::never())
        .await;
    assert_eq!(out.secondaries.decision.action, ScalingAction::NoChange);
}

#[tokio::test]
async fn secondaries_spread_over_zones() {
    init_tracing();
    let mut config = base_config();
    config.zones = Some(ZoneConfig {
        zones: vec!["a".into(), "b".into(), "c".into()],
        zone_preference: vec![],
        min_replicas_per_zone: 1,
        max_zone_skew: 1,
    });

    let p = member(r#"{"cpu": 70.0}"#).await;
    // ceil(4 × 120/70) = 7
    let s = member(r#"{"cpu": 120.0}"#).await;
    let out = Autoscaler::new(config)
        .unwrap()
        .reconcile(&cluster(vec![p], vec![s]), live(3, 4), &Cancellation::never())
        .await;

    assert_eq!(out.secondaries.decision.target_replicas, 7);
    let plan = out.secondaries.zone_plan.unwrap();
    assert_eq!(plan.get("a"), Some(3));
    assert_eq!(plan.get("b"), Some(2));
    assert_eq!(plan.get("c"), Some(2));
}

fn webhook_config(addr: SocketAddr, timeout: Duration) -> WebhookConfig {
    WebhookConfig {
        url: format!("http://{addr}/decide"),
        method: "POST".to_string(),
        timeout,
        enabled: true,
    }
}

const WEBHOOK_REPLY: &str =
    r#"{"action":"scale_up","target_replicas":{"secondaries":6},"reason":"read burst forecast","confidence":0.95}"#;

#[tokio::test]
async fn confident_webhook_is_adopted() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook = serve(WEBHOOK_REPLY, Duration::ZERO, seen.clone()).await;

    let mut config = base_config();
    config.webhook = Some(webhook_config(hook, Duration::from_secs(2)));

    let p = member(r#"{"cpu": 70.0}"#).await;
    // Internal engine wants 4 → 3 with confidence ≈ 0.57.
    let s = member(r#"{"cpu": 50.0}"#).await;
    let out = Autoscaler::new(config)
        .unwrap()
        .reconcile(&cluster(vec![p], vec![s]), live(3, 4), &Cancellation::never())
        .await;

    let t = &out.secondaries;
    assert_eq!(t.internal.target_replicas, 3);
    assert_eq!(t.webhook.as_ref().unwrap().target_replicas, 6);
    assert_eq!(t.source, DecisionSource::Webhook);
    assert_eq!(t.decision.target_replicas, 6);
    assert_eq!(t.decision.action, ScalingAction::ScaleUp);
    // Primaries were not named by the webhook.
    assert_eq!(out.primaries.source, DecisionSource::Internal);

    let bodies = seen.lock().unwrap();
    let request: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(request["cluster"], "graph");
    assert_eq!(request["namespace"], "prod");
    assert_eq!(request["current_replicas"]["secondaries"], 4);
    assert!(request["metrics"]["secondary"].is_object());
}

#[tokio::test]
async fn webhook_timeout_falls_back_to_internal() {
    init_tracing();
    let hook = serve(WEBHOOK_REPLY, Duration::from_secs(3), Arc::default()).await;

    let mut config = base_config();
    config.webhook = Some(webhook_config(hook, Duration::from_millis(200)));

    let p = member(r#"{"cpu": 70.0}"#).await;
    let s = member(r#"{"cpu": 50.0}"#).await;

    let started = std::time::Instant::now();
    let out = Autoscaler::new(config)
        .unwrap()
        .reconcile(&cluster(vec![p], vec![s]), live(3, 4), &Cancellation::never())
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let t = &out.secondaries;
    assert!(t.webhook.is_none());
    assert_eq!(t.source, DecisionSource::Internal);
    assert_eq!(t.decision.target_replicas, 3);
}

#[tokio::test]
async fn malformed_webhook_reply_falls_back() {
    init_tracing();
    let hook = serve(r#"{"action":"sideways"}"#, Duration::ZERO, Arc::default()).await;

    let mut config = base_config();
    config.webhook = Some(webhook_config(hook, Duration::from_secs(2)));

    let p = member(r#"{"cpu": 70.0}"#).await;
    let s = member(r#"{"cpu": 50.0}"#).await;
    let out = Autoscaler::new(config)
        .unwrap()
        .reconcile(&cluster(vec![p], vec![s]), live(3, 4), &Cancellation::never())
        .await;
    assert_eq!(out.secondaries.source, DecisionSource::Internal);
    assert_eq!(out.secondaries.decision.target_replicas, 3);
}

#[tokio::test]
async fn failed_member_degrades_without_failing() {
    init_tracing();
    let healthy = member(r#"{"cpu": 85.0}"#).await;
    let down = dead_address().await;
    let s = member(r#"{"cpu": 70.0}"#).await;

    let out = Autoscaler::new(base_config())
        .unwrap()
        .reconcile(&cluster(vec![healthy, down], vec![s]), live(3, 4), &Cancellation::never())
        .await;
    assert!(out.degraded);
    assert_eq!(out.primaries.decision.target_replicas, 5);
}

#[tokio::test]
async fn all_members_down_holds() {
    init_tracing();
    let p = member(r#"{"cpu": 85.0}"#).await;
    let down = dead_address().await;

    let recorder = Arc::new(PrometheusRecorder::new());
    let autoscaler = Autoscaler::new(base_config()).unwrap().with_recorder(recorder.clone());
    let out = autoscaler
        .reconcile(&cluster(vec![p], vec![down]), live(3, 4), &Cancellation::never())
        .await;

    assert_eq!(out.primaries.decision.action, ScalingAction::NoChange);
    assert_eq!(out.secondaries.decision.action, ScalingAction::NoChange);
    assert!(recorder.render().contains("direction=\"none\"} 1"));
}

#[tokio::test]
async fn prometheus_custom_metric_drives_secondaries() {
    init_tracing();
    let prom = serve(
        r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1700000000,"300"]}]}}"#,
        Duration::ZERO,
        Arc::default(),
    )
    .await;

    let mut config = base_config();
    config.secondaries.metrics = vec![MetricSpec::custom("read_qps", "sum(rate(reads_total[1m]))", "150", 1.0)];

    let p = member(r#"{"cpu": 70.0}"#).await;
    let mut c = cluster(vec![p], vec![]);
    c.prometheus_url = Some(format!("http://{prom}"));

    let out = Autoscaler::new(config)
        .unwrap()
        .reconcile(&c, live(3, 4), &Cancellation::never())
        .await;
    // ratio 2.0 → 8
    assert_eq!(out.secondaries.decision.target_replicas, 8);
}

#[tokio::test]
async fn overlapping_reconciles_for_one_cluster_serialize() {
    init_tracing();
    let p = member(r#"{"cpu": 85.0}"#).await;
    let s = member(r#"{"cpu": 70.0}"#).await;
    let c = cluster(vec![p], vec![s]);
    let autoscaler = Arc::new(Autoscaler::new(base_config()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let a = autoscaler.clone();
        let c = c.clone();
        handles.push(tokio::spawn(async move {
            a.reconcile(&c, live(3, 4), &Cancellation::never()).await
        }));
    }
    let mut ups = 0;
    for h in handles {
        if h.await.unwrap().primaries.decision.action == ScalingAction::ScaleUp {
            ups += 1;
        }
    }
    // The first cycle scales; the rest hit its cooldown.
    assert_eq!(ups, 1);
    assert_eq!(autoscaler.history("prod/graph").await.unwrap().primaries.len(), 4);
}
