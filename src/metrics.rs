//! Prometheus metrics for the proxy
//!
//! One [`ProxyMetrics`] registry is created per server and shared through
//! `Arc` with the middleware that records into it:
//! - Request/response metrics (totals, status codes, latency)
//! - Netfilter denials
//! - Authentication outcomes per verifier
//! - Upstream failures
//!
//! The registry is exported in Prometheus text format on the separate
//! metrics listener, never on the traffic port.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use tower_http::trace::TraceLayer;

const PREFIX: &str = "kube_auth_proxy";

/// Metrics registry shared by the filter chain of one server
pub struct ProxyMetrics {
    requests: RequestMetrics,
    auth: AuthMetrics,
    start_time: Instant,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            requests: RequestMetrics::new(),
            auth: AuthMetrics::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record a request entering the chain
    pub fn request_start(&self) {
        self.requests.total.fetch_add(1, Ordering::Relaxed);
        self.requests.in_progress.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request leaving the chain
    pub fn request_end(&self, status_code: u16, latency: Duration) {
        self.requests.in_progress.fetch_sub(1, Ordering::Relaxed);
        self.requests.latency.record(latency);
        self.requests
            .by_status
            .entry(status_code)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn netfilter_denied(&self) {
        self.auth.netfilter_denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Credit an admitted request to `verifier`
    pub fn auth_admitted(&self, verifier: &str) {
        if let Some(counter) = self.auth.admitted.get(verifier) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.auth
            .admitted
            .entry(verifier.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// No verifier admitted the request
    pub fn auth_failure(&self) {
        self.auth.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.requests.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut output = String::with_capacity(4096);

        let _ = writeln!(output, "# HELP {PREFIX}_uptime_seconds Server uptime in seconds");
        let _ = writeln!(output, "# TYPE {PREFIX}_uptime_seconds gauge");
        let _ = writeln!(output, "{PREFIX}_uptime_seconds {}", self.uptime_secs());

        self.requests.export_prometheus(&mut output);
        self.auth.export_prometheus(&mut output);

        output
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = &self.requests;
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            requests_total: requests.total.load(Ordering::Relaxed),
            requests_in_progress: requests.in_progress.load(Ordering::Relaxed),
            responses: requests
                .by_status
                .iter()
                .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
                .collect(),
            upstream_errors: requests.upstream_errors.load(Ordering::Relaxed),
            latency_mean_ms: requests.latency.mean_ms(),
            netfilter_denied: self.auth.netfilter_denied.load(Ordering::Relaxed),
            auth_admitted: self
                .auth
                .admitted
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            auth_failures: self.auth.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the registry, served as JSON
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests_total: u64,
    pub requests_in_progress: u64,
    pub responses: BTreeMap<u16, u64>,
    pub upstream_errors: u64,
    pub latency_mean_ms: f64,
    pub netfilter_denied: u64,
    pub auth_admitted: BTreeMap<String, u64>,
    pub auth_failures: u64,
}

// ============================================================================
// Request Metrics
// ============================================================================

struct RequestMetrics {
    total: AtomicU64,
    in_progress: AtomicU64,
    /// Responses keyed by status code
    by_status: DashMap<u16, AtomicU64>,
    upstream_errors: AtomicU64,
    latency: Latency,
}

impl RequestMetrics {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            in_progress: AtomicU64::new(0),
            by_status: DashMap::new(),
            upstream_errors: AtomicU64::new(0),
            latency: Latency::new(),
        }
    }

    fn export_prometheus(&self, output: &mut String) {
        use std::fmt::Write;

        let _ = writeln!(output, "# HELP {PREFIX}_requests_total Total requests received");
        let _ = writeln!(output, "# TYPE {PREFIX}_requests_total counter");
        let _ = writeln!(
            output,
            "{PREFIX}_requests_total {}",
            self.total.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP {PREFIX}_requests_in_progress Requests currently being served");
        let _ = writeln!(output, "# TYPE {PREFIX}_requests_in_progress gauge");
        let _ = writeln!(
            output,
            "{PREFIX}_requests_in_progress {}",
            self.in_progress.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP {PREFIX}_responses_total Responses by status code");
        let _ = writeln!(output, "# TYPE {PREFIX}_responses_total counter");
        let mut statuses: Vec<(u16, u64)> = self
            .by_status
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        statuses.sort_unstable();
        for (code, count) in statuses {
            let _ = writeln!(output, "{PREFIX}_responses_total{{code=\"{code}\"}} {count}");
        }

        let _ = writeln!(output, "# HELP {PREFIX}_upstream_errors_total Failed upstream round-trips");
        let _ = writeln!(output, "# TYPE {PREFIX}_upstream_errors_total counter");
        let _ = writeln!(
            output,
            "{PREFIX}_upstream_errors_total {}",
            self.upstream_errors.load(Ordering::Relaxed)
        );

        self.latency
            .write(output, &format!("{PREFIX}_request_latency_seconds"));
    }
}

// ============================================================================
// Auth Metrics
// ============================================================================

struct AuthMetrics {
    netfilter_denied: AtomicU64,
    /// Admissions keyed by verifier name
    admitted: DashMap<String, AtomicU64>,
    failures: AtomicU64,
}

impl AuthMetrics {
    fn new() -> Self {
        Self {
            netfilter_denied: AtomicU64::new(0),
            admitted: DashMap::new(),
            failures: AtomicU64::new(0),
        }
    }

    fn export_prometheus(&self, output: &mut String) {
        use std::fmt::Write;

        let _ = writeln!(output, "# HELP {PREFIX}_netfilter_denied_total Requests rejected by the network allow-list");
        let _ = writeln!(output, "# TYPE {PREFIX}_netfilter_denied_total counter");
        let _ = writeln!(
            output,
            "{PREFIX}_netfilter_denied_total {}",
            self.netfilter_denied.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP {PREFIX}_auth_admitted_total Requests admitted per verifier");
        let _ = writeln!(output, "# TYPE {PREFIX}_auth_admitted_total counter");
        let mut admitted: Vec<(String, u64)> = self
            .admitted
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        admitted.sort();
        for (verifier, count) in admitted {
            let _ = writeln!(
                output,
                "{PREFIX}_auth_admitted_total{{verifier=\"{verifier}\"}} {count}"
            );
        }

        let _ = writeln!(output, "# HELP {PREFIX}_auth_failures_total Requests no verifier admitted");
        let _ = writeln!(output, "# TYPE {PREFIX}_auth_failures_total counter");
        let _ = writeln!(
            output,
            "{PREFIX}_auth_failures_total {}",
            self.failures.load(Ordering::Relaxed)
        );
    }
}

// ============================================================================
// Latency
// ============================================================================

/// Upper bounds of the latency buckets in seconds (the Prometheus client defaults)
const LATENCY_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Request latency, exported as a cumulative histogram
struct Latency {
    /// Per-bucket counts, not cumulative; the extra slot is `+Inf`
    counts: [AtomicU64; LATENCY_BUCKETS.len() + 1],
    sum_micros: AtomicU64,
}

impl Latency {
    fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let slot = LATENCY_BUCKETS.partition_point(|&le| le < secs);
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    fn mean_ms(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0 / n as f64,
        }
    }

    fn write(&self, output: &mut String, name: &str) {
        use std::fmt::Write;

        let _ = writeln!(output, "# HELP {name} Time from entering the chain to the response head");
        let _ = writeln!(output, "# TYPE {name} histogram");

        let mut seen = 0;
        let bounds = LATENCY_BUCKETS.iter().map(|le| le.to_string());
        for (le, count) in bounds.chain(["+Inf".to_string()]).zip(&self.counts) {
            seen += count.load(Ordering::Relaxed);
            let _ = writeln!(output, "{name}_bucket{{le=\"{le}\"}} {seen}");
        }
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(output, "{name}_sum {sum}");
        let _ = writeln!(output, "{name}_count {seen}");
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

/// Count every request passing through the chain and time its response
pub async fn metrics_middleware(
    State(metrics): State<Arc<ProxyMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    metrics.request_start();
    let response = next.run(request).await;
    metrics.request_end(response.status().as_u16(), start.elapsed());
    response
}

/// Router for the metrics listener
pub fn metrics_router(metrics: Arc<ProxyMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_handler))
        .route("/metrics/json", get(json_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

async fn prometheus_handler(State(metrics): State<Arc<ProxyMetrics>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.export_prometheus(),
    )
        .into_response()
}

async fn json_handler(State(metrics): State<Arc<ProxyMetrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}
