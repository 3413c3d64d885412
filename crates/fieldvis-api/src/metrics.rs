//! Prometheus metrics for the API server.

use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex_lite::Regex;

/// Install the Prometheus recorder and return the render handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "fieldvis_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "fieldvis_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "fieldvis_http_requests_in_flight";

    // Run metrics
    pub const RUNS_SUBMITTED_TOTAL: &str = "fieldvis_runs_submitted_total";
    pub const RUN_SPAWN_FAILURES_TOTAL: &str = "fieldvis_run_spawn_failures_total";
    pub const RUNS_CANCELLED_TOTAL: &str = "fieldvis_runs_cancelled_total";
    pub const WORKER_EXITS_TOTAL: &str = "fieldvis_worker_exits_total";
    pub const VIDEOS_REPORTED_TOTAL: &str = "fieldvis_videos_reported_total";
    pub const STALE_RUNS_TOTAL: &str = "fieldvis_stale_runs_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "fieldvis_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_run_submitted(backend: &str) {
    counter!(names::RUNS_SUBMITTED_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn record_spawn_failure() {
    counter!(names::RUN_SPAWN_FAILURES_TOTAL).increment(1);
}

pub fn record_run_cancelled(outcome: &str) {
    counter!(names::RUNS_CANCELLED_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// `outcome` is `clean` or `crashed`.
pub fn record_worker_exit(outcome: &str) {
    counter!(names::WORKER_EXITS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_video_reported(success: bool) {
    let result = if success { "succeeded" } else { "failed" };
    counter!(names::VIDEOS_REPORTED_TOTAL, "result" => result).increment(1);
}

pub fn record_stale_run() {
    counter!(names::STALE_RUNS_TOTAL).increment(1);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", sanitize_path(endpoint))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .expect("static regex")
    })
}

fn run_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/runs/[^/]+").expect("static regex"))
}

/// Sanitize path for metrics labels (remove IDs, etc.).
fn sanitize_path(path: &str) -> String {
    let path = uuid_pattern().replace_all(path, ":id");
    run_pattern().replace_all(&path, "/runs/:run_id").to_string()
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
