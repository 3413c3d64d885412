//! API routes.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::{
    cancel_run, complete_video, get_run, get_run_logs, health, heartbeat, ready, save_logs,
    submit_run,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, rate_limit_middleware, request_id, request_logging, security_headers,
    ClientRateLimiter,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    // Caller-facing routes
    let run_routes = Router::new()
        .route("/process", post(submit_run))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/logs", get(get_run_logs))
        .route("/runs/:run_id/cancel", post(cancel_run));

    let rate_limiter = Arc::new(ClientRateLimiter::new(state.config.rate_limit_rps));
    let run_routes = run_routes.layer(middleware::from_fn_with_state(
        rate_limiter,
        rate_limit_middleware,
    ));

    // Worker callbacks; a busy worker heartbeats and reports from one address
    let callback_routes = Router::new()
        .route("/process/complete", post(complete_video))
        .route("/process/heartbeat", post(heartbeat))
        .route("/process/save-logs", post(save_logs));

    let api_routes = Router::new().merge(run_routes).merge(callback_routes);

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api/motion-analysis", api_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
