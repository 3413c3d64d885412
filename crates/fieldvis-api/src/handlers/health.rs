//! Liveness and readiness probes.

use std::future::Future;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

/// Liveness probe; never touches dependencies.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyCheck {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DependencyCheck {
    async fn probe<E: std::fmt::Display>(check: impl Future<Output = Result<(), E>>) -> Self {
        let start = Instant::now();
        let result = check.await;
        Self {
            ok: result.is_ok(),
            latency_ms: start.elapsed().as_millis() as u64,
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub status: &'static str,
    /// Run record store reachability
    pub store: DependencyCheck,
    /// Whether the worker program resolves on this host
    pub worker_program: DependencyCheck,
}

/// Readiness probe. 503 while the store is unreachable or the worker program is missing.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let store = DependencyCheck::probe(state.runs.ping()).await;
    let worker_program =
        DependencyCheck::probe(async { state.launcher.resolve_program().map(|_| ()) }).await;

    let ready = store.ok && worker_program.ok;
    let (code, status) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(ReadinessResponse {
            status,
            store,
            worker_program,
        }),
    )
}
