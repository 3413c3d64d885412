//! Run submission, status, log and cancellation handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldvis_models::{
    BackendKind, ProcessingRun, RunId, RunStatus, SubmitRunRequest, SubmitRunResponse,
    WorkerState,
};

use crate::auth::OptionalAuthUser;
use crate::error::ApiResult;
use crate::handlers::json_body;
use crate::services::CancelReport;
use crate::state::AppState;

/// Submit a batch of videos for processing.
pub async fn submit_run(
    State(state): State<AppState>,
    user: OptionalAuthUser,
    body: Result<Json<SubmitRunRequest>, JsonRejection>,
) -> ApiResult<Json<SubmitRunResponse>> {
    let request = json_body(body)?;
    let response = state.submission.submit(request, user.uid()).await?;
    Ok(Json(response))
}

/// Polling view of a run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub success: bool,
    pub run_id: RunId,
    pub status: RunStatus,
    pub worker_state: WorkerState,
    pub backend: BackendKind,
    pub total_videos: u32,
    pub videos_processed: u32,
    pub videos_failed: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub process_id: Option<u32>,
    pub cancel_requested: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub log_reference: Option<String>,
    pub error_message: Option<String>,
}

impl From<ProcessingRun> for RunSnapshot {
    fn from(run: ProcessingRun) -> Self {
        Self {
            success: true,
            run_id: run.id,
            status: run.status,
            worker_state: run.worker_state,
            backend: run.backend,
            total_videos: run.total_videos,
            videos_processed: run.videos_processed,
            videos_failed: run.videos_failed,
            started_at: run.started_at,
            completed_at: run.completed_at,
            process_id: run.process_id,
            cancel_requested: run.cancel_requested,
            last_heartbeat: run.last_heartbeat,
            log_reference: run.log_reference,
            error_message: run.error_message,
        }
    }
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    let run = state.progress.require_run(&RunId::from_string(run_id)).await?;
    Ok(Json(RunSnapshot::from(run)))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Maximum bytes to return from the end of the log
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogsResponse {
    pub success: bool,
    pub run_id: RunId,
    pub log_reference: Option<String>,
    pub content: String,
}

pub async fn get_run_logs(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<RunLogsResponse>> {
    let run_id = RunId::from_string(run_id);
    let run = state.progress.require_run(&run_id).await?;
    let max_bytes = query
        .tail
        .unwrap_or(state.orchestrator.log_tail_max_bytes);
    let content = state.progress.read_tail(&run_id, max_bytes).await?;

    Ok(Json(RunLogsResponse {
        success: true,
        run_id,
        log_reference: run.log_reference,
        content,
    }))
}

/// Cancel a running run.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<CancelReport>> {
    let report = state
        .cancellation
        .cancel(&RunId::from_string(run_id))
        .await?;
    Ok(Json(report))
}
