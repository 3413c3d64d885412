//! Endpoints the worker calls while a run executes.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use fieldvis_models::{HeartbeatRequest, HeartbeatResponse, SaveLogsRequest, VideoCompleteRequest};

use crate::error::ApiResult;
use crate::handlers::json_body;
use crate::services::{CompleteResponse, SaveLogsResponse};
use crate::state::AppState;

pub async fn complete_video(
    State(state): State<AppState>,
    body: Result<Json<VideoCompleteRequest>, JsonRejection>,
) -> ApiResult<Json<CompleteResponse>> {
    let request = json_body(body)?;
    Ok(Json(state.progress.complete(request).await?))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let request = json_body(body)?;
    Ok(Json(state.progress.heartbeat(&request.run_id).await?))
}

pub async fn save_logs(
    State(state): State<AppState>,
    body: Result<Json<SaveLogsRequest>, JsonRejection>,
) -> ApiResult<Json<SaveLogsResponse>> {
    let request = json_body(body)?;
    Ok(Json(state.progress.save_logs(&request.run_id).await?))
}
