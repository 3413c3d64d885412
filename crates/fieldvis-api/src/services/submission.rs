//! Run submission.
//!
//! Ordering is claim, then create the run, then launch. A submission that
//! fails before the run exists leaves no claims behind.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use fieldvis_models::{
    resolve_settings, BackendKind, ClaimOutcome, ProcessingRun, RunId, SubmitRunRequest,
    SubmitRunResponse, VideoAsset, VideoId, VideoStatus,
};
use fieldvis_runner::LogSink;

use crate::config::OrchestratorConfig;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::services::{LaunchCoordinator, LaunchStatus};
use crate::store::{AssetCatalog, RunStore};

#[derive(Clone)]
pub struct SubmissionService {
    catalog: Arc<dyn AssetCatalog>,
    runs: Arc<dyn RunStore>,
    launch: LaunchCoordinator,
    config: Arc<OrchestratorConfig>,
}

/// Matched assets split by what a new run may do with them.
#[derive(Debug, Default)]
struct Partition {
    completed: Vec<VideoAsset>,
    in_progress: Vec<VideoAsset>,
    pending: Vec<VideoAsset>,
}

impl Partition {
    fn of(assets: Vec<VideoAsset>) -> Self {
        let mut partition = Self::default();
        for asset in assets {
            match asset.status {
                VideoStatus::Completed => partition.completed.push(asset),
                VideoStatus::Processing => partition.in_progress.push(asset),
                VideoStatus::Pending | VideoStatus::Failed => partition.pending.push(asset),
            }
        }
        partition
    }
}

/// Validated submission input.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSubmission {
    pub video_ids: Vec<VideoId>,
    pub backend: BackendKind,
}

/// Check the request shape and collapse duplicate ids, keeping first occurrence.
pub fn validate(request: &SubmitRunRequest) -> ApiResult<ValidatedSubmission> {
    if request.video_ids.is_empty() {
        return Err(ApiError::validation("videoIds must be a non-empty array"));
    }
    if request.video_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(ApiError::validation("videoIds must not contain empty ids"));
    }

    let backend: BackendKind = request
        .run_type
        .parse()
        .map_err(|e: fieldvis_models::ParseBackendKindError| ApiError::validation(e.to_string()))?;

    let mut seen = HashSet::new();
    let video_ids = request
        .video_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| seen.insert(*id))
        .map(VideoId::from)
        .collect();

    Ok(ValidatedSubmission { video_ids, backend })
}

impl SubmissionService {
    pub fn new(
        catalog: Arc<dyn AssetCatalog>,
        runs: Arc<dyn RunStore>,
        launch: LaunchCoordinator,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            catalog,
            runs,
            launch,
            config,
        }
    }

    /// Claim the pending videos of `request`, record a run and start its worker.
    pub async fn submit(
        &self,
        request: SubmitRunRequest,
        owner: Option<String>,
    ) -> ApiResult<SubmitRunResponse> {
        let ValidatedSubmission { video_ids, backend } = validate(&request)?;

        let assets = self.catalog.fetch_many(&video_ids).await?;
        if assets.is_empty() {
            return Err(ApiError::not_found("No videos found for the provided IDs"));
        }
        let not_found = (video_ids.len() - assets.len()) as u32;
        if not_found > 0 {
            warn!(
                requested = video_ids.len(),
                found = assets.len(),
                "{} requested videos were not found",
                not_found
            );
        }

        let partition = Partition::of(assets);
        let completed = partition.completed.len() as u32;
        let mut in_progress = partition.in_progress.len() as u32;
        if partition.pending.is_empty() {
            return Err(ApiError::nothing_to_do(format!(
                "No pending videos to process ({} already completed, {} already in progress)",
                completed, in_progress
            )));
        }

        let run_id = RunId::new();
        let mut claimed: Vec<VideoAsset> = Vec::with_capacity(partition.pending.len());
        for asset in partition.pending {
            match self.catalog.claim(&asset.id, &run_id).await {
                Ok(ClaimOutcome::Claimed) => claimed.push(asset),
                Ok(outcome) => {
                    debug!(run_id = %run_id, video_id = %asset.id, ?outcome, "Claim lost");
                    if !matches!(outcome, ClaimOutcome::AlreadyCompleted | ClaimOutcome::Missing) {
                        in_progress += 1;
                    }
                }
                Err(e) => {
                    self.release_claims(&run_id, &claimed).await;
                    return Err(e.into());
                }
            }
        }
        if claimed.is_empty() {
            return Err(ApiError::nothing_to_do(
                "Every pending video was claimed by another run",
            ));
        }

        let log_reference = LogSink::path_for(&self.config.run_log_dir, &run_id)
            .display()
            .to_string();
        let run = ProcessingRun::new(
            run_id.clone(),
            backend,
            claimed.iter().map(|a| a.id.clone()).collect(),
        )
        .with_owner(owner)
        .with_log_reference(log_reference.clone());

        if let Err(e) = self.runs.create(&run).await {
            self.release_claims(&run_id, &claimed).await;
            return Err(e.into());
        }
        metrics::record_run_submitted(backend.as_str());
        info!(
            run_id = %run_id,
            backend = %backend,
            videos = claimed.len(),
            "Created processing run"
        );

        let settings = resolve_settings(request.settings.as_ref());
        let message = match self.launch.start(&run, &claimed, settings).await {
            LaunchStatus::Started { .. } => format!(
                "Started {} run for {} videos",
                backend,
                claimed.len()
            ),
            LaunchStatus::SpawnFailed { .. } => {
                "Run created but the worker failed to start; see the run log".to_string()
            }
        };

        Ok(SubmitRunResponse {
            success: true,
            run_id: Some(run_id),
            videos_to_process: Some(run.total_videos),
            already_completed: Some(completed),
            already_in_progress: Some(in_progress),
            not_found: Some(not_found),
            log_reference: Some(log_reference),
            message: Some(message),
            error: None,
        })
    }

    async fn release_claims(&self, run_id: &RunId, claimed: &[VideoAsset]) {
        for asset in claimed {
            if let Err(e) = self.catalog.release(&asset.id, run_id).await {
                warn!(
                    run_id = %run_id,
                    video_id = %asset.id,
                    "Failed to release claim after aborted submission: {}",
                    e
                );
            }
        }
    }
}
