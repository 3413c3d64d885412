//! Worker callbacks: per-video results, heartbeats and log snapshots.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use fieldvis_models::{
    HeartbeatResponse, ProcessingRun, RunId, RunStatus, VideoCompleteRequest,
};
use fieldvis_runner::LogSink;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::store::{AssetCatalog, RunStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    /// False when this video had already reported
    pub recorded: bool,
    pub run_status: RunStatus,
    pub videos_processed: u32,
    pub videos_failed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveLogsResponse {
    pub success: bool,
    pub bytes_saved: usize,
}

#[derive(Clone)]
pub struct ProgressService {
    catalog: Arc<dyn AssetCatalog>,
    runs: Arc<dyn RunStore>,
    log_dir: PathBuf,
    log_tail_max_bytes: usize,
}

impl ProgressService {
    pub fn new(
        catalog: Arc<dyn AssetCatalog>,
        runs: Arc<dyn RunStore>,
        log_dir: PathBuf,
        log_tail_max_bytes: usize,
    ) -> Self {
        Self {
            catalog,
            runs,
            log_dir,
            log_tail_max_bytes,
        }
    }

    /// Count one video result; repeated reports for the same video are no-ops.
    pub async fn complete(&self, request: VideoCompleteRequest) -> ApiResult<CompleteResponse> {
        let run = self.require_run(&request.run_id).await?;
        if !run.contains_video(&request.video_id) {
            return Err(ApiError::validation(format!(
                "Video {} is not part of run {}",
                request.video_id, request.run_id
            )));
        }

        let outcome = request.outcome();
        let recorded = AtomicBool::new(false);
        let run = self
            .runs
            .modify(&request.run_id, &|run: &mut ProcessingRun| {
                let counted = run.record_video_result(&request.video_id, outcome);
                recorded.store(counted, Ordering::SeqCst);
                counted
            })
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Run {} not found", request.run_id)))?;
        let recorded = recorded.load(Ordering::SeqCst);

        if recorded {
            metrics::record_video_reported(request.success);
            let updated = self
                .catalog
                .record_result(
                    &request.video_id,
                    &request.run_id,
                    outcome,
                    request.motion_analysis_path.clone(),
                    request.error.clone(),
                )
                .await?;
            if !updated {
                debug!(
                    run_id = %request.run_id,
                    video_id = %request.video_id,
                    "Run no longer holds the claim; catalog left unchanged"
                );
            }
            info!(
                run_id = %request.run_id,
                video_id = %request.video_id,
                success = request.success,
                progress = %format!("{}/{}", run.reported_count(), run.total_videos),
                "Video result recorded"
            );
        }

        Ok(CompleteResponse {
            success: true,
            recorded,
            run_status: run.status,
            videos_processed: run.videos_processed,
            videos_failed: run.videos_failed,
        })
    }

    /// Record liveness and tell the worker whether it should stop.
    pub async fn heartbeat(&self, run_id: &RunId) -> ApiResult<HeartbeatResponse> {
        let run = self
            .runs
            .modify(run_id, &|run: &mut ProcessingRun| {
                run.heartbeat();
                true
            })
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Run {} not found", run_id)))?;

        Ok(HeartbeatResponse {
            success: true,
            cancel_requested: run.cancel_requested || run.status == RunStatus::Cancelled,
        })
    }

    /// Snapshot the run log tail into the run record.
    pub async fn save_logs(&self, run_id: &RunId) -> ApiResult<SaveLogsResponse> {
        self.require_run(run_id).await?;
        let tail = self.read_tail(run_id, self.log_tail_max_bytes).await?;
        let bytes_saved = tail.len();

        self.runs
            .modify(run_id, &|run: &mut ProcessingRun| {
                if run.logs.as_deref() == Some(tail.as_str()) {
                    return false;
                }
                run.logs = Some(tail.clone());
                run.updated_at = Utc::now();
                true
            })
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Run {} not found", run_id)))?;

        Ok(SaveLogsResponse {
            success: true,
            bytes_saved,
        })
    }

    /// Current log tail, capped at the configured maximum.
    pub async fn read_tail(&self, run_id: &RunId, max_bytes: usize) -> ApiResult<String> {
        let path = LogSink::path_for(&self.log_dir, run_id);
        LogSink::read_tail(&path, max_bytes.min(self.log_tail_max_bytes))
            .await
            .map_err(|e| {
                warn!(run_id = %run_id, "Failed to read run log: {}", e);
                ApiError::internal(format!("Failed to read run log: {}", e))
            })
    }

    pub async fn require_run(&self, run_id: &RunId) -> ApiResult<ProcessingRun> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Run {} not found", run_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use fieldvis_models::{BackendKind, VideoAsset, VideoId, VideoStatus};

    async fn setup() -> (InMemoryStore, ProgressService, RunId, tempfile::TempDir) {
        let store = InMemoryStore::with_assets([
            VideoAsset::new("a", "a.mp4", "/a.mp4"),
            VideoAsset::new("b", "b.mp4", "/b.mp4"),
        ]);
        let run_id = RunId::from_string("run-p");
        store.claim(&"a".into(), &run_id).await.unwrap();
        store.claim(&"b".into(), &run_id).await.unwrap();
        store
            .create(&ProcessingRun::new(
                run_id.clone(),
                BackendKind::Local,
                vec!["a".into(), "b".into()],
            ))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(store.clone());
        let service = ProgressService::new(shared.clone(), shared, dir.path().to_path_buf(), 64);
        (store, service, run_id, dir)
    }

    fn complete(run_id: &RunId, video: &str, success: bool) -> VideoCompleteRequest {
        VideoCompleteRequest {
            run_id: run_id.clone(),
            video_id: VideoId::from(video),
            motion_analysis_path: success.then(|| format!("/results/{}.json", video)),
            success,
            error: (!success).then(|| "decode error".to_string()),
        }
    }

    #[tokio::test]
    async fn test_completion_callbacks_finish_run() {
        let (store, service, run_id, _dir) = setup().await;

        let first = service.complete(complete(&run_id, "a", true)).await.unwrap();
        assert!(first.recorded);
        assert_eq!(first.run_status, RunStatus::Running);

        let repeat = service.complete(complete(&run_id, "a", true)).await.unwrap();
        assert!(!repeat.recorded);
        assert_eq!(repeat.videos_processed, 1);

        let last = service.complete(complete(&run_id, "b", false)).await.unwrap();
        assert_eq!(last.run_status, RunStatus::Completed);
        assert_eq!(last.videos_failed, 1);

        let a = store.asset(&"a".into()).await.unwrap();
        assert_eq!(a.status, VideoStatus::Completed);
        assert_eq!(a.result_path.as_deref(), Some("/results/a.json"));
        let b = store.asset(&"b".into()).await.unwrap();
        assert_eq!(b.status, VideoStatus::Failed);
        assert_eq!(b.error_message.as_deref(), Some("decode error"));
    }

    #[tokio::test]
    async fn test_completion_for_foreign_video_is_rejected() {
        let (_store, service, run_id, _dir) = setup().await;
        let err = service
            .complete(complete(&run_id, "zzz", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_reports_cancellation() {
        let (store, service, run_id, _dir) = setup().await;
        let response = service.heartbeat(&run_id).await.unwrap();
        assert!(!response.cancel_requested);
        assert!(store
            .get(&run_id)
            .await
            .unwrap()
            .unwrap()
            .last_heartbeat
            .is_some());

        store
            .modify(&run_id, &|run: &mut ProcessingRun| run.cancel())
            .await
            .unwrap();
        assert!(service.heartbeat(&run_id).await.unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn test_save_logs_stores_capped_tail() {
        let (store, service, run_id, dir) = setup().await;
        let sink = LogSink::open(dir.path(), &run_id).await.unwrap();
        for i in 0..20 {
            sink.append_line(&format!("frame batch {:02}", i)).await.unwrap();
        }

        let response = service.save_logs(&run_id).await.unwrap();
        assert!(response.bytes_saved <= 64);

        let logs = store.get(&run_id).await.unwrap().unwrap().logs.unwrap();
        assert!(logs.ends_with("frame batch 19\n"));
        assert!(!logs.contains("frame batch 00"));
    }
}
