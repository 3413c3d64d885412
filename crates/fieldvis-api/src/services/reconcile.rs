//! Settles runs whose worker is gone.
//!
//! The first terminal transition on a run wins. Reconciliation only moves a
//! run that is still `running`; a cancelled or finished run keeps its status
//! and only has its `worker_state` updated.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use fieldvis_models::{ProcessingRun, RunId, VideoId, VideoOutcome, WorkerState};
use fieldvis_runner::{LogSink, RunLogger, WorkerExit, WorkerObserver};

use crate::metrics;
use crate::store::{AssetCatalog, RunStore, StoreResult};

/// Error stored on videos that never reported before their worker ended.
pub const UNREPORTED_VIDEO_ERROR: &str = "Worker exited before reporting";

/// Error stored on runs whose worker stopped sending heartbeats.
pub const HEARTBEAT_LOST: &str = "Worker heartbeat lost";

/// What a settle pass changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SettleReport {
    pub run: ProcessingRun,
    /// Videos counted as failed by this pass
    pub failed_videos: Vec<VideoId>,
    /// Whether this pass moved the run out of `running`
    pub finished_run: bool,
}

pub struct RunReconciler {
    catalog: Arc<dyn AssetCatalog>,
    runs: Arc<dyn RunStore>,
    log_dir: PathBuf,
}

impl RunReconciler {
    pub fn new(catalog: Arc<dyn AssetCatalog>, runs: Arc<dyn RunStore>, log_dir: PathBuf) -> Self {
        Self {
            catalog,
            runs,
            log_dir,
        }
    }

    /// Record the exit of a worker and settle its run if still running.
    pub async fn worker_exited(
        &self,
        run_id: &RunId,
        exit: &WorkerExit,
    ) -> StoreResult<Option<SettleReport>> {
        let (state, outcome) = if exit.success() {
            (WorkerState::Completed, "clean")
        } else {
            (WorkerState::Crashed, "crashed")
        };
        metrics::record_worker_exit(outcome);
        self.settle(run_id, state, exit.success(), &exit.describe())
            .await
    }

    /// Settle a run whose worker stopped heartbeating.
    pub async fn heartbeat_lost(&self, run_id: &RunId) -> StoreResult<Option<SettleReport>> {
        self.settle(run_id, WorkerState::Crashed, false, HEARTBEAT_LOST)
            .await
    }

    /// Fail a run whose worker never started and hand its videos back.
    pub async fn launch_failed(&self, run_id: &RunId, reason: &str) -> StoreResult<u32> {
        let logger = RunLogger::new(run_id, "launch");
        let updated = self
            .runs
            .modify(run_id, &|run: &mut ProcessingRun| run.fail_launch(reason))
            .await?;

        let Some(run) = updated else {
            logger.log_warning("run disappeared before its launch failure was recorded");
            return Ok(0);
        };

        let mut released = 0;
        for video_id in &run.video_ids {
            match self.catalog.release(video_id, run_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => logger.log_warning(&format!("could not release {}: {}", video_id, e)),
            }
        }
        logger.log_error(&format!("{} ({} videos released)", reason, released));
        Ok(released)
    }

    async fn settle(
        &self,
        run_id: &RunId,
        state: WorkerState,
        clean_exit: bool,
        reason: &str,
    ) -> StoreResult<Option<SettleReport>> {
        let logger = RunLogger::new(run_id, "reconcile");
        let settled: Mutex<(Vec<VideoId>, bool)> = Mutex::new((Vec::new(), false));

        let updated = self
            .runs
            .modify(run_id, &|run: &mut ProcessingRun| {
                let was_running = !run.status.is_terminal();
                let state_changed = run.set_worker_state(state);
                let failed = run.settle_after_worker_exit(clean_exit, reason);
                *settled.lock().unwrap_or_else(PoisonError::into_inner) = (failed, was_running);
                state_changed || was_running
            })
            .await?;

        let Some(run) = updated else {
            logger.log_warning("run not found while reconciling worker exit");
            return Ok(None);
        };
        let (failed_videos, finished_run) = settled
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        if !finished_run {
            return Ok(Some(SettleReport {
                run,
                failed_videos,
                finished_run,
            }));
        }

        for video_id in &failed_videos {
            let recorded = self
                .catalog
                .record_result(
                    video_id,
                    run_id,
                    VideoOutcome::Failed,
                    None,
                    Some(UNREPORTED_VIDEO_ERROR.to_string()),
                )
                .await;
            if let Err(e) = recorded {
                logger.log_warning(&format!("could not mark {} failed: {}", video_id, e));
            }
        }

        let summary = format!(
            "Run {} after worker exit: {} processed, {} failed ({} unreported)",
            run.status,
            run.videos_processed,
            run.videos_failed,
            failed_videos.len()
        );
        self.append_marker(run_id, &summary).await;
        info!(run_id = %run_id, status = %run.status, "{}", summary);

        Ok(Some(SettleReport {
            run,
            failed_videos,
            finished_run,
        }))
    }

    async fn append_marker(&self, run_id: &RunId, message: &str) {
        let written = match LogSink::open(&self.log_dir, run_id).await {
            Ok(sink) => sink.append_marker("reconcile", message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(run_id = %run_id, "Could not write reconcile marker: {}", e);
        }
    }
}

#[async_trait]
impl WorkerObserver for RunReconciler {
    async fn on_worker_exit(&self, run_id: &RunId, exit: &WorkerExit) {
        if let Err(e) = self.worker_exited(run_id, exit).await {
            warn!(run_id = %run_id, "Failed to reconcile worker exit: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use fieldvis_models::{BackendKind, RunStatus, VideoAsset, VideoStatus};

    async fn setup(ids: &[&str]) -> (InMemoryStore, RunReconciler, RunId, tempfile::TempDir) {
        let store = InMemoryStore::with_assets(
            ids.iter().map(|id| VideoAsset::new(*id, "x.mp4", "/x.mp4")),
        );
        let run_id = RunId::from_string("run-r");
        for id in ids {
            store.claim(&VideoId::from(*id), &run_id).await.unwrap();
        }
        let run = ProcessingRun::new(
            run_id.clone(),
            BackendKind::Local,
            ids.iter().map(|id| VideoId::from(*id)).collect(),
        );
        store.create(&run).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(store.clone());
        let reconciler = RunReconciler::new(shared.clone(), shared, dir.path().to_path_buf());
        (store, reconciler, run_id, dir)
    }

    fn exit_with(code: i32) -> WorkerExit {
        WorkerExit {
            code: Some(code),
            signal: None,
            wait_error: None,
        }
    }

    #[tokio::test]
    async fn test_crash_fails_unreported_videos() {
        let (store, reconciler, run_id, dir) = setup(&["a", "b"]).await;
        store
            .modify(&run_id, &|run: &mut ProcessingRun| {
                run.record_video_result(&"a".into(), VideoOutcome::Succeeded)
            })
            .await
            .unwrap();
        store
            .record_result(&"a".into(), &run_id, VideoOutcome::Succeeded, None, None)
            .await
            .unwrap();

        let report = reconciler
            .worker_exited(&run_id, &exit_with(1))
            .await
            .unwrap()
            .unwrap();
        assert!(report.finished_run);
        assert_eq!(report.failed_videos, vec![VideoId::from("b")]);
        assert_eq!(report.run.status, RunStatus::Failed);
        assert_eq!(report.run.worker_state, WorkerState::Crashed);

        let b = store.asset(&"b".into()).await.unwrap();
        assert_eq!(b.status, VideoStatus::Failed);
        assert_eq!(b.error_message.as_deref(), Some(UNREPORTED_VIDEO_ERROR));
        assert_eq!(
            store.asset(&"a".into()).await.unwrap().status,
            VideoStatus::Completed
        );

        let log = tokio::fs::read_to_string(LogSink::path_for(dir.path(), &run_id))
            .await
            .unwrap();
        assert!(log.contains("[reconcile] Run failed after worker exit"));
    }

    #[tokio::test]
    async fn test_exit_after_cancel_keeps_status() {
        let (store, reconciler, run_id, _dir) = setup(&["a"]).await;
        store
            .modify(&run_id, &|run: &mut ProcessingRun| run.cancel())
            .await
            .unwrap();

        let report = reconciler
            .worker_exited(&run_id, &exit_with(143))
            .await
            .unwrap()
            .unwrap();
        assert!(!report.finished_run);
        assert_eq!(report.run.status, RunStatus::Cancelled);
        assert_eq!(report.run.worker_state, WorkerState::Crashed);
        assert_eq!(
            store.asset(&"a".into()).await.unwrap().status,
            VideoStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_launch_failure_releases_claims() {
        let (store, reconciler, run_id, _dir) = setup(&["a", "b"]).await;
        let released = reconciler
            .launch_failed(&run_id, "Worker program not found: nope")
            .await
            .unwrap();
        assert_eq!(released, 2);

        let run = store.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.worker_state, WorkerState::Failed);
        assert_eq!(
            store.asset(&"a".into()).await.unwrap().status,
            VideoStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_heartbeat_lost() {
        let (_store, reconciler, run_id, _dir) = setup(&["a"]).await;
        let report = reconciler.heartbeat_lost(&run_id).await.unwrap().unwrap();
        assert_eq!(report.run.status, RunStatus::Failed);
        assert_eq!(report.run.error_message.as_deref(), Some(HEARTBEAT_LOST));
    }
}
