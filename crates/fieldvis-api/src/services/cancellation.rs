//! Out-of-band run cancellation.
//!
//! The `running -> cancelled` transition is written before the worker is
//! signalled, so the exit reconciler triggered by SIGTERM finds the run
//! already terminal and leaves its status alone.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use fieldvis_models::{ProcessingRun, RunId, RunStatus};
use fieldvis_runner::{LogSink, ProcessLauncher, TerminateOutcome};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::store::{AssetCatalog, RunStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    AlreadyFinished,
}

impl CancelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::AlreadyCancelled => "already_cancelled",
            CancelOutcome::AlreadyFinished => "already_finished",
        }
    }

    fn for_terminal(status: RunStatus) -> Self {
        if status == RunStatus::Cancelled {
            CancelOutcome::AlreadyCancelled
        } else {
            CancelOutcome::AlreadyFinished
        }
    }
}

/// Body of a cancel response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReport {
    pub success: bool,
    pub run_id: RunId,
    pub outcome: CancelOutcome,
    /// Whether SIGTERM reached a live process
    pub signalled: bool,
    pub videos_released: u32,
}

impl CancelReport {
    fn unchanged(run_id: RunId, status: RunStatus) -> Self {
        Self {
            success: true,
            run_id,
            outcome: CancelOutcome::for_terminal(status),
            signalled: false,
            videos_released: 0,
        }
    }
}

#[derive(Clone)]
pub struct CancellationService {
    catalog: Arc<dyn AssetCatalog>,
    runs: Arc<dyn RunStore>,
    launcher: ProcessLauncher,
    log_dir: PathBuf,
}

impl CancellationService {
    pub fn new(
        catalog: Arc<dyn AssetCatalog>,
        runs: Arc<dyn RunStore>,
        launcher: ProcessLauncher,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            catalog,
            runs,
            launcher,
            log_dir,
        }
    }

    pub async fn cancel(&self, run_id: &RunId) -> ApiResult<CancelReport> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Run {} not found", run_id)))?;

        if run.status.is_terminal() {
            let report = CancelReport::unchanged(run_id.clone(), run.status);
            metrics::record_run_cancelled(report.outcome.as_str());
            return Ok(report);
        }

        if !run.has_cancellation_channel() && self.launcher.live_pid(run_id).is_none() {
            return Err(ApiError::not_cancellable(format!(
                "Run {} has no process id and has never sent a heartbeat",
                run_id
            )));
        }

        let transitioned = AtomicBool::new(false);
        let run = self
            .runs
            .modify(run_id, &|run: &mut ProcessingRun| {
                let cancelled = run.cancel();
                transitioned.store(cancelled, Ordering::SeqCst);
                cancelled
            })
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Run {} not found", run_id)))?;

        if !transitioned.load(Ordering::SeqCst) {
            // Another terminal transition won the race.
            let report = CancelReport::unchanged(run_id.clone(), run.status);
            metrics::record_run_cancelled(report.outcome.as_str());
            return Ok(report);
        }

        let signalled = self.signal_worker(&run);
        let released = self.release_unreported(&run).await;

        let line = format!(
            "Run cancelled: {}, {} videos released",
            if signalled { "worker signalled" } else { "no live worker" },
            released
        );
        self.append_marker(run_id, &line).await;
        info!(run_id = %run_id, signalled, released, "Run cancelled");
        metrics::record_run_cancelled(CancelOutcome::Cancelled.as_str());

        Ok(CancelReport {
            success: true,
            run_id: run_id.clone(),
            outcome: CancelOutcome::Cancelled,
            signalled,
            videos_released: released,
        })
    }

    fn signal_worker(&self, run: &ProcessingRun) -> bool {
        match self
            .launcher
            .terminate(&run.id, run.process_id, run.worker_state.has_exited())
        {
            Ok(TerminateOutcome::Signalled { pid }) => {
                info!(run_id = %run.id, pid, "Sent SIGTERM to worker");
                true
            }
            Ok(TerminateOutcome::AlreadyExited) | Ok(TerminateOutcome::NoProcess) => false,
            Err(e) => {
                warn!(run_id = %run.id, "Could not signal worker: {}", e);
                false
            }
        }
    }

    async fn release_unreported(&self, run: &ProcessingRun) -> u32 {
        let mut released = 0;
        for video_id in run.unreported_videos() {
            match self.catalog.release(&video_id, &run.id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    run_id = %run.id,
                    video_id = %video_id,
                    "Failed to release video: {}",
                    e
                ),
            }
        }
        released
    }

    async fn append_marker(&self, run_id: &RunId, message: &str) {
        let written = match LogSink::open(&self.log_dir, run_id).await {
            Ok(sink) => sink.append_marker("cancel", message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(run_id = %run_id, "Could not write cancel marker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use fieldvis_models::{BackendKind, VideoAsset, VideoId, VideoOutcome, VideoStatus};
    use fieldvis_runner::LauncherConfig;

    async fn setup(heartbeat: bool) -> (InMemoryStore, CancellationService, RunId, tempfile::TempDir) {
        let store = InMemoryStore::with_assets([
            VideoAsset::new("a", "a.mp4", "/a.mp4"),
            VideoAsset::new("b", "b.mp4", "/b.mp4"),
        ]);
        let run_id = RunId::from_string("run-c");
        store.claim(&"a".into(), &run_id).await.unwrap();
        store.claim(&"b".into(), &run_id).await.unwrap();

        let mut run = ProcessingRun::new(run_id.clone(), BackendKind::Local, vec!["a".into(), "b".into()]);
        if heartbeat {
            run.heartbeat();
        }
        store.create(&run).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(store.clone());
        let service = CancellationService::new(
            shared.clone(),
            shared,
            ProcessLauncher::new(LauncherConfig::default()),
            dir.path().to_path_buf(),
        );
        (store, service, run_id, dir)
    }

    #[tokio::test]
    async fn test_cancel_without_handle_is_rejected() {
        let (store, service, run_id, _dir) = setup(false).await;
        let err = service.cancel(&run_id).await.unwrap_err();
        assert!(matches!(err, ApiError::NotCancellable(_)));
        assert_eq!(
            store.get(&run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_cancel_releases_unreported_videos() {
        let (store, service, run_id, dir) = setup(true).await;
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

        let report = service.cancel(&run_id).await.unwrap();
        assert_eq!(report.outcome, CancelOutcome::Cancelled);
        assert!(!report.signalled);
        assert_eq!(report.videos_released, 1);

        let run = store.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.cancel_requested);
        assert!(run.completed_at.is_some());
        assert_eq!(
            store.asset(&VideoId::from("b")).await.unwrap().status,
            VideoStatus::Pending
        );
        assert_eq!(
            store.asset(&VideoId::from("a")).await.unwrap().status,
            VideoStatus::Completed
        );

        let log = tokio::fs::read_to_string(LogSink::path_for(dir.path(), &run_id))
            .await
            .unwrap();
        assert!(log.starts_with("[cancel] Run cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_store, service, run_id, _dir) = setup(true).await;
        assert_eq!(
            service.cancel(&run_id).await.unwrap().outcome,
            CancelOutcome::Cancelled
        );
        let second = service.cancel(&run_id).await.unwrap();
        assert_eq!(second.outcome, CancelOutcome::AlreadyCancelled);
        assert_eq!(second.videos_released, 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let (_store, service, _run_id, _dir) = setup(true).await;
        let err = service.cancel(&RunId::from_string("ghost")).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
