//! Glue between a freshly created run and the process launcher.

use std::sync::Arc;

use fieldvis_models::{ProcessingRun, ResolvedSettings, VideoAsset, WorkerState};
use fieldvis_runner::{LaunchRequest, LogSink, ProcessLauncher, RunLogger, WorkerObserver};

use crate::config::OrchestratorConfig;
use crate::metrics;
use crate::services::RunReconciler;
use crate::store::RunStore;

/// How the launch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    Started { pid: u32 },
    /// The worker never started; the run is already marked failed.
    SpawnFailed { error: String },
}

#[derive(Clone)]
pub struct LaunchCoordinator {
    runs: Arc<dyn RunStore>,
    launcher: ProcessLauncher,
    reconciler: Arc<RunReconciler>,
    config: Arc<OrchestratorConfig>,
}

impl LaunchCoordinator {
    pub fn new(
        runs: Arc<dyn RunStore>,
        launcher: ProcessLauncher,
        reconciler: Arc<RunReconciler>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            runs,
            launcher,
            reconciler,
            config,
        }
    }

    /// Start the worker for `run`. Failures are recorded, never returned.
    pub async fn start(
        &self,
        run: &ProcessingRun,
        assets: &[VideoAsset],
        settings: ResolvedSettings,
    ) -> LaunchStatus {
        let logger = RunLogger::new(&run.id, "launch");

        let sink = match LogSink::open(&self.config.run_log_dir, &run.id).await {
            Ok(sink) => sink,
            Err(e) => {
                let error = format!("Cannot open run log: {}", e);
                return self.record_spawn_failure(run, None, error).await;
            }
        };

        let enabled = settings.enabled_modules().join(", ");
        let launch_line = format!(
            "Launching {} worker for {} videos (modules: {})",
            run.backend,
            assets.len(),
            if enabled.is_empty() { "none" } else { enabled.as_str() }
        );
        if let Err(e) = sink.append_marker("launch", &launch_line).await {
            logger.log_warning(&format!("could not write launch marker: {}", e));
        }

        let request = LaunchRequest {
            run_id: run.id.clone(),
            backend: run.backend,
            videos: assets.iter().map(VideoAsset::to_worker_video).collect(),
            callback_url: self.config.callback_base_url.clone(),
            settings,
        };
        let observer: Arc<dyn WorkerObserver> = self.reconciler.clone();

        let launched = match self.launcher.launch(request, sink.clone(), observer) {
            Ok(launched) => launched,
            Err(e) => return self.record_spawn_failure(run, Some(&sink), e.to_string()).await,
        };
        let pid = launched.pid;
        logger.log_start(&format!("worker pid {}", pid));

        let recorded = self
            .runs
            .modify(&run.id, &|run: &mut ProcessingRun| {
                let pid_changed = run.process_id != Some(pid);
                run.process_id = Some(pid);
                let state_changed = run.set_worker_state(WorkerState::Running);
                pid_changed || state_changed
            })
            .await;

        let failure = match recorded {
            Ok(Some(_)) => None,
            Ok(None) => Some("run record not found".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            // The worker keeps running without a stored pid.
            logger.log_warning(&format!("could not record worker pid {}: {}", pid, reason));
            let line = format!("Could not record worker pid {}: {}", pid, reason);
            if let Err(e) = sink.append_marker("warning", &line).await {
                logger.log_warning(&format!("could not write warning marker: {}", e));
            }
        }

        LaunchStatus::Started { pid }
    }

    async fn record_spawn_failure(
        &self,
        run: &ProcessingRun,
        sink: Option<&LogSink>,
        error: String,
    ) -> LaunchStatus {
        let logger = RunLogger::new(&run.id, "launch");
        logger.log_error(&format!("worker failed to start: {}", error));
        metrics::record_spawn_failure();

        if let Some(sink) = sink {
            if let Err(e) = sink.append_marker("spawn-error", &error).await {
                logger.log_warning(&format!("could not write spawn-error marker: {}", e));
            }
        }
        if let Err(e) = self.reconciler.launch_failed(&run.id, &error).await {
            logger.log_warning(&format!("could not record launch failure: {}", e));
        }

        LaunchStatus::SpawnFailed { error }
    }
}
