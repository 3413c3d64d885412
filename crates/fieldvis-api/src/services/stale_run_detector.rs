//! Background service for detecting runs whose worker went silent.
//!
//! Opt-in via `ENABLE_STALE_DETECTION`. Each pass lists running runs and
//! settles the ones that missed their heartbeat window as crashed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{error, info, warn};

use fieldvis_models::ProcessingRun;
use fieldvis_runner::ProcessLauncher;

use crate::config::OrchestratorConfig;
use crate::metrics;
use crate::services::RunReconciler;
use crate::store::RunStore;

/// Interval between stale run detection passes.
const DETECTION_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on runs inspected per pass.
const MAX_RUNS_PER_PASS: usize = 500;

/// Whether `run` has gone quiet for too long.
///
/// A run with heartbeats is stale once its last one is older than
/// `threshold`. A run that never sent one is given `grace` from its start.
pub fn is_stale(
    run: &ProcessingRun,
    now: DateTime<Utc>,
    threshold: Duration,
    grace: Duration,
) -> bool {
    if run.status.is_terminal() {
        return false;
    }
    let (since, limit) = match run.last_heartbeat {
        Some(beat) => (beat, threshold),
        None => (run.started_at, grace),
    };
    (now - since)
        .to_std()
        .map(|elapsed| elapsed > limit)
        .unwrap_or(false)
}

pub struct StaleRunDetector {
    runs: Arc<dyn RunStore>,
    launcher: ProcessLauncher,
    reconciler: Arc<RunReconciler>,
    threshold: Duration,
    grace: Duration,
    enabled: bool,
}

impl StaleRunDetector {
    pub fn new(
        runs: Arc<dyn RunStore>,
        launcher: ProcessLauncher,
        reconciler: Arc<RunReconciler>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            runs,
            launcher,
            reconciler,
            threshold: config.stale_threshold,
            grace: config.stale_grace_period,
            enabled: config.enable_stale_detection,
        }
    }

    /// Start the background detection loop.
    ///
    /// Runs indefinitely and should be spawned as a background task.
    pub async fn run(&self) {
        if !self.enabled {
            info!("Stale run detection is disabled");
            return;
        }

        info!(
            "Starting stale run detector (interval: {:?}, threshold: {:?}, grace: {:?})",
            DETECTION_INTERVAL, self.threshold, self.grace
        );

        let mut ticker = interval(DETECTION_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.detect_and_recover().await {
                error!("Stale run detection error: {}", e);
            }
        }
    }

    /// Run a single detection pass. Returns the number of runs settled.
    pub async fn detect_and_recover(&self) -> anyhow::Result<u32> {
        let running = self.runs.list_running(MAX_RUNS_PER_PASS).await?;
        let now = Utc::now();
        let mut recovered = 0u32;

        for run in running
            .iter()
            .filter(|run| is_stale(run, now, self.threshold, self.grace))
        {
            warn!(
                run_id = %run.id,
                last_heartbeat = ?run.last_heartbeat,
                started_at = %run.started_at,
                "Detected stale run (no heartbeat)"
            );
            metrics::record_stale_run();

            match self
                .launcher
                .terminate(&run.id, run.process_id, run.worker_state.has_exited())
            {
                Ok(outcome) => info!(run_id = %run.id, ?outcome, "Terminated stale worker"),
                Err(e) => warn!(run_id = %run.id, "Could not terminate stale worker: {}", e),
            }

            match self.reconciler.heartbeat_lost(&run.id).await {
                Ok(Some(report)) if report.finished_run => recovered += 1,
                Ok(_) => {}
                Err(e) => error!(run_id = %run.id, "Failed to settle stale run: {}", e),
            }
        }

        if recovered > 0 {
            info!("Stale run detection complete: {} runs settled", recovered);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, RunStore};
    use fieldvis_models::{BackendKind, RunId, RunStatus};
    use fieldvis_runner::LauncherConfig;

    const THRESHOLD: Duration = Duration::from_secs(60);
    const GRACE: Duration = Duration::from_secs(120);

    fn run() -> ProcessingRun {
        ProcessingRun::new(RunId::from_string("s1"), BackendKind::Local, vec!["a".into()])
    }

    #[test]
    fn test_fresh_run_is_not_stale() {
        assert!(!is_stale(&run(), Utc::now(), THRESHOLD, GRACE));
    }

    #[test]
    fn test_run_without_heartbeat_uses_grace() {
        let mut run = run();
        run.started_at = Utc::now() - chrono::Duration::seconds(90);
        assert!(!is_stale(&run, Utc::now(), THRESHOLD, GRACE));
        run.started_at = Utc::now() - chrono::Duration::seconds(150);
        assert!(is_stale(&run, Utc::now(), THRESHOLD, GRACE));
    }

    #[test]
    fn test_silent_heartbeat_is_stale() {
        let mut run = run();
        run.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(61));
        assert!(is_stale(&run, Utc::now(), THRESHOLD, GRACE));
        run.cancel();
        assert!(!is_stale(&run, Utc::now(), THRESHOLD, GRACE));
    }

    #[tokio::test]
    async fn test_detect_and_recover_settles_stale_runs() {
        let store = InMemoryStore::new();
        let mut stale = run();
        stale.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(300));
        store.create(&stale).await.unwrap();

        let mut healthy = ProcessingRun::new(RunId::from_string("s2"), BackendKind::Local, vec![]);
        healthy.heartbeat();
        store.create(&healthy).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(store.clone());
        let reconciler = Arc::new(RunReconciler::new(
            shared.clone(),
            shared.clone(),
            dir.path().to_path_buf(),
        ));
        let config = OrchestratorConfig {
            enable_stale_detection: true,
            ..Default::default()
        };
        let detector = StaleRunDetector::new(
            shared,
            ProcessLauncher::new(LauncherConfig::default()),
            reconciler,
            &config,
        );

        assert_eq!(detector.detect_and_recover().await.unwrap(), 1);
        let settled = store.get(&stale.id).await.unwrap().unwrap();
        assert_eq!(settled.status, RunStatus::Failed);
        assert_eq!(
            store.get(&healthy.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }
}
