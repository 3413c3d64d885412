//! Application state.

use std::sync::Arc;

use tracing::info;

use fieldvis_firestore::FirestoreClient;
use fieldvis_runner::{LauncherConfig, ProcessLauncher};

use crate::auth::JwksCache;
use crate::config::{ApiConfig, OrchestratorConfig, StoreBackend};
use crate::services::{
    CancellationService, LaunchCoordinator, ProgressService, RunReconciler, StaleRunDetector,
    SubmissionService,
};
use crate::store::{
    AssetCatalog, FirestoreAssetCatalog, FirestoreRunStore, InMemoryStore, RunStore,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub orchestrator: Arc<OrchestratorConfig>,
    pub catalog: Arc<dyn AssetCatalog>,
    pub runs: Arc<dyn RunStore>,
    pub launcher: ProcessLauncher,
    pub reconciler: Arc<RunReconciler>,
    pub submission: SubmissionService,
    pub cancellation: CancellationService,
    pub progress: ProgressService,
    /// Token verification; `None` accepts every caller as anonymous
    pub jwks: Option<Arc<JwksCache>>,
}

impl AppState {
    /// Create application state from the environment.
    pub async fn new(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let orchestrator = OrchestratorConfig::from_env();
        let launcher = ProcessLauncher::new(LauncherConfig::from_env());

        let (catalog, runs): (Arc<dyn AssetCatalog>, Arc<dyn RunStore>) =
            match orchestrator.store_backend {
                StoreBackend::Firestore => {
                    let client = FirestoreClient::from_env().await?;
                    info!(
                        project_id = %client.config().project_id,
                        "Using Firestore store"
                    );
                    (
                        Arc::new(FirestoreAssetCatalog::new(client.clone())) as Arc<dyn AssetCatalog>,
                        Arc::new(FirestoreRunStore::new(client)) as Arc<dyn RunStore>,
                    )
                }
                StoreBackend::Memory => {
                    let store = match &orchestrator.catalog_seed_file {
                        Some(path) => InMemoryStore::from_seed_file(path).await?,
                        None => InMemoryStore::new(),
                    };
                    info!("Using in-memory store");
                    let store = Arc::new(store);
                    (store.clone() as Arc<dyn AssetCatalog>, store as Arc<dyn RunStore>)
                }
            };

        let jwks = match JwksCache::from_env() {
            Some(cache) => Some(Arc::new(cache?)),
            None => {
                info!("No Firebase project configured; accepting anonymous callers only");
                None
            }
        };

        Ok(Self::from_parts(config, orchestrator, catalog, runs, launcher).with_jwks(jwks))
    }

    /// Wire the services over explicit stores and launcher.
    pub fn from_parts(
        config: ApiConfig,
        orchestrator: OrchestratorConfig,
        catalog: Arc<dyn AssetCatalog>,
        runs: Arc<dyn RunStore>,
        launcher: ProcessLauncher,
    ) -> Self {
        let orchestrator = Arc::new(orchestrator);
        let log_dir = orchestrator.run_log_dir.clone();

        let reconciler = Arc::new(RunReconciler::new(
            catalog.clone(),
            runs.clone(),
            log_dir.clone(),
        ));
        let launch = LaunchCoordinator::new(
            runs.clone(),
            launcher.clone(),
            reconciler.clone(),
            orchestrator.clone(),
        );
        let submission =
            SubmissionService::new(catalog.clone(), runs.clone(), launch, orchestrator.clone());
        let cancellation = CancellationService::new(
            catalog.clone(),
            runs.clone(),
            launcher.clone(),
            log_dir.clone(),
        );
        let progress = ProgressService::new(
            catalog.clone(),
            runs.clone(),
            log_dir,
            orchestrator.log_tail_max_bytes,
        );

        Self {
            config,
            orchestrator,
            catalog,
            runs,
            launcher,
            reconciler,
            submission,
            cancellation,
            progress,
            jwks: None,
        }
    }

    pub fn with_jwks(mut self, jwks: Option<Arc<JwksCache>>) -> Self {
        self.jwks = jwks;
        self
    }

    pub fn stale_run_detector(&self) -> StaleRunDetector {
        StaleRunDetector::new(
            self.runs.clone(),
            self.launcher.clone(),
            self.reconciler.clone(),
            &self.orchestrator,
        )
    }
}
