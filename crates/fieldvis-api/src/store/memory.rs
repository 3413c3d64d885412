//! Process-local store.
//!
//! Every check-and-set runs while holding the write lock, which gives the
//! same guarantees as the Firestore precondition loop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use fieldvis_models::{
    ClaimOutcome, ProcessingRun, RunId, RunStatus, VideoAsset, VideoId, VideoOutcome,
};

use super::{AssetCatalog, RunMutation, RunStore, StoreError, StoreResult};

#[derive(Clone, Default)]
pub struct InMemoryStore {
    assets: Arc<RwLock<HashMap<VideoId, VideoAsset>>>,
    runs: Arc<RwLock<HashMap<RunId, ProcessingRun>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: impl IntoIterator<Item = VideoAsset>) -> Self {
        let map = assets.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            assets: Arc::new(RwLock::new(map)),
            runs: Arc::default(),
        }
    }

    /// Build a catalog from a JSON array of video assets.
    pub async fn from_seed_file(path: &Path) -> StoreResult<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            StoreError::internal(format!("cannot read seed file {}: {}", path.display(), e))
        })?;
        let assets: Vec<VideoAsset> = serde_json::from_slice(&raw).map_err(|e| {
            StoreError::internal(format!("invalid seed file {}: {}", path.display(), e))
        })?;
        info!(
            path = %path.display(),
            "Seeded in-memory catalog with {} videos",
            assets.len()
        );
        Ok(Self::with_assets(assets))
    }

    pub async fn insert_asset(&self, asset: VideoAsset) {
        self.assets.write().await.insert(asset.id.clone(), asset);
    }

    pub async fn asset(&self, video_id: &VideoId) -> Option<VideoAsset> {
        self.assets.read().await.get(video_id).cloned()
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl AssetCatalog for InMemoryStore {
    async fn fetch_many(&self, video_ids: &[VideoId]) -> StoreResult<Vec<VideoAsset>> {
        let assets = self.assets.read().await;
        Ok(video_ids
            .iter()
            .filter_map(|id| assets.get(id).cloned())
            .collect())
    }

    async fn claim(&self, video_id: &VideoId, run_id: &RunId) -> StoreResult<ClaimOutcome> {
        let mut assets = self.assets.write().await;
        Ok(match assets.get_mut(video_id) {
            Some(asset) => asset.claim_for(run_id),
            None => ClaimOutcome::Missing,
        })
    }

    async fn release(&self, video_id: &VideoId, run_id: &RunId) -> StoreResult<bool> {
        let mut assets = self.assets.write().await;
        Ok(assets
            .get_mut(video_id)
            .is_some_and(|asset| asset.release_from(run_id)))
    }

    async fn record_result(
        &self,
        video_id: &VideoId,
        run_id: &RunId,
        outcome: VideoOutcome,
        result_path: Option<String>,
        error: Option<String>,
    ) -> StoreResult<bool> {
        let mut assets = self.assets.write().await;
        Ok(assets
            .get_mut(video_id)
            .is_some_and(|asset| asset.record_result(run_id, outcome, result_path, error)))
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn create(&self, run: &ProcessingRun) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(StoreError::RunExists(run.id.clone()));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> StoreResult<Option<ProcessingRun>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn modify(
        &self,
        run_id: &RunId,
        mutate: RunMutation<'_>,
    ) -> StoreResult<Option<ProcessingRun>> {
        let mut runs = self.runs.write().await;
        Ok(runs.get_mut(run_id).map(|run| {
            mutate(run);
            run.clone()
        }))
    }

    async fn list_running(&self, limit: usize) -> StoreResult<Vec<ProcessingRun>> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|run| run.status == RunStatus::Running)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldvis_models::{BackendKind, VideoStatus};

    fn store() -> InMemoryStore {
        InMemoryStore::with_assets([
            VideoAsset::new("v1", "a.mp4", "/a.mp4"),
            VideoAsset::new("v2", "b.mp4", "/b.mp4").with_status(VideoStatus::Completed),
        ])
    }

    #[tokio::test]
    async fn test_fetch_many_keeps_order_and_skips_unknown() {
        let store = store();
        let ids: Vec<VideoId> = vec!["v2".into(), "nope".into(), "v1".into()];
        let assets = store.fetch_many(&ids).await.unwrap();
        let found: Vec<&str> = assets.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(found, vec!["v2", "v1"]);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = store();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .claim(&"v1".into(), &RunId::from_string(format!("run-{}", i)))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_claimed() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_unknown_video_is_missing() {
        let outcome = store()
            .claim(&"ghost".into(), &RunId::from_string("r"))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Missing);
    }

    #[tokio::test]
    async fn test_duplicate_run_is_rejected() {
        let store = store();
        let run = ProcessingRun::new(RunId::from_string("r1"), BackendKind::Local, vec![]);
        store.create(&run).await.unwrap();
        assert!(matches!(
            store.create(&run).await,
            Err(StoreError::RunExists(_))
        ));
    }

    #[tokio::test]
    async fn test_modify_and_list_running() {
        let store = store();
        let run = ProcessingRun::new(RunId::from_string("r1"), BackendKind::Local, vec!["v1".into()]);
        store.create(&run).await.unwrap();
        assert_eq!(store.list_running(10).await.unwrap().len(), 1);

        let updated = store
            .modify(&run.id, &|run: &mut ProcessingRun| run.cancel())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, RunStatus::Cancelled);
        assert!(store.list_running(10).await.unwrap().is_empty());
        assert!(store
            .modify(&RunId::from_string("nope"), &|_: &mut ProcessingRun| true)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        tokio::fs::write(
            &path,
            r#"[{"id":"s1","filename":"reef.mp4","filepath":"/data/reef.mp4","fps":30.0}]"#,
        )
        .await
        .unwrap();

        let store = InMemoryStore::from_seed_file(&path).await.unwrap();
        let asset = store.asset(&"s1".into()).await.unwrap();
        assert_eq!(asset.fps, Some(30.0));
        assert_eq!(asset.status, VideoStatus::Pending);

        assert!(InMemoryStore::from_seed_file(&dir.path().join("missing.json"))
            .await
            .is_err());
    }
}
