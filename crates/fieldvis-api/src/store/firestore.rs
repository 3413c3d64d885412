//! Firestore-backed stores.

use async_trait::async_trait;

use fieldvis_firestore::{
    FirestoreClient, FirestoreError, ProcessingRunRepository, VideoAssetRepository,
};
use fieldvis_models::{ClaimOutcome, ProcessingRun, RunId, VideoAsset, VideoId, VideoOutcome};

use super::{AssetCatalog, RunMutation, RunStore, StoreError, StoreResult};

#[derive(Clone)]
pub struct FirestoreAssetCatalog {
    repo: VideoAssetRepository,
}

impl FirestoreAssetCatalog {
    pub fn new(client: FirestoreClient) -> Self {
        Self {
            repo: VideoAssetRepository::new(client),
        }
    }
}

#[async_trait]
impl AssetCatalog for FirestoreAssetCatalog {
    async fn fetch_many(&self, video_ids: &[VideoId]) -> StoreResult<Vec<VideoAsset>> {
        Ok(self.repo.get_many(video_ids).await?)
    }

    async fn claim(&self, video_id: &VideoId, run_id: &RunId) -> StoreResult<ClaimOutcome> {
        Ok(self.repo.claim(video_id, run_id).await?)
    }

    async fn release(&self, video_id: &VideoId, run_id: &RunId) -> StoreResult<bool> {
        Ok(self.repo.release(video_id, run_id).await?)
    }

    async fn record_result(
        &self,
        video_id: &VideoId,
        run_id: &RunId,
        outcome: VideoOutcome,
        result_path: Option<String>,
        error: Option<String>,
    ) -> StoreResult<bool> {
        Ok(self
            .repo
            .record_result(video_id, run_id, outcome, result_path, error)
            .await?)
    }
}

#[derive(Clone)]
pub struct FirestoreRunStore {
    client: FirestoreClient,
    repo: ProcessingRunRepository,
}

impl FirestoreRunStore {
    pub fn new(client: FirestoreClient) -> Self {
        Self {
            repo: ProcessingRunRepository::new(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl RunStore for FirestoreRunStore {
    async fn create(&self, run: &ProcessingRun) -> StoreResult<()> {
        match self.repo.create(run).await {
            Ok(()) => Ok(()),
            Err(FirestoreError::AlreadyExists(_)) => Err(StoreError::RunExists(run.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, run_id: &RunId) -> StoreResult<Option<ProcessingRun>> {
        Ok(self.repo.get(run_id).await?)
    }

    async fn modify(
        &self,
        run_id: &RunId,
        mutate: RunMutation<'_>,
    ) -> StoreResult<Option<ProcessingRun>> {
        Ok(self.repo.modify(run_id, |run| mutate(run)).await?)
    }

    async fn list_running(&self, limit: usize) -> StoreResult<Vec<ProcessingRun>> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        Ok(self.repo.list_running(limit).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        // A missing document still proves Firestore is reachable.
        self.client.get_document("_health", "_check").await?;
        Ok(())
    }
}
