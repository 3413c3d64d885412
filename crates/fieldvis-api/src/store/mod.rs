//! Persistence seams for the orchestrator.
//!
//! [`AssetCatalog`] owns video assets and their processing claims;
//! [`RunStore`] owns processing runs. Both have a Firestore implementation
//! and an in-memory one used for local development and tests.

mod firestore;
mod memory;

pub use firestore::{FirestoreAssetCatalog, FirestoreRunStore};
pub use memory::InMemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use fieldvis_firestore::FirestoreError;
use fieldvis_models::{ClaimOutcome, ProcessingRun, RunId, VideoAsset, VideoId, VideoOutcome};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Firestore error: {0}")]
    Firestore(#[from] FirestoreError),

    #[error("Run already exists: {0}")]
    RunExists(RunId),

    #[error("Store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Mutation applied to a stored run; returns whether anything changed.
pub type RunMutation<'a> = &'a (dyn Fn(&mut ProcessingRun) -> bool + Send + Sync);

#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// Fetch the given ids, skipping unknown ones, in request order.
    async fn fetch_many(&self, video_ids: &[VideoId]) -> StoreResult<Vec<VideoAsset>>;

    /// Conditionally move a claimable video to `processing` for `run_id`.
    async fn claim(&self, video_id: &VideoId, run_id: &RunId) -> StoreResult<ClaimOutcome>;

    /// Hand a video back to `pending` if `run_id` still holds its claim.
    async fn release(&self, video_id: &VideoId, run_id: &RunId) -> StoreResult<bool>;

    /// Store a worker result if `run_id` still holds the claim.
    async fn record_result(
        &self,
        video_id: &VideoId,
        run_id: &RunId,
        outcome: VideoOutcome,
        result_path: Option<String>,
        error: Option<String>,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: &ProcessingRun) -> StoreResult<()>;

    async fn get(&self, run_id: &RunId) -> StoreResult<Option<ProcessingRun>>;

    /// Compare-and-set update. Returns the run as stored afterwards, or
    /// `None` when it does not exist.
    async fn modify(
        &self,
        run_id: &RunId,
        mutate: RunMutation<'_>,
    ) -> StoreResult<Option<ProcessingRun>>;

    /// Runs whose status is still `running`.
    async fn list_running(&self, limit: usize) -> StoreResult<Vec<ProcessingRun>>;

    /// Cheap round trip used by the readiness probe.
    async fn ping(&self) -> StoreResult<()>;
}
