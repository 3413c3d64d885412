//! Video asset repository.
//!
//! Claim, release and result writes are conditional on the document's
//! `updateTime`, so two submissions racing for the same video cannot both
//! win the claim.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use fieldvis_models::{ClaimOutcome, RunId, VideoAsset, VideoId, VideoOutcome, VideoStatus};
use tracing::debug;

use crate::client::{FirestoreClient, BATCH_GET_LIMIT};
use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_cas_conflict;
use crate::types::{Document, Fields, ToFirestoreValue};

pub const VIDEOS_COLLECTION: &str = "videos";

const MAX_CAS_ATTEMPTS: u32 = 5;

/// Fields rewritten by claim, release and result updates.
const STATE_FIELDS: [&str; 5] = [
    "status",
    "claimed_by",
    "result_path",
    "error_message",
    "updated_at",
];

#[derive(Clone)]
pub struct VideoAssetRepository {
    client: FirestoreClient,
}

impl VideoAssetRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    /// Fetch the given ids; unknown ids are skipped and request order is kept.
    pub async fn get_many(&self, video_ids: &[VideoId]) -> FirestoreResult<Vec<VideoAsset>> {
        let mut found: HashMap<String, VideoAsset> = HashMap::new();

        for chunk in video_ids.chunks(BATCH_GET_LIMIT) {
            let names: Vec<String> = chunk
                .iter()
                .map(|id| self.client.full_document_name(VIDEOS_COLLECTION, id.as_str()))
                .collect();
            let docs = self
                .client
                .with_retry("batch_get_videos", || {
                    self.client.batch_get_documents(names.clone())
                })
                .await?;

            for doc in docs {
                let Some(id) = doc.doc_id().map(str::to_string) else {
                    continue;
                };
                let asset = document_to_asset(&id, &doc)?;
                found.insert(id, asset);
            }
        }

        Ok(video_ids
            .iter()
            .filter_map(|id| found.remove(id.as_str()))
            .collect())
    }

    pub async fn claim(&self, video_id: &VideoId, run_id: &RunId) -> FirestoreResult<ClaimOutcome> {
        let outcome = self
            .update_if(video_id, |asset| {
                let outcome = asset.claim_for(run_id);
                let changed = outcome.is_claimed();
                (outcome, changed)
            })
            .await?;
        Ok(outcome.unwrap_or(ClaimOutcome::Missing))
    }

    pub async fn release(&self, video_id: &VideoId, run_id: &RunId) -> FirestoreResult<bool> {
        let released = self
            .update_if(video_id, |asset| {
                let changed = asset.release_from(run_id);
                (changed, changed)
            })
            .await?;
        Ok(released.unwrap_or(false))
    }

    pub async fn record_result(
        &self,
        video_id: &VideoId,
        run_id: &RunId,
        outcome: VideoOutcome,
        result_path: Option<String>,
        error: Option<String>,
    ) -> FirestoreResult<bool> {
        let recorded = self
            .update_if(video_id, |asset| {
                let changed =
                    asset.record_result(run_id, outcome, result_path.clone(), error.clone());
                (changed, changed)
            })
            .await?;
        Ok(recorded.unwrap_or(false))
    }

    /// Read-modify-write guarded by `updateTime`.
    ///
    /// `apply` mutates a copy of the asset and reports whether it changed.
    /// Returns `None` when the document does not exist.
    async fn update_if<T, F>(&self, video_id: &VideoId, apply: F) -> FirestoreResult<Option<T>>
    where
        F: Fn(&mut VideoAsset) -> (T, bool),
    {
        let mut last_error = None;

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(doc) = self
                .client
                .get_document(VIDEOS_COLLECTION, video_id.as_str())
                .await?
            else {
                return Ok(None);
            };

            let mut asset = document_to_asset(video_id.as_str(), &doc)?;
            let (result, changed) = apply(&mut asset);
            if !changed {
                return Ok(Some(result));
            }

            match self
                .client
                .update_document_with_precondition(
                    VIDEOS_COLLECTION,
                    video_id.as_str(),
                    state_fields(&asset),
                    Some(STATE_FIELDS.iter().map(|f| f.to_string()).collect()),
                    doc.update_time.as_deref(),
                )
                .await
            {
                Ok(_) => return Ok(Some(result)),
                Err(e) if e.is_precondition_failed() => {
                    record_cas_conflict(VIDEOS_COLLECTION);
                    debug!(
                        video_id = %video_id,
                        attempt = attempt + 1,
                        "Video update lost a race, re-reading"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FirestoreError::PreconditionFailed(format!("videos/{}", video_id))
        }))
    }
}

fn state_fields(asset: &VideoAsset) -> Fields {
    let mut fields = HashMap::new();
    fields.insert("status".to_string(), asset.status.as_str().to_firestore_value());
    fields.insert(
        "claimed_by".to_string(),
        asset.claimed_by.as_ref().map(|r| r.as_str()).to_firestore_value(),
    );
    fields.insert("result_path".to_string(), asset.result_path.to_firestore_value());
    fields.insert("error_message".to_string(), asset.error_message.to_firestore_value());
    fields.insert(
        "updated_at".to_string(),
        asset.updated_at.unwrap_or_else(Utc::now).to_firestore_value(),
    );
    fields
}

/// Map a catalog document to a [`VideoAsset`].
pub fn document_to_asset(video_id: &str, doc: &Document) -> FirestoreResult<VideoAsset> {
    Ok(VideoAsset {
        id: VideoId::from(video_id),
        filename: doc.get("filename").unwrap_or_else(|| video_id.to_string()),
        filepath: doc.require("filepath")?,
        width: doc.get("width"),
        height: doc.get("height"),
        fps: doc.get("fps"),
        duration: doc.get("duration"),
        total_frames: doc.get("total_frames"),
        status: doc
            .get::<String>("status")
            .map(|s| VideoStatus::from_str_lossy(&s))
            .unwrap_or_default(),
        claimed_by: doc.get::<String>("claimed_by").map(RunId::from_string),
        result_path: doc.get("result_path"),
        error_message: doc.get("error_message"),
        updated_at: doc.get("updated_at"),
    })
}
