//! Processing run repository.

use std::collections::HashMap;
use std::time::Duration;

use fieldvis_models::{BackendKind, ProcessingRun, RunId, RunStatus, VideoId, WorkerState};
use tracing::debug;

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_cas_conflict;
use crate::types::{Document, Fields, StructuredQuery, ToFirestoreValue};

pub const RUNS_COLLECTION: &str = "processing_runs";

const MAX_CAS_ATTEMPTS: u32 = 8;

#[derive(Clone)]
pub struct ProcessingRunRepository {
    client: FirestoreClient,
}

impl ProcessingRunRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    pub async fn create(&self, run: &ProcessingRun) -> FirestoreResult<()> {
        self.client
            .create_document(RUNS_COLLECTION, run.id.as_str(), run_to_fields(run))
            .await?;
        Ok(())
    }

    pub async fn get(&self, run_id: &RunId) -> FirestoreResult<Option<ProcessingRun>> {
        let doc = self
            .client
            .with_retry("get_run", || {
                self.client.get_document(RUNS_COLLECTION, run_id.as_str())
            })
            .await?;
        doc.map(|d| document_to_run(run_id.as_str(), &d)).transpose()
    }

    /// Apply `mutate` to the stored run under an `updateTime` precondition.
    ///
    /// `mutate` returns whether it changed anything; unchanged runs are not
    /// written. Returns the run as stored afterwards, or `None` if missing.
    pub async fn modify<F>(&self, run_id: &RunId, mutate: F) -> FirestoreResult<Option<ProcessingRun>>
    where
        F: Fn(&mut ProcessingRun) -> bool,
    {
        let mut last_error = None;

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(doc) = self
                .client
                .get_document(RUNS_COLLECTION, run_id.as_str())
                .await?
            else {
                return Ok(None);
            };

            let mut run = document_to_run(run_id.as_str(), &doc)?;
            if !mutate(&mut run) {
                return Ok(Some(run));
            }

            match self
                .client
                .update_document_with_precondition(
                    RUNS_COLLECTION,
                    run_id.as_str(),
                    run_to_fields(&run),
                    None,
                    doc.update_time.as_deref(),
                )
                .await
            {
                Ok(_) => return Ok(Some(run)),
                Err(e) if e.is_precondition_failed() => {
                    record_cas_conflict(RUNS_COLLECTION);
                    debug!(
                        run_id = %run_id,
                        attempt = attempt + 1,
                        "Run update lost a race, re-reading"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| FirestoreError::PreconditionFailed(format!("{}/{}", RUNS_COLLECTION, run_id))))
    }

    /// Runs still marked `running`.
    pub async fn list_running(&self, limit: i32) -> FirestoreResult<Vec<ProcessingRun>> {
        let query = StructuredQuery::field_equals(
            RUNS_COLLECTION,
            "status",
            RunStatus::Running.as_str().to_firestore_value(),
            Some(limit),
        );
        let docs = self
            .client
            .with_retry("list_running_runs", || self.client.run_query(query.clone()))
            .await?;

        docs.iter()
            .filter_map(|doc| doc.doc_id().map(|id| document_to_run(id, doc)))
            .collect()
    }
}

fn ids_to_strings(ids: &[VideoId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

pub fn run_to_fields(run: &ProcessingRun) -> Fields {
    let mut fields = HashMap::new();
    fields.insert("owner".to_string(), run.owner.to_firestore_value());
    fields.insert("backend".to_string(), run.backend.as_str().to_firestore_value());
    fields.insert(
        "video_ids".to_string(),
        ids_to_strings(&run.video_ids).to_firestore_value(),
    );
    fields.insert("total_videos".to_string(), run.total_videos.to_firestore_value());
    fields.insert(
        "videos_processed".to_string(),
        run.videos_processed.to_firestore_value(),
    );
    fields.insert("videos_failed".to_string(), run.videos_failed.to_firestore_value());
    fields.insert("status".to_string(), run.status.as_str().to_firestore_value());
    fields.insert(
        "worker_state".to_string(),
        run.worker_state.as_str().to_firestore_value(),
    );
    fields.insert("started_at".to_string(), run.started_at.to_firestore_value());
    fields.insert("completed_at".to_string(), run.completed_at.to_firestore_value());
    fields.insert("process_id".to_string(), run.process_id.to_firestore_value());
    fields.insert(
        "cancel_requested".to_string(),
        run.cancel_requested.to_firestore_value(),
    );
    fields.insert("last_heartbeat".to_string(), run.last_heartbeat.to_firestore_value());
    fields.insert(
        "reported_video_ids".to_string(),
        ids_to_strings(&run.reported_video_ids).to_firestore_value(),
    );
    fields.insert("log_reference".to_string(), run.log_reference.to_firestore_value());
    fields.insert("error_message".to_string(), run.error_message.to_firestore_value());
    fields.insert("logs".to_string(), run.logs.to_firestore_value());
    fields.insert("updated_at".to_string(), run.updated_at.to_firestore_value());
    fields
}

pub fn document_to_run(run_id: &str, doc: &Document) -> FirestoreResult<ProcessingRun> {
    let backend: String = doc.require("backend")?;
    let backend: BackendKind = backend
        .parse()
        .map_err(|e| FirestoreError::invalid_document(format!("run {}: {}", run_id, e)))?;
    let to_ids = |key: &str| -> Vec<VideoId> {
        doc.get::<Vec<String>>(key)
            .unwrap_or_default()
            .into_iter()
            .map(VideoId::from)
            .collect()
    };

    Ok(ProcessingRun {
        id: RunId::from_string(run_id),
        owner: doc.get("owner"),
        backend,
        video_ids: to_ids("video_ids"),
        total_videos: doc.get("total_videos").unwrap_or(0),
        videos_processed: doc.get("videos_processed").unwrap_or(0),
        videos_failed: doc.get("videos_failed").unwrap_or(0),
        status: doc
            .get::<String>("status")
            .map(|s| RunStatus::from_str_lossy(&s))
            .unwrap_or_default(),
        worker_state: doc
            .get::<String>("worker_state")
            .map(|s| WorkerState::from_str_lossy(&s))
            .unwrap_or_default(),
        started_at: doc.require("started_at")?,
        completed_at: doc.get("completed_at"),
        process_id: doc.get("process_id"),
        cancel_requested: doc.get("cancel_requested").unwrap_or(false),
        last_heartbeat: doc.get("last_heartbeat"),
        reported_video_ids: to_ids("reported_video_ids"),
        log_reference: doc.get("log_reference"),
        error_message: doc.get("error_message"),
        logs: doc.get("logs"),
        updated_at: doc.require("updated_at")?,
    })
}
