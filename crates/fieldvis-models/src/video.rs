//! Video asset models.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{RunId, VideoOutcome};

/// Identifier of a video asset in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VideoId(pub String);

impl VideoId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VideoId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VideoId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Processing status of a video asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    /// Uploaded, not yet analysed
    #[default]
    Pending,
    /// Claimed by a running run
    Processing,
    /// Analysis finished and results were written
    Completed,
    /// Last analysis attempt failed; eligible for resubmission
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Processing => "processing",
            VideoStatus::Completed => "completed",
            VideoStatus::Failed => "failed",
        }
    }

    /// Parse the stored string form. Unknown values read as pending.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "processing" => VideoStatus::Processing,
            "completed" => VideoStatus::Completed,
            "failed" => VideoStatus::Failed,
            _ => VideoStatus::Pending,
        }
    }

    /// Whether a new run may claim a video in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, VideoStatus::Pending | VideoStatus::Failed)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A video as recorded in the asset catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoAsset {
    pub id: VideoId,

    /// Display name (original upload filename)
    pub filename: String,

    /// Storage reference the worker reads from
    pub filepath: String,

    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,

    /// Duration in seconds
    #[serde(default)]
    pub duration: Option<f64>,

    #[serde(default)]
    pub total_frames: Option<u64>,

    #[serde(default)]
    pub status: VideoStatus,

    /// Run currently holding the processing claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<RunId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl VideoAsset {
    pub fn new(
        id: impl Into<VideoId>,
        filename: impl Into<String>,
        filepath: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            filepath: filepath.into(),
            width: None,
            height: None,
            fps: None,
            duration: None,
            total_frames: None,
            status: VideoStatus::Pending,
            claimed_by: None,
            result_path: None,
            error_message: None,
            updated_at: None,
        }
    }

    pub fn with_status(mut self, status: VideoStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether `run_id` currently holds the claim on this video.
    pub fn is_claimed_by(&self, run_id: &RunId) -> bool {
        self.status == VideoStatus::Processing && self.claimed_by.as_ref() == Some(run_id)
    }

    /// Take the processing claim for `run_id` if the video is claimable.
    pub fn claim_for(&mut self, run_id: &RunId) -> ClaimOutcome {
        match self.status {
            VideoStatus::Completed => ClaimOutcome::AlreadyCompleted,
            VideoStatus::Processing => ClaimOutcome::AlreadyClaimed(self.claimed_by.clone()),
            VideoStatus::Pending | VideoStatus::Failed => {
                self.status = VideoStatus::Processing;
                self.claimed_by = Some(run_id.clone());
                self.error_message = None;
                self.updated_at = Some(Utc::now());
                ClaimOutcome::Claimed
            }
        }
    }

    /// Hand the video back to `pending` if `run_id` still holds the claim.
    pub fn release_from(&mut self, run_id: &RunId) -> bool {
        if !self.is_claimed_by(run_id) {
            return false;
        }
        self.status = VideoStatus::Pending;
        self.claimed_by = None;
        self.updated_at = Some(Utc::now());
        true
    }

    /// Store a worker result if `run_id` still holds the claim.
    pub fn record_result(
        &mut self,
        run_id: &RunId,
        outcome: VideoOutcome,
        result_path: Option<String>,
        error: Option<String>,
    ) -> bool {
        if !self.is_claimed_by(run_id) {
            return false;
        }
        match outcome {
            VideoOutcome::Succeeded => {
                self.status = VideoStatus::Completed;
                self.result_path = result_path;
                self.error_message = None;
            }
            VideoOutcome::Failed => {
                self.status = VideoStatus::Failed;
                self.error_message = error.or_else(|| Some("Processing failed".to_string()));
            }
        }
        self.claimed_by = None;
        self.updated_at = Some(Utc::now());
        true
    }

    /// Descriptor handed to the worker process.
    pub fn to_worker_video(&self) -> WorkerVideo {
        WorkerVideo {
            video_id: self.id.clone(),
            filename: self.filename.clone(),
            filepath: self.filepath.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            duration: self.duration,
            total_frames: self.total_frames,
        }
    }
}

/// Result of trying to claim a video for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another run holds the claim
    AlreadyClaimed(Option<RunId>),
    AlreadyCompleted,
    Missing,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// Per-video entry of the `--videos` worker argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerVideo {
    #[serde(rename = "video_id")]
    pub video_id: VideoId,
    pub filename: String,
    pub filepath: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
}
