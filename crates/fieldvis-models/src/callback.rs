//! Payloads the worker sends back while a run executes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{RunId, VideoId, VideoOutcome};

/// Result for one video of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoCompleteRequest {
    pub run_id: RunId,
    pub video_id: VideoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_analysis_path: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VideoCompleteRequest {
    pub fn outcome(&self) -> VideoOutcome {
        if self.success {
            VideoOutcome::Succeeded
        } else {
            VideoOutcome::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub run_id: RunId,
}

/// Heartbeat reply; workers stop cooperatively once `cancel_requested` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub success: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveLogsRequest {
    pub run_id: RunId,
}
