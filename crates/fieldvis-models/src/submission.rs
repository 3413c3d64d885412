//! Run submission wire types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{RunId, SettingsOverrides};

/// Body of a run submission.
///
/// `run_type` stays a string so an unknown value is reported as a
/// validation error instead of a body rejection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRunRequest {
    #[serde(default)]
    pub video_ids: Vec<String>,
    #[serde(default)]
    pub run_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsOverrides>,
}

/// Result of a run submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRunResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub videos_to_process: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_completed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_in_progress: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_found: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
