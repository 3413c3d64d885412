//! Shared data models for the FieldVis run orchestrator.
//!
//! This crate provides Serde-serializable types for:
//! - Video assets held in the catalog
//! - Processing runs and their worker lifecycle
//! - Analysis settings and the default-merging resolver
//! - Submission and worker callback wire payloads

pub mod callback;
pub mod run;
pub mod settings;
pub mod submission;
pub mod video;

// Re-export common types
pub use callback::{
    HeartbeatRequest, HeartbeatResponse, SaveLogsRequest, VideoCompleteRequest,
};
pub use run::{
    BackendKind, ParseBackendKindError, ProcessingRun, RunId, RunStatus, VideoOutcome,
    WorkerState,
};
pub use settings::{
    resolve_settings, BenthicActivityArgs, ResolvedSettings, SettingsOverrides, WorkerSettings,
};
pub use submission::{SubmitRunRequest, SubmitRunResponse};
pub use video::{ClaimOutcome, VideoAsset, VideoId, VideoStatus, WorkerVideo};
