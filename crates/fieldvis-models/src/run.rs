//! Processing run definitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::VideoId;

/// Unique identifier for a processing run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute backend a run executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum BackendKind {
    /// Worker runs analysis on this host
    #[default]
    #[serde(rename = "local")]
    Local,
    /// Lower remote GPU tier
    #[serde(rename = "remote-tier-1", alias = "modal-t4")]
    RemoteTier1,
    /// Higher remote GPU tier
    #[serde(rename = "remote-tier-2", alias = "modal-a10g")]
    RemoteTier2,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::RemoteTier1 => "remote-tier-1",
            BackendKind::RemoteTier2 => "remote-tier-2",
        }
    }

    /// Value the worker accepts for `--run-type`.
    pub fn worker_arg(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::RemoteTier1 => "modal-t4",
            BackendKind::RemoteTier2 => "modal-a10g",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a run type string names no known backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid run type '{0}'. Must be one of: local, remote-tier-1, remote-tier-2")]
pub struct ParseBackendKindError(pub String);

impl FromStr for BackendKind {
    type Err = ParseBackendKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local" => Ok(BackendKind::Local),
            "remote-tier-1" | "modal-t4" => Ok(BackendKind::RemoteTier1),
            "remote-tier-2" | "modal-a10g" => Ok(BackendKind::RemoteTier2),
            other => Err(ParseBackendKindError(other.to_string())),
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the worker process backing a run.
///
/// `Launching -> Running -> Completed | Crashed`, or `Launching -> Failed`
/// when the process could not be started at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Launching,
    Running,
    /// Exited with status 0
    Completed,
    /// Spawn failed
    Failed,
    /// Exited non-zero, was killed by a signal, or stopped heartbeating
    Crashed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Launching => "launching",
            WorkerState::Running => "running",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Crashed => "crashed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "running" => WorkerState::Running,
            "completed" => WorkerState::Completed,
            "failed" => WorkerState::Failed,
            "crashed" => WorkerState::Crashed,
            _ => WorkerState::Launching,
        }
    }

    /// Whether the worker process is known to be gone.
    pub fn has_exited(&self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::Crashed
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result reported for a single video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoOutcome {
    Succeeded,
    Failed,
}

/// A batch processing run over a set of videos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRun {
    pub id: RunId,

    /// Submitting user, when the request was authenticated
    #[serde(default)]
    pub owner: Option<String>,

    pub backend: BackendKind,

    /// Claimed videos, in submission order
    pub video_ids: Vec<VideoId>,

    pub total_videos: u32,
    #[serde(default)]
    pub videos_processed: u32,
    #[serde(default)]
    pub videos_failed: u32,

    #[serde(default)]
    pub status: RunStatus,

    #[serde(default)]
    pub worker_state: WorkerState,

    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// OS process id of the worker, once spawned
    #[serde(default)]
    pub process_id: Option<u32>,

    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Videos whose result has already been counted
    #[serde(default)]
    pub reported_video_ids: Vec<VideoId>,

    #[serde(default)]
    pub log_reference: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Last saved tail of the run log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl ProcessingRun {
    /// Create a running run over already-claimed videos.
    pub fn new(id: RunId, backend: BackendKind, video_ids: Vec<VideoId>) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner: None,
            backend,
            total_videos: video_ids.len() as u32,
            video_ids,
            videos_processed: 0,
            videos_failed: 0,
            status: RunStatus::Running,
            worker_state: WorkerState::Launching,
            started_at: now,
            completed_at: None,
            process_id: None,
            cancel_requested: false,
            last_heartbeat: None,
            reported_video_ids: Vec::new(),
            log_reference: None,
            error_message: None,
            logs: None,
            updated_at: now,
        }
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_log_reference(mut self, log_reference: impl Into<String>) -> Self {
        self.log_reference = Some(log_reference.into());
        self
    }

    pub fn contains_video(&self, video_id: &VideoId) -> bool {
        self.video_ids.contains(video_id)
    }

    pub fn is_reported(&self, video_id: &VideoId) -> bool {
        self.reported_video_ids.contains(video_id)
    }

    /// Videos that have not reported a result yet.
    pub fn unreported_videos(&self) -> Vec<VideoId> {
        self.video_ids
            .iter()
            .filter(|id| !self.is_reported(id))
            .cloned()
            .collect()
    }

    pub fn reported_count(&self) -> u32 {
        self.videos_processed + self.videos_failed
    }

    /// Whether a signal or the cancellation flag could reach the worker.
    pub fn has_cancellation_channel(&self) -> bool {
        self.process_id.is_some() || self.last_heartbeat.is_some()
    }

    /// Count one video result.
    ///
    /// Returns `false` (and changes nothing) for a video outside the run or
    /// one that already reported. Completes the run once every video has
    /// reported; a run that is already terminal keeps its status.
    pub fn record_video_result(&mut self, video_id: &VideoId, outcome: VideoOutcome) -> bool {
        if !self.contains_video(video_id) || self.is_reported(video_id) {
            return false;
        }
        if self.reported_count() >= self.total_videos {
            return false;
        }

        self.reported_video_ids.push(video_id.clone());
        match outcome {
            VideoOutcome::Succeeded => self.videos_processed += 1,
            VideoOutcome::Failed => self.videos_failed += 1,
        }

        if self.status == RunStatus::Running && self.reported_count() == self.total_videos {
            let status = if self.videos_processed == 0 {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
            self.finish(status);
        }
        self.touch();
        true
    }

    /// Move a running run to `cancelled`. Returns `false` if it had already finished.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.cancel_requested = true;
        self.finish(RunStatus::Cancelled);
        self.touch();
        true
    }

    /// Settle a run whose worker is gone.
    ///
    /// Unreported videos are counted as failed. Returns the videos that were
    /// counted here, or an empty list when the run had already reached a
    /// terminal status.
    pub fn settle_after_worker_exit(&mut self, clean_exit: bool, reason: &str) -> Vec<VideoId> {
        if self.status.is_terminal() {
            return Vec::new();
        }

        let unreported = self.unreported_videos();
        for video_id in &unreported {
            if self.reported_count() >= self.total_videos {
                break;
            }
            self.reported_video_ids.push(video_id.clone());
            self.videos_failed += 1;
        }

        let status = if !clean_exit || self.videos_processed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if status == RunStatus::Failed && self.error_message.is_none() {
            self.error_message = Some(reason.to_string());
        }
        self.finish(status);
        self.touch();
        unreported
    }

    /// Fail a run whose worker never started.
    pub fn fail_launch(&mut self, reason: impl Into<String>) -> bool {
        self.worker_state = WorkerState::Failed;
        self.touch();
        if self.status.is_terminal() {
            return false;
        }
        self.error_message = Some(reason.into());
        self.finish(RunStatus::Failed);
        true
    }

    pub fn set_worker_state(&mut self, state: WorkerState) -> bool {
        if self.worker_state == state {
            return false;
        }
        // A late "running" must not overwrite an exit already observed.
        if state == WorkerState::Running && self.worker_state.has_exited() {
            return false;
        }
        self.worker_state = state;
        self.touch();
        true
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
        self.touch();
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(ids: &[&str]) -> ProcessingRun {
        ProcessingRun::new(
            RunId::from_string("run-1"),
            BackendKind::Local,
            ids.iter().map(|id| VideoId::from(*id)).collect(),
        )
    }

    #[test]
    fn test_run_id_generation() {
        let id1 = RunId::new();
        let id2 = RunId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(
            "remote-tier-2".parse::<BackendKind>().unwrap(),
            BackendKind::RemoteTier2
        );
        assert_eq!(
            "modal-t4".parse::<BackendKind>().unwrap(),
            BackendKind::RemoteTier1
        );
        let err = "bogus".parse::<BackendKind>().unwrap_err();
        assert!(err.to_string().to_lowercase().contains("invalid run type"));
    }

    #[test]
    fn test_backend_kind_serde_aliases() {
        let kind: BackendKind = serde_json::from_str("\"modal-a10g\"").unwrap();
        assert_eq!(kind, BackendKind::RemoteTier2);
        assert_eq!(
            serde_json::to_string(&BackendKind::RemoteTier1).unwrap(),
            "\"remote-tier-1\""
        );
    }

    #[test]
    fn test_backend_kind_worker_arg() {
        assert_eq!(BackendKind::Local.worker_arg(), "local");
        assert_eq!(BackendKind::RemoteTier1.worker_arg(), "modal-t4");
        assert_eq!(BackendKind::RemoteTier2.worker_arg(), "modal-a10g");
    }

    #[test]
    fn test_new_run_counts_videos() {
        let run = run_with(&["a", "b", "c"]);
        assert_eq!(run.total_videos, 3);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.worker_state, WorkerState::Launching);
        assert!(!run.has_cancellation_channel());
    }

    #[test]
    fn test_record_results_completes_run() {
        let mut run = run_with(&["a", "b"]);
        assert!(run.record_video_result(&"a".into(), VideoOutcome::Succeeded));
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.record_video_result(&"b".into(), VideoOutcome::Failed));
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.videos_processed, 1);
        assert_eq!(run.videos_failed, 1);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_record_result_is_idempotent() {
        let mut run = run_with(&["a", "b"]);
        assert!(run.record_video_result(&"a".into(), VideoOutcome::Succeeded));
        assert!(!run.record_video_result(&"a".into(), VideoOutcome::Succeeded));
        assert!(!run.record_video_result(&"zzz".into(), VideoOutcome::Succeeded));
        assert_eq!(run.reported_count(), 1);
    }

    #[test]
    fn test_all_failed_marks_run_failed() {
        let mut run = run_with(&["a"]);
        run.record_video_result(&"a".into(), VideoOutcome::Failed);
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let mut run = run_with(&["a", "b"]);
        assert!(run.cancel());
        assert!(!run.cancel());
        assert!(run.cancel_requested);

        // Late results are counted but do not flip the status.
        assert!(run.record_video_result(&"a".into(), VideoOutcome::Succeeded));
        assert!(run.record_video_result(&"b".into(), VideoOutcome::Succeeded));
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_settle_after_crash_fails_unreported() {
        let mut run = run_with(&["a", "b", "c"]);
        run.record_video_result(&"a".into(), VideoOutcome::Succeeded);

        let settled = run.settle_after_worker_exit(false, "Worker exited with code 1");
        assert_eq!(settled, vec![VideoId::from("b"), VideoId::from("c")]);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.videos_failed, 2);
        assert!(run.reported_count() <= run.total_videos);
        assert_eq!(run.error_message.as_deref(), Some("Worker exited with code 1"));
    }

    #[test]
    fn test_settle_after_clean_exit_completes() {
        let mut run = run_with(&["a", "b"]);
        run.record_video_result(&"a".into(), VideoOutcome::Succeeded);
        run.settle_after_worker_exit(true, "unused");
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.error_message.is_none());
    }

    #[test]
    fn test_settle_ignores_cancelled_run() {
        let mut run = run_with(&["a"]);
        run.cancel();
        assert!(run.settle_after_worker_exit(false, "x").is_empty());
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_worker_state_does_not_regress() {
        let mut run = run_with(&["a"]);
        assert!(run.set_worker_state(WorkerState::Crashed));
        assert!(!run.set_worker_state(WorkerState::Running));
        assert_eq!(run.worker_state, WorkerState::Crashed);
    }

    #[test]
    fn test_fail_launch() {
        let mut run = run_with(&["a"]);
        assert!(run.fail_launch("spawn failed"));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.worker_state, WorkerState::Failed);
    }
}
