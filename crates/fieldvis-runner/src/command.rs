//! Worker command line builder.

use std::path::{Path, PathBuf};

use fieldvis_models::{BackendKind, ResolvedSettings, RunId, WorkerVideo};

use crate::error::{RunnerError, RunnerResult};

/// Builder for the worker invocation.
///
/// Configured base arguments (typically the worker script) come first,
/// followed by the fixed run arguments:
/// `--run-id --run-type --videos --api-url --settings`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    base_args: Vec<String>,
    run_id: Option<String>,
    run_type: Option<BackendKind>,
    videos_json: Option<String>,
    api_url: Option<String>,
    settings_json: Option<String>,
}

impl WorkerCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            base_args: Vec::new(),
            run_id: None,
            run_type: None,
            videos_json: None,
            api_url: None,
            settings_json: None,
        }
    }

    pub fn base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn run_id(mut self, run_id: &RunId) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn run_type(mut self, backend: BackendKind) -> Self {
        self.run_type = Some(backend);
        self
    }

    pub fn videos(mut self, videos: &[WorkerVideo]) -> RunnerResult<Self> {
        self.videos_json = Some(serde_json::to_string(videos)?);
        Ok(self)
    }

    /// Base URL the worker posts progress callbacks to.
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn settings(mut self, settings: &ResolvedSettings) -> RunnerResult<Self> {
        self.settings_json = Some(settings.to_worker_json()?);
        Ok(self)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Build the argument vector, failing if a run argument is missing.
    pub fn build_args(&self) -> RunnerResult<Vec<String>> {
        let missing = |name: &str| {
            RunnerError::spawn_failed(
                self.program.display().to_string(),
                format!("missing worker argument --{}", name),
            )
        };

        let mut args = self.base_args.clone();
        args.push("--run-id".to_string());
        args.push(self.run_id.clone().ok_or_else(|| missing("run-id"))?);
        args.push("--run-type".to_string());
        args.push(
            self.run_type
                .ok_or_else(|| missing("run-type"))?
                .worker_arg()
                .to_string(),
        );
        args.push("--videos".to_string());
        args.push(self.videos_json.clone().ok_or_else(|| missing("videos"))?);
        args.push("--api-url".to_string());
        args.push(self.api_url.clone().ok_or_else(|| missing("api-url"))?);
        args.push("--settings".to_string());
        args.push(self.settings_json.clone().ok_or_else(|| missing("settings"))?);
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldvis_models::{resolve_settings, VideoAsset};

    fn flag_value<'a>(args: &'a [String], flag: &str) -> &'a str {
        let pos = args.iter().position(|a| a == flag).unwrap();
        &args[pos + 1]
    }

    #[test]
    fn test_command_builder() {
        let video = VideoAsset::new("v1", "reef.mp4", "/data/reef.mp4").to_worker_video();
        let args = WorkerCommand::new("python3")
            .base_args(["cv_scripts/batch_process_videos.py"])
            .run_id(&RunId::from_string("run-1"))
            .run_type(BackendKind::RemoteTier2)
            .videos(&[video])
            .unwrap()
            .api_url("http://localhost:8000")
            .settings(&resolve_settings(None))
            .unwrap()
            .build_args()
            .unwrap();

        assert_eq!(args[0], "cv_scripts/batch_process_videos.py");
        assert_eq!(flag_value(&args, "--run-id"), "run-1");
        assert_eq!(flag_value(&args, "--run-type"), "modal-a10g");
        assert_eq!(flag_value(&args, "--api-url"), "http://localhost:8000");

        let videos: serde_json::Value =
            serde_json::from_str(flag_value(&args, "--videos")).unwrap();
        assert_eq!(videos[0]["video_id"], "v1");
        assert_eq!(videos[0]["filepath"], "/data/reef.mp4");

        let settings: serde_json::Value =
            serde_json::from_str(flag_value(&args, "--settings")).unwrap();
        assert_eq!(settings["enableYolo"], true);
        assert_eq!(settings["yoloModel"], "yolov8m");
        assert_eq!(settings["benthicActivityParams"]["max_skip_frames"], 60);
    }

    #[test]
    fn test_missing_argument_is_an_error() {
        let result = WorkerCommand::new("python3")
            .run_id(&RunId::from_string("run-1"))
            .build_args();
        assert!(result.unwrap_err().to_string().contains("--run-type"));
    }
}
