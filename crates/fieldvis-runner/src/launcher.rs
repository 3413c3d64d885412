//! Worker process launcher.
//!
//! `launch` spawns the worker and returns as soon as the OS hands back a
//! pid. Three background tasks then supervise the child: two pumps that copy
//! stdout and stderr into the run log line by line, and an exit watcher that
//! writes the `[exit]` marker and notifies the [`WorkerObserver`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use fieldvis_models::{BackendKind, ResolvedSettings, RunId, WorkerVideo};

use crate::command::WorkerCommand;
use crate::error::{RunnerError, RunnerResult};
use crate::log_sink::LogSink;
use crate::logging::RunLogger;
use crate::signal::{self, SignalOutcome};

/// How long the exit watcher waits for the pumps to drain after exit.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Program to execute, resolved through PATH
    pub program: String,
    /// Arguments placed before the run arguments
    pub base_args: Vec<String>,
    pub work_dir: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            base_args: vec!["cv_scripts/batch_process_videos.py".to_string()],
            work_dir: None,
        }
    }
}

impl LauncherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            program: std::env::var("WORKER_PROGRAM").unwrap_or(defaults.program),
            base_args: std::env::var("WORKER_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.base_args),
            work_dir: std::env::var("WORKER_WORK_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Everything the worker needs for one run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run_id: RunId,
    pub backend: BackendKind,
    pub videos: Vec<WorkerVideo>,
    pub callback_url: String,
    pub settings: ResolvedSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedWorker {
    pub pid: u32,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the exit status could not be collected
    pub wait_error: Option<String>,
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            wait_error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal, &self.wait_error) {
            (_, _, Some(err)) => format!("Worker status unavailable: {}", err),
            (Some(0), _, _) => "Worker exited successfully".to_string(),
            (Some(code), _, _) => format!("Worker exited with code {}", code),
            (None, Some(signal), _) => format!("Worker terminated by signal {}", signal),
            (None, None, None) => "Worker exited without a status".to_string(),
        }
    }

    /// Error form of an unsuccessful exit.
    pub fn to_error(&self) -> Option<RunnerError> {
        (!self.success()).then(|| RunnerError::WorkerExited {
            code: self.code,
            signal: self.signal,
        })
    }
}

/// Receives the worker's exit once its output has been drained.
#[async_trait]
pub trait WorkerObserver: Send + Sync {
    async fn on_worker_exit(&self, run_id: &RunId, exit: &WorkerExit);
}

/// Result of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Signalled { pid: u32 },
    AlreadyExited,
    /// No pid is known for the run
    NoProcess,
}

/// Spawns workers and keeps track of the ones still alive in this process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: LauncherConfig,
    live: Arc<Mutex<HashMap<RunId, u32>>>,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Resolve the configured program, failing early if it is not installed.
    pub fn resolve_program(&self) -> RunnerResult<PathBuf> {
        which::which(&self.config.program)
            .map_err(|_| RunnerError::ProgramNotFound(self.config.program.clone()))
    }

    /// Pid of a worker this process spawned that has not exited yet.
    pub fn live_pid(&self, run_id: &RunId) -> Option<u32> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .copied()
    }

    /// Spawn the worker for `request` and start supervising it.
    ///
    /// Returns once the process exists. Output and exit handling continue in
    /// the background; the observer is always called exactly once per
    /// successful launch.
    pub fn launch(
        &self,
        request: LaunchRequest,
        sink: LogSink,
        observer: Arc<dyn WorkerObserver>,
    ) -> RunnerResult<LaunchedWorker> {
        let logger = RunLogger::new(&request.run_id, "worker");
        let program = self.resolve_program()?;

        let args = WorkerCommand::new(&program)
            .base_args(self.config.base_args.iter().cloned())
            .run_id(&request.run_id)
            .run_type(request.backend)
            .videos(&request.videos)?
            .api_url(request.callback_url.clone())
            .settings(&request.settings)?
            .build_args()?;

        debug!(
            run_id = %request.run_id,
            program = %program.display(),
            "Spawning worker with {} arguments",
            args.len()
        );

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.work_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::spawn_failed(program.display().to_string(), e.to_string()))?;

        let pid = child.id().ok_or_else(|| {
            RunnerError::spawn_failed(
                program.display().to_string(),
                "process exited before its pid could be read",
            )
        })?;

        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.run_id.clone(), pid);

        let stdout_pump = child
            .stdout
            .take()
            .map(|out| spawn_pump(out, sink.clone(), false, logger.clone()));
        let stderr_pump = child
            .stderr
            .take()
            .map(|err| spawn_pump(err, sink.clone(), true, logger.clone()));

        let live = Arc::clone(&self.live);
        let run_id = request.run_id.clone();
        let span = logger.span();
        tokio::spawn(
            async move {
                let exit = match child.wait().await {
                    Ok(status) => WorkerExit::from_status(status),
                    Err(e) => WorkerExit {
                        code: None,
                        signal: None,
                        wait_error: Some(e.to_string()),
                    },
                };

                // The pid may be recycled from here on, even while a
                // descendant still holds the output pipes open.
                live.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&run_id);

                for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
                    if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
                        logger.log_warning("output pump did not drain after exit");
                    }
                }

                let description = exit.describe();
                if let Err(e) = sink.append_marker("exit", &description).await {
                    logger.log_warning(&format!("could not write exit marker: {}", e));
                }
                if exit.success() {
                    logger.log_completion(&description);
                } else {
                    logger.log_error(&description);
                }

                observer.on_worker_exit(&run_id, &exit).await;
            }
            .instrument(span),
        );

        Ok(LaunchedWorker { pid })
    }

    /// Ask the run's worker to stop with SIGTERM.
    ///
    /// A worker spawned by this process is signalled through its tracked pid.
    /// Otherwise `stored_pid` is used unless the worker is already known to
    /// have exited, which keeps a recycled pid from being signalled.
    pub fn terminate(
        &self,
        run_id: &RunId,
        stored_pid: Option<u32>,
        known_exited: bool,
    ) -> RunnerResult<TerminateOutcome> {
        let pid = match self.live_pid(run_id) {
            Some(pid) => pid,
            None if known_exited => return Ok(TerminateOutcome::AlreadyExited),
            None => match stored_pid {
                Some(pid) => pid,
                None => return Ok(TerminateOutcome::NoProcess),
            },
        };

        match signal::terminate(pid)? {
            SignalOutcome::Delivered => Ok(TerminateOutcome::Signalled { pid }),
            SignalOutcome::AlreadyExited => Ok(TerminateOutcome::AlreadyExited),
        }
    }
}

/// Copy one output stream into the run log until EOF.
///
/// Lines are split on raw bytes and decoded lossily, so non-UTF-8 output
/// never stops the pump. Stopping early would close the pipe and kill the
/// worker with SIGPIPE on its next write.
fn spawn_pump<R>(reader: R, sink: LogSink, is_stderr: bool, logger: RunLogger) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(trim_line_ending(&buf));
                    let written = if is_stderr {
                        sink.append_stderr(&line).await
                    } else {
                        sink.append_stdout(&line).await
                    };
                    if let Err(e) = written {
                        warn!("Dropping worker output line: {}", e);
                    }
                }
                Err(e) => {
                    logger.log_warning(&format!("worker output stream failed: {}", e));
                    break;
                }
            }
        }
    })
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
