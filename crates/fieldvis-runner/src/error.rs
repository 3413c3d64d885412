//! Error types for worker supervision.

use thiserror::Error;

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Worker program not found: {0}")]
    ProgramNotFound(String),

    #[error("Failed to start worker `{program}`: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("Worker exited unsuccessfully (code {code:?}, signal {signal:?})")]
    WorkerExited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("Run log error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode worker arguments: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn spawn_failed(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            message: message.into(),
        }
    }

    pub fn signal(pid: u32, message: impl Into<String>) -> Self {
        Self::Signal {
            pid,
            message: message.into(),
        }
    }

    /// Whether the worker never started.
    pub fn is_spawn_error(&self) -> bool {
        matches!(
            self,
            RunnerError::SpawnFailed { .. } | RunnerError::ProgramNotFound(_)
        )
    }
}
