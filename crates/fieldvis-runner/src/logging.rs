//! Structured run lifecycle logging.

use tracing::{error, info, info_span, warn, Span};

use fieldvis_models::RunId;

/// Logs run lifecycle events with consistent `run_id` and `operation` fields.
#[derive(Debug, Clone)]
pub struct RunLogger {
    run_id: String,
    operation: &'static str,
}

impl RunLogger {
    pub fn new(run_id: &RunId, operation: &'static str) -> Self {
        Self {
            run_id: run_id.to_string(),
            operation,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(run_id = %self.run_id, operation = self.operation, "Run started: {}", message);
    }

    pub fn log_progress(&self, message: &str) {
        info!(run_id = %self.run_id, operation = self.operation, "Run progress: {}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(run_id = %self.run_id, operation = self.operation, "Run warning: {}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(run_id = %self.run_id, operation = self.operation, "Run error: {}", message);
    }

    pub fn log_completion(&self, message: &str) {
        info!(run_id = %self.run_id, operation = self.operation, "Run finished: {}", message);
    }

    /// Span carrying the run context for instrumented tasks.
    pub fn span(&self) -> Span {
        info_span!("run", run_id = %self.run_id, operation = self.operation)
    }
}
