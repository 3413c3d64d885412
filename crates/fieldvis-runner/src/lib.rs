//! Worker process supervision for processing runs.
//!
//! This crate provides:
//! - A builder for the worker command line
//! - A launcher that spawns the worker, streams its output into the run log
//!   and reports its exit to an observer
//! - The per-run append-only log sink
//! - SIGTERM delivery for cancellation

pub mod command;
pub mod error;
pub mod launcher;
pub mod log_sink;
pub mod logging;
pub mod signal;

pub use command::WorkerCommand;
pub use error::{RunnerError, RunnerResult};
pub use launcher::{
    LaunchRequest, LaunchedWorker, LauncherConfig, ProcessLauncher, TerminateOutcome,
    WorkerExit, WorkerObserver,
};
pub use log_sink::LogSink;
pub use logging::RunLogger;
pub use signal::SignalOutcome;
