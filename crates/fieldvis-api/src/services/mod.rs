//! Run orchestration services.

pub mod cancellation;
pub mod launch;
pub mod progress;
pub mod reconcile;
pub mod stale_run_detector;
pub mod submission;

pub use cancellation::{CancelOutcome, CancelReport, CancellationService};
pub use launch::{LaunchCoordinator, LaunchStatus};
pub use progress::{CompleteResponse, ProgressService, SaveLogsResponse};
pub use reconcile::{RunReconciler, SettleReport};
pub use stale_run_detector::StaleRunDetector;
pub use submission::SubmissionService;
