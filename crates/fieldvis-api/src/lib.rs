//! Axum HTTP API server for processing runs.
//!
//! This crate provides:
//! - Run submission with per-video claiming
//! - Worker launch, exit reconciliation and cancellation
//! - Callback endpoints for worker progress, heartbeats and logs
//! - Optional Firebase ID token verification
//! - Rate limiting, security headers and Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

pub use config::{ApiConfig, OrchestratorConfig, StoreBackend};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::StaleRunDetector;
pub use state::AppState;
pub use store::{AssetCatalog, InMemoryStore, RunStore, StoreError};
