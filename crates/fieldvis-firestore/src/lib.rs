//! Firestore REST API client.
//!
//! This crate provides:
//! - A REST client with service account auth via gcp_auth
//! - Token caching, retry with jitter, per-request metrics
//! - Conditional writes on `updateTime` for compare-and-set updates
//! - Typed repositories for video assets and processing runs

pub mod asset_repo;
pub mod client;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod run_repo;
pub mod token_cache;
pub mod types;

pub use asset_repo::VideoAssetRepository;
pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use retry::RetryConfig;
pub use run_repo::ProcessingRunRepository;
pub use types::{Document, FromFirestoreValue, ToFirestoreValue, Value};
