//! API configuration.

use std::path::PathBuf;
use std::time::Duration;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Rate limit requests per second, per client IP
    pub rate_limit_rps: u32,
    /// Request timeout
    pub request_timeout: Duration,
    /// Max request body size
    pub max_body_size: usize,
    /// Environment (development/production)
    pub environment: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            rate_limit_rps: 10,
            request_timeout: Duration::from_secs(30),
            max_body_size: 2 * 1024 * 1024, // 2MB
            environment: "development".to_string(),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: env_parse("API_PORT").unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS").unwrap_or(defaults.rate_limit_rps),
            request_timeout: env_parse("REQUEST_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_body_size: env_parse("MAX_BODY_SIZE").unwrap_or(defaults.max_body_size),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }
}

/// Where runs and video assets are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local maps, for development and tests
    Memory,
    Firestore,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" | "in-memory" => Some(StoreBackend::Memory),
            "firestore" => Some(StoreBackend::Firestore),
            _ => None,
        }
    }
}

/// Run orchestration settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub store_backend: StoreBackend,
    /// JSON array of video assets loaded into the in-memory catalog
    pub catalog_seed_file: Option<PathBuf>,
    /// Directory holding one log file per run
    pub run_log_dir: PathBuf,
    /// Base URL the worker calls back to
    pub callback_base_url: String,
    /// Largest log tail returned or snapshotted, in bytes
    pub log_tail_max_bytes: usize,
    pub enable_stale_detection: bool,
    /// Heartbeat age after which a running run is considered lost
    pub stale_threshold: Duration,
    /// Time a run may go without its first heartbeat
    pub stale_grace_period: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            catalog_seed_file: None,
            run_log_dir: PathBuf::from("logs"),
            callback_base_url: "http://127.0.0.1:8000".to_string(),
            log_tail_max_bytes: 512 * 1024,
            enable_stale_detection: false,
            stale_threshold: Duration::from_secs(60),
            stale_grace_period: Duration::from_secs(120),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_backend: std::env::var("STORE_BACKEND")
                .ok()
                .and_then(|s| StoreBackend::parse(&s))
                .unwrap_or(defaults.store_backend),
            catalog_seed_file: std::env::var("CATALOG_SEED_FILE").ok().map(PathBuf::from),
            run_log_dir: std::env::var("RUN_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.run_log_dir),
            callback_base_url: std::env::var("CALLBACK_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.callback_base_url),
            log_tail_max_bytes: env_parse("LOG_TAIL_MAX_BYTES")
                .unwrap_or(defaults.log_tail_max_bytes),
            enable_stale_detection: std::env::var("ENABLE_STALE_DETECTION")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enable_stale_detection),
            stale_threshold: env_parse("STALE_RUN_THRESHOLD_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_threshold),
            stale_grace_period: env_parse("STALE_GRACE_PERIOD_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_grace_period),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_orchestrator_config_from_env() {
        std::env::set_var("STORE_BACKEND", "firestore");
        std::env::set_var("CALLBACK_BASE_URL", "http://api.internal:9000/");
        std::env::set_var("ENABLE_STALE_DETECTION", "1");
        std::env::set_var("STALE_RUN_THRESHOLD_SECS", "90");

        let config = OrchestratorConfig::from_env();
        assert_eq!(config.store_backend, StoreBackend::Firestore);
        assert_eq!(config.callback_base_url, "http://api.internal:9000");
        assert!(config.enable_stale_detection);
        assert_eq!(config.stale_threshold, Duration::from_secs(90));
        assert_eq!(config.stale_grace_period, Duration::from_secs(120));

        std::env::remove_var("STORE_BACKEND");
        std::env::remove_var("CALLBACK_BASE_URL");
        std::env::remove_var("ENABLE_STALE_DETECTION");
        std::env::remove_var("STALE_RUN_THRESHOLD_SECS");
    }

    #[test]
    #[serial]
    fn test_stale_detection_is_off_by_default() {
        std::env::remove_var("ENABLE_STALE_DETECTION");
        std::env::remove_var("STORE_BACKEND");
        let config = OrchestratorConfig::from_env();
        assert!(!config.enable_stale_detection);
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.log_tail_max_bytes, 512 * 1024);
    }

    #[test]
    #[serial]
    fn test_api_config_parses_origins() {
        std::env::set_var("CORS_ORIGINS", "http://a.test, http://b.test");
        std::env::set_var("API_PORT", "not-a-port");
        let config = ApiConfig::from_env();
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.port, 8000);
        std::env::remove_var("CORS_ORIGINS");
        std::env::remove_var("API_PORT");
    }
}
