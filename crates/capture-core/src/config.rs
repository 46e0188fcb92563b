//! ============================================================================
//! Core Configuration
//! ============================================================================
//! Assembled from environment variables with defaults. Binaries load `.env`
//! (dotenvy) before calling `CoreConfig::from_env`.
//!
//! | Variable                        | Default                  |
//! |---------------------------------|--------------------------|
//! | CAPTURE_API_URL                 | http://localhost:8080    |
//! | CAPTURE_API_TOKEN               | (none)                   |
//! | CAPTURE_DEVICE_ID               | persisted in the queue   |
//! | CAPTURE_QUEUE_PATH              | ~/.capture/queue.redb    |
//! | CAPTURE_CACHE_FRESHNESS_SECS    | 60                       |
//! | CAPTURE_CACHE_CAPACITY          | 512                      |
//! | CAPTURE_FETCH_TIMEOUT_SECS      | 10                       |
//! | CAPTURE_SUBMIT_TIMEOUT_SECS     | 30                       |
//! | CAPTURE_DRAIN_INTERVAL_SECS     | 60                       |
//! | CAPTURE_RETRY_MAX_ATTEMPTS      | 8                        |
//! | CAPTURE_RETRY_BASE_DELAY_MS     | 2000                     |
//! | CAPTURE_RETRY_MAX_DELAY_MS      | 900000                   |
//! ============================================================================

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::retry::RetryConfig;
use crate::types::QueueError;

/// Runtime configuration for the capture core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Base URL of the backend (data endpoints and submission endpoint)
    pub api_base_url: String,
    /// Static bearer token; normally supplied by the auth collaborator instead
    pub api_token: Option<String>,
    /// Explicit device id; when absent the queue persists a generated one
    pub device_id: Option<String>,
    /// Queue database path; when absent resolves to ~/.capture/queue.redb
    pub queue_path: Option<PathBuf>,
    pub cache_freshness: Duration,
    pub cache_capacity: usize,
    pub fetch_timeout: Duration,
    pub submit_timeout: Duration,
    pub drain_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
            device_id: None,
            queue_path: None,
            cache_freshness: Duration::from_secs(60),
            cache_capacity: 512,
            fetch_timeout: Duration::from_secs(10),
            submit_timeout: Duration::from_secs(30),
            drain_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Build configuration from `CAPTURE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry_defaults = RetryConfig::default();

        Self {
            api_base_url: std::env::var("CAPTURE_API_URL").unwrap_or(defaults.api_base_url),
            api_token: std::env::var("CAPTURE_API_TOKEN").ok().filter(|t| !t.is_empty()),
            device_id: std::env::var("CAPTURE_DEVICE_ID").ok().filter(|d| !d.is_empty()),
            queue_path: std::env::var("CAPTURE_QUEUE_PATH").ok().map(PathBuf::from),
            cache_freshness: Duration::from_secs(env_u64(
                "CAPTURE_CACHE_FRESHNESS_SECS",
                defaults.cache_freshness.as_secs(),
            )),
            cache_capacity: env_u64("CAPTURE_CACHE_CAPACITY", defaults.cache_capacity as u64)
                as usize,
            fetch_timeout: Duration::from_secs(env_u64(
                "CAPTURE_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )),
            submit_timeout: Duration::from_secs(env_u64(
                "CAPTURE_SUBMIT_TIMEOUT_SECS",
                defaults.submit_timeout.as_secs(),
            )),
            drain_interval: Duration::from_secs(env_u64(
                "CAPTURE_DRAIN_INTERVAL_SECS",
                defaults.drain_interval.as_secs(),
            )),
            retry: RetryConfig {
                max_attempts: env_u64(
                    "CAPTURE_RETRY_MAX_ATTEMPTS",
                    retry_defaults.max_attempts as u64,
                ) as u32,
                base_delay_ms: env_u64("CAPTURE_RETRY_BASE_DELAY_MS", retry_defaults.base_delay_ms),
                max_delay_ms: env_u64("CAPTURE_RETRY_MAX_DELAY_MS", retry_defaults.max_delay_ms),
                jitter: retry_defaults.jitter,
            },
        }
    }

    /// Resolve the queue database path, creating ~/.capture when defaulting
    pub fn resolve_queue_path(&self) -> Result<PathBuf, QueueError> {
        if let Some(path) = &self.queue_path {
            return Ok(path.clone());
        }

        let home = dirs::home_dir()
            .ok_or_else(|| QueueError::Storage("Cannot determine home directory".into()))?;
        let capture_dir = home.join(".capture");
        std::fs::create_dir_all(&capture_dir)
            .map_err(QueueError::storage("Failed to create .capture directory"))?;
        Ok(capture_dir.join("queue.redb"))
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring {}={:?}: not a number, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
