use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_PAYLOAD;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Concurrent operations allowed per connection
    pub worker_threads: usize,
    /// Operations a connection may have accepted but not yet answered;
    /// requests beyond this get a 500
    pub max_queued_requests: usize,
    /// How long a closing session waits for in-flight operations
    pub session_drain_timeout_ms: u64,
    /// Whether an EXIT request shuts the whole server down
    pub exit_stops_server: bool,
    /// Maximum PUT payload size in bytes
    pub max_payload_size: usize,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory holding the blob directory and the index snapshot
    pub storage_dir: String,
    /// Seconds between index checkpoints; 0 saves only on shutdown
    pub checkpoint_interval_secs: u64,
}

/// Number of processing units, falling back to one.
pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:23456".to_string(),
            worker_threads: available_workers(),
            max_queued_requests: available_workers() * 16,
            session_drain_timeout_ms: 2000,
            exit_stops_server: true,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: "./data".to_string(),
            checkpoint_interval_secs: 0,
        }
    }
}

impl ServerConfig {
    pub fn session_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.session_drain_timeout_ms)
    }
}

impl StorageConfig {
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_secs > 0)
            .then(|| Duration::from_secs(self.checkpoint_interval_secs))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let server_defaults = ServerConfig::default();
        let storage_defaults = StorageConfig::default();

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or(server_defaults.bind_address);

        let worker_threads =
            env_parse("WORKER_THREADS").unwrap_or(server_defaults.worker_threads);

        let max_queued_requests = env_parse("MAX_QUEUED_REQUESTS")
            .unwrap_or(worker_threads.saturating_mul(16));

        let session_drain_timeout_ms = env_parse("SESSION_DRAIN_TIMEOUT_MS")
            .unwrap_or(server_defaults.session_drain_timeout_ms);

        let exit_stops_server = std::env::var("EXIT_STOPS_SERVER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(server_defaults.exit_stops_server);

        let max_payload_size =
            env_parse("MAX_PAYLOAD_SIZE").unwrap_or(server_defaults.max_payload_size);

        let storage_dir = std::env::var("STORAGE_DIR").unwrap_or(storage_defaults.storage_dir);

        let checkpoint_interval_secs = env_parse("CHECKPOINT_INTERVAL_SECS")
            .unwrap_or(storage_defaults.checkpoint_interval_secs);

        let config = Config {
            server: ServerConfig {
                bind_address,
                worker_threads,
                max_queued_requests,
                session_drain_timeout_ms,
                exit_stops_server,
                max_payload_size,
            },
            storage: StorageConfig {
                storage_dir,
                checkpoint_interval_secs,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.is_empty() {
            return Err(ConfigError::ValidationError(
                "BIND_ADDRESS cannot be empty".to_string(),
            ));
        }

        if self.server.worker_threads == 0 {
            return Err(ConfigError::ValidationError(
                "WORKER_THREADS must be at least 1".to_string(),
            ));
        }

        if self.server.max_queued_requests < self.server.worker_threads {
            return Err(ConfigError::ValidationError(
                "MAX_QUEUED_REQUESTS cannot be below WORKER_THREADS".to_string(),
            ));
        }

        if self.server.max_payload_size == 0 || self.server.max_payload_size > u32::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "MAX_PAYLOAD_SIZE must be between 1 and {}",
                u32::MAX
            )));
        }

        if self.storage.storage_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "STORAGE_DIR cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
