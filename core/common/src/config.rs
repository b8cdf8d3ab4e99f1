//! Gateway configuration.
//!
//! The configuration is assembled once at process start and handed to each
//! component constructor. Nothing in the core reads settings from the
//! environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub stream: StreamConfig,
    pub http: HttpConfig,
    pub retry: RetryConfig,
    pub upload: UploadConfig,
    pub tasks: TaskConfig,
    pub links: LinksConfig,
}

impl GatewayConfig {
    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes requested per read while relaying.
    pub chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
        }
    }
}

/// Backend HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "Stowage/0.1".to_string(),
        }
    }
}

/// Backoff for transient backend failures.
///
/// Attempt `n` (zero based) waits `initial_delay * backoff_multiplier^n`,
/// capped at `max_delay`, then spread by +/-25% when `jitter` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryConfig {
    /// Retry up to `max_retries` times with the default curve.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let growth = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let capped = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());
        let spread = if self.jitter {
            0.75 + rand::random::<f64>() * 0.5
        } else {
            1.0
        };
        Duration::try_from_secs_f64(capped * spread).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Chunked upload policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Uploads larger than this are sent as blocks.
    pub block_threshold: u64,
    /// Size of each block.
    pub block_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_threshold: 64 * 1024 * 1024,
            block_size: 4 * 1024 * 1024,
        }
    }
}

/// Worker pool and task retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Submitted tasks waiting for a worker before `submit` pushes back.
    pub queue_capacity: usize,
    /// How long terminal task records are kept.
    #[serde(with = "millis")]
    pub expiry: Duration,
    /// How long `submit_and_wait` blocks before handing back a task id.
    #[serde(with = "millis")]
    pub wait_timeout: Duration,
    /// Interval between sweeps for expired records.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
            expiry: Duration::from_secs(3600),
            wait_timeout: Duration::from_secs(20),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Link rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinksConfig {
    pub base_url: String,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7777/v1/providers".to_string(),
        }
    }
}

/// Durations as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(backoff_multiplier: f64, max_delay: Duration) -> RetryConfig {
        RetryConfig {
            backoff_multiplier,
            max_delay,
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let config = steady(2.0, Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = steady(10.0, Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..steady(2.0, Duration::from_secs(60))
        };
        for _ in 0..50 {
            let delay = config.delay_for_attempt(2);
            assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_partial_config_document() {
        let config = GatewayConfig::from_json(
            r#"{ "tasks": { "workers": 2, "expiry": 5000 }, "retry": { "max_retries": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.tasks.workers, 2);
        assert_eq!(config.tasks.expiry, Duration::from_secs(5));
        assert_eq!(config.tasks.queue_capacity, 100);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.stream.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_invalid_config_document() {
        assert!(GatewayConfig::from_json("{ not json").is_err());
    }
}
