//! Exchange configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! max_queued_bytes = 33554432
//! request_data_sizes_max_wait_ms = 10000
//!
//! [retry]
//! max_retries = 5
//!
//! [output_buffer]
//! max_buffer_size = 33554432
//! continue_pct = 90
//! ```

use crate::error::{ExchangeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default client ceiling (32MB)
pub const DEFAULT_MAX_QUEUED_BYTES: u64 = 32 * 1024 * 1024;

/// Default producer buffer ceiling (32MB)
pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 32 * 1024 * 1024;

/// Default long-poll wait for a data-size probe (10s)
pub const DEFAULT_REQUEST_DATA_SIZES_MAX_WAIT_MS: u64 = 10_000;

/// Consumer-side settings for one exchange client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Soft ceiling on bytes buffered in the exchange queue plus bytes requested in flight
    pub max_queued_bytes: u64,

    /// How long a data-size probe waits for the producer before timing out
    pub request_data_sizes_max_wait_ms: u64,

    /// Upper bound on page requests in flight at once
    pub max_concurrent_requests: usize,

    /// Transient failure handling for fetch sources
    pub retry: RetryConfig,

    /// Producer-side settings, used when this process also hosts output buffers
    pub output_buffer: OutputBufferConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            request_data_sizes_max_wait_ms: DEFAULT_REQUEST_DATA_SIZES_MAX_WAIT_MS,
            max_concurrent_requests: 64,
            retry: RetryConfig::default(),
            output_buffer: OutputBufferConfig::default(),
        }
    }
}

impl ExchangeConfig {
    pub fn with_max_queued_bytes(mut self, bytes: u64) -> Self {
        self.max_queued_bytes = bytes;
        self
    }

    pub fn request_data_sizes_max_wait(&self) -> Duration {
        Duration::from_millis(self.request_data_sizes_max_wait_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queued_bytes == 0 {
            return Err(ExchangeError::Config(
                "max_queued_bytes must be positive".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ExchangeError::Config(
                "max_concurrent_requests must be positive".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ExchangeError::Config(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        self.output_buffer.validate()
    }
}

/// Retry budget for transient fetch failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

/// Producer buffer ceiling and release threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputBufferConfig {
    /// Producers block once buffered bytes reach this size
    pub max_buffer_size: u64,

    /// Blocked producers resume once buffered bytes fall below this percentage of the ceiling
    pub continue_pct: u8,
}

impl Default for OutputBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            continue_pct: 90,
        }
    }
}

impl OutputBufferConfig {
    pub fn with_max_buffer_size(mut self, bytes: u64) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Buffered size below which blocked producers are released.
    pub fn continue_size(&self) -> u64 {
        self.max_buffer_size * u64::from(self.continue_pct) / 100
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(ExchangeError::Config(
                "output_buffer.max_buffer_size must be positive".to_string(),
            ));
        }
        if self.continue_pct == 0 || self.continue_pct > 100 {
            return Err(ExchangeError::Config(format!(
                "output_buffer.continue_pct must be in 1..=100, got {}",
                self.continue_pct
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = ExchangeConfig::from_toml_str("").unwrap();
        assert_eq!(config, ExchangeConfig::default());
        assert_eq!(config.request_data_sizes_max_wait(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml() {
        let config = ExchangeConfig::from_toml_str(
            r#"
            max_queued_bytes = 4096

            [retry]
            max_retries = 2

            [output_buffer]
            continue_pct = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.max_queued_bytes, 4096);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_backoff_ms, 50);
        assert_eq!(config.output_buffer.continue_pct, 50);
        assert_eq!(
            config.output_buffer.continue_size(),
            DEFAULT_MAX_BUFFER_SIZE / 2
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ExchangeConfig::from_toml_str("max_queued_bytes = 0"),
            Err(ExchangeError::Config(_))
        ));
        assert!(matches!(
            ExchangeConfig::from_toml_str("[output_buffer]\ncontinue_pct = 101"),
            Err(ExchangeError::Config(_))
        ));
        assert!(matches!(
            ExchangeConfig::from_toml_str("max_queued_bytes = \"lots\""),
            Err(ExchangeError::Toml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_requests = 3").unwrap();

        let config = ExchangeConfig::load(file.path()).unwrap();
        assert_eq!(config.max_concurrent_requests, 3);
    }
}
