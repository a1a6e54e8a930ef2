//! Ledger configuration

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{AesGcmCodec, FieldCodec, PlainCodec, MIN_MASTER_KEY_LEN};
use crate::error::{LedgerError, Result};

/// Ledger configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory of the sled database
    pub storage_path: String,
    /// Maximum payload size in bytes
    pub max_payload_bytes: usize,
    /// Flush to disk after every committed block
    pub flush_on_append: bool,
    /// Retry configuration for write conflicts
    pub retry: RetryConfig,
    /// Field codec configuration
    pub codec: CodecConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            storage_path: "./data/ledger".to_string(),
            max_payload_bytes: crate::DEFAULT_MAX_PAYLOAD_BYTES,
            flush_on_append: true,
            retry: RetryConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Create with a storage path
    pub fn with_storage_path(path: impl Into<String>) -> Self {
        Self {
            storage_path: path.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage_path.trim().is_empty() {
            return Err(LedgerError::Config("storage_path must not be empty".to_string()));
        }
        if self.max_payload_bytes == 0 {
            return Err(LedgerError::Config("max_payload_bytes must be > 0".to_string()));
        }
        self.retry.validate()?;
        self.codec.validate()
    }
}

/// Retry configuration for conflicting appends
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt
    pub max_retries: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries, fail on the first conflict
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate delay for attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(LedgerError::Config("backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(LedgerError::Config(
                "initial_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Field codec configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Master key for encryption at rest; fields are stored in clear when unset
    #[serde(skip_serializing)]
    pub master_key: Option<String>,
}

impl std::fmt::Debug for CodecConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecConfig")
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CodecConfig {
    /// Encrypt fields with a key derived from `master_key`
    pub fn encrypted(master_key: impl Into<String>) -> Self {
        Self {
            master_key: Some(master_key.into()),
        }
    }

    /// Build the configured codec
    pub fn build(&self) -> Result<Arc<dyn FieldCodec>> {
        match &self.master_key {
            Some(key) => Ok(Arc::new(AesGcmCodec::from_master_key(key.as_bytes())?)),
            None => Ok(Arc::new(PlainCodec)),
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.master_key {
            Some(key) if key.len() < MIN_MASTER_KEY_LEN => Err(LedgerError::Config(format!(
                "master_key must be at least {} bytes",
                MIN_MASTER_KEY_LEN
            ))),
            _ => Ok(()),
        }
    }
}
