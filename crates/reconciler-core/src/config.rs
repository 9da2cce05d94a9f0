//! Controller configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of workers; fixed for the controller's lifetime.
    pub concurrent_syncs: usize,

    /// Upper bound on the wait for the initial listing to complete.
    pub sync_timeout_ms: u64,

    /// Fallback interval for re-checking drain progress during shutdown.
    pub drain_poll_interval_ms: u64,

    /// Delay after the first failure of a key.
    pub backoff_base_ms: u64,

    /// Ceiling for the per-key exponential backoff.
    pub backoff_max_ms: u64,

    /// Sustained rate of the global retry bucket.
    pub bucket_qps: f64,

    /// Burst size of the global retry bucket.
    pub bucket_burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_syncs: 5,
            sync_timeout_ms: 60_000,
            drain_poll_interval_ms: 5_000,
            backoff_base_ms: 5,
            backoff_max_ms: 1_000_000,
            bucket_qps: 10.0,
            bucket_burst: 100,
        }
    }
}

impl ControllerConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ControllerError> {
        serde_json::from_str(s).map_err(|e| ControllerError::Config(format!("json decode: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ControllerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Reject values the controller cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.concurrent_syncs == 0 {
            return Err(ControllerError::InvalidConfig(
                "concurrent_syncs must be at least 1".to_string(),
            ));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(ControllerError::InvalidConfig(
                "drain_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ControllerError::InvalidConfig(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if !(self.bucket_qps.is_finite() && self.bucket_qps > 0.0) {
            return Err(ControllerError::InvalidConfig(format!(
                "bucket_qps must be a positive number, got {}",
                self.bucket_qps
            )));
        }
        if self.bucket_burst == 0 {
            return Err(ControllerError::InvalidConfig(
                "bucket_burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
