//! Consumer configuration types.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration for a consumer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer group ID
    pub group_id: String,

    /// Start from the log start instead of the high watermark when the group
    /// has no committed offset for a partition
    pub from_beginning: bool,

    /// Pause between cycles that delivered nothing
    pub max_wait_time_ms: u64,

    /// Largest number of records a single fetch may return
    pub max_batch_records: usize,

    /// Per-partition retry budget for fetch and handler failures
    pub retry: RetryConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "kafka-cg".to_string(),
            from_beginning: false,
            max_wait_time_ms: 100,
            max_batch_records: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }
}

/// Exponential backoff applied to a single partition after a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub retries: u32,
    pub initial_retry_time_ms: u64,
    pub max_retry_time_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            initial_retry_time_ms: 300,
            max_retry_time_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt after `attempt` consecutive failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_retry_time_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_retry_time_ms as f64) as u64)
    }
}

/// Options for a single `run` of the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub auto_commit: bool,

    /// Time-based flush cadence; `None` disables the ticker
    pub auto_commit_interval_ms: Option<u64>,

    /// Flush as soon as this many offsets have been scheduled
    pub auto_commit_threshold: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            auto_commit_interval_ms: Some(5_000),
            auto_commit_threshold: None,
        }
    }
}

impl RunConfig {
    pub fn manual_commit() -> Self {
        Self {
            auto_commit: false,
            ..Self::default()
        }
    }
}
