//! Processor configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sync processor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Blocks per download/scan batch
    pub batch_size: u32,
    /// Scanned blocks accumulated before enhancement runs
    pub enhance_batch_size: u64,
    /// Rewind step per consecutive chain error
    pub rewind_distance: u32,
    /// Deepest reorg the processor will rewind through
    pub max_reorg_size: u32,
    /// Consecutive chain errors tolerated before giving up
    pub max_consecutive_errors: u32,
    /// Retries after the first block download attempt
    pub download_retries: u32,
    /// Retries for the chain tip request
    pub latest_height_retries: u32,
    /// Retries for subtree root requests
    pub subtree_roots_retries: u32,
    /// Retries for full transaction requests
    pub transaction_fetch_retries: u32,
    /// Retries per UTXO refresh
    pub utxo_fetch_retries: u32,
    /// Failed UTXO refreshes after which the processor stops asking
    pub max_failed_utxo_fetches: u32,
    /// First retry delay; doubled on each further attempt
    pub retry_initial_backoff_ms: u64,
    /// Poll interval once synced
    pub poll_interval_ms: u64,
    /// Poll interval after failures or disconnects
    pub poll_interval_short_ms: u64,
    /// Ceiling for processor error backoff
    pub max_backoff_interval_ms: u64,
    /// Planning inputs older than this trigger a restart
    pub restart_timeout_secs: u64,
    /// Randomize naps by a factor in [0.75, 1.25)
    pub poll_jitter: bool,
    /// Days of blocks dropped by a quick rewind
    pub quick_rewind_days: u32,
    /// Sync events kept in memory
    pub event_log_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            enhance_batch_size: 1_000,
            rewind_distance: 10,
            max_reorg_size: 100,
            max_consecutive_errors: 5,
            download_retries: 5,
            latest_height_retries: 3,
            subtree_roots_retries: 3,
            transaction_fetch_retries: 1,
            utxo_fetch_retries: 3,
            max_failed_utxo_fetches: 9,
            retry_initial_backoff_ms: 500,
            poll_interval_ms: 20_000, // 20s
            poll_interval_short_ms: 5_000, // 5s
            max_backoff_interval_ms: 600_000, // 10 min
            restart_timeout_secs: 600, // 10 min
            poll_jitter: true,
            quick_rewind_days: 14,
            event_log_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Reject settings the processor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.enhance_batch_size == 0 {
            return Err(Error::Config("enhance_batch_size must be positive".into()));
        }
        if self.max_consecutive_errors == 0 {
            return Err(Error::Config(
                "max_consecutive_errors must be positive".into(),
            ));
        }
        if self.rewind_distance > self.max_reorg_size {
            return Err(Error::Config(format!(
                "rewind_distance ({}) exceeds max_reorg_size ({})",
                self.rewind_distance, self.max_reorg_size
            )));
        }
        if self.poll_interval_short_ms == 0 || self.poll_interval_short_ms > self.poll_interval_ms {
            return Err(Error::Config(format!(
                "poll_interval_short_ms ({}) must be in 1..={}",
                self.poll_interval_short_ms, self.poll_interval_ms
            )));
        }
        Ok(())
    }

    /// Synced poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll interval used after failures
    pub fn short_poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_short_ms)
    }

    /// Processor error backoff ceiling
    pub fn max_backoff_interval(&self) -> Duration {
        Duration::from_millis(self.max_backoff_interval_ms)
    }

    /// Staleness ceiling for planning inputs
    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    /// First retry delay
    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }
}
