//! Configuration for the batch-streaming runtime.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, StreamError};

// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub storage: StorageConfig,
    pub batching: BatchConfig,
    pub checkpoint: CheckpointConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path for all storage operations.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O for reads.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

/// Minibatch streaming options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Frames per minibatch.
    pub batch_size: usize,
    /// Minibatches per staging window. The staging buffer holds
    /// `staging_batches * batch_size` frames per reload.
    pub staging_batches: usize,
    /// Slots in the producer/consumer ring. Must be at least 2 for the
    /// in-use and being-filled minibatches to overlap.
    pub ring_capacity: usize,
    /// Optional seed for reproducible window shuffling.
    pub seed: Option<u64>,
}

// Checkpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Directory for checkpoint generations, relative to the storage base path.
    pub checkpoint_dir: PathBuf,
    // Seconds between coordinator ticks.
    pub interval_secs: u64,
    // Number of valid generations to retain.
    pub keep_last_n: usize,
    // How many generation ids below the pointer the recovery scan inspects
    // before giving up and falling back to a cold start.
    pub recovery_lookback: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            staging_batches: 16,
            ring_capacity: 8,
            seed: None,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./checkpoints"),
            interval_secs: 60,
            keep_last_n: 5,
            recovery_lookback: 16,
        }
    }
}

impl BatchConfig {
    // Validate batching values.
    //
    // Enforced wherever a `BatchConfig` enters the system, including direct
    // provider construction, so the resume guarantee below cannot be
    // sidestepped.
    //
    // # Errors
    //
    // Returns an error if any batching value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(StreamError::config(
                "batching.batch_size must be greater than 0",
            ));
        }
        if self.staging_batches == 0 {
            return Err(StreamError::config(
                "batching.staging_batches must be greater than 0",
            ));
        }
        if self.ring_capacity < 2 {
            return Err(StreamError::config(
                "batching.ring_capacity must be at least 2",
            ));
        }
        // The no-skip resumption guarantee requires that ring-resident
        // minibatches never span more than two staging windows.
        if self.staging_batches < self.ring_capacity {
            return Err(StreamError::config(
                "batching.staging_batches must be at least batching.ring_capacity",
            ));
        }
        Ok(())
    }
}

impl FromStr for StreamConfig {
    type Err = StreamError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| StreamError::config_with_source("failed to parse TOML config", e))
    }
}

impl StreamConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `BSTREAM_` and use underscores
    // to separate nested fields. For example:
    // - `BSTREAM_STORAGE_BASE_PATH` overrides `storage.base_path`
    // - `BSTREAM_BATCHING_BATCH_SIZE` overrides `batching.batch_size`
    // - `BSTREAM_CHECKPOINT_DIR` overrides `checkpoint.checkpoint_dir`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("BSTREAM_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("BSTREAM_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("BSTREAM_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("BSTREAM_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        // Batching overrides
        if let Ok(val) = std::env::var("BSTREAM_BATCHING_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.batching.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("BSTREAM_BATCHING_STAGING_BATCHES") {
            if let Ok(v) = val.parse() {
                self.batching.staging_batches = v;
            }
        }
        if let Ok(val) = std::env::var("BSTREAM_BATCHING_RING_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.batching.ring_capacity = v;
            }
        }
        if let Ok(val) = std::env::var("BSTREAM_BATCHING_SEED") {
            if let Ok(v) = val.parse() {
                self.batching.seed = Some(v);
            }
        }

        // Checkpoint overrides
        if let Ok(val) = std::env::var("BSTREAM_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("BSTREAM_CHECKPOINT_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                self.checkpoint.interval_secs = v;
            }
        }
        if let Ok(val) = std::env::var("BSTREAM_CHECKPOINT_KEEP_LAST_N") {
            if let Ok(v) = val.parse() {
                self.checkpoint.keep_last_n = v;
            }
        }
        if let Ok(val) = std::env::var("BSTREAM_CHECKPOINT_RECOVERY_LOOKBACK") {
            if let Ok(v) = val.parse() {
                self.checkpoint.recovery_lookback = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(StreamError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        // Batching validation
        self.batching.validate()?;

        // Checkpoint validation
        if self.checkpoint.interval_secs == 0 {
            return Err(StreamError::config(
                "checkpoint.interval_secs must be greater than 0",
            ));
        }
        if self.checkpoint.keep_last_n == 0 {
            return Err(StreamError::config(
                "checkpoint.keep_last_n must be greater than 0",
            ));
        }
        if self.checkpoint.recovery_lookback == 0 {
            return Err(StreamError::config(
                "checkpoint.recovery_lookback must be greater than 0",
            ));
        }

        Ok(())
    }
}
