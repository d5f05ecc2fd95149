//! Configuration for shuffle runs.

use crate::error::{CogroupError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the shuffle engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Number of reduce partitions the key space is split into
    pub num_partitions: u32,
    /// Maximum number of records a shard source writes per read call
    pub batch_size: usize,
    /// Capacity of each partition's inbound channel and of the output channel
    pub channel_capacity: usize,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            num_partitions: num_cpus::get() as u32,
            batch_size: 1024,
            channel_capacity: 64,
        }
    }
}

impl ShuffleConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(CogroupError::configuration_error(
                "num_partitions must be positive",
            ));
        }
        if self.batch_size == 0 {
            return Err(CogroupError::configuration_error(
                "batch_size must be positive",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(CogroupError::configuration_error(
                "channel_capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ShuffleConfig = serde_json::from_str(json).map_err(|e| {
            CogroupError::configuration_error(format!("malformed shuffle config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`ShuffleConfig`].
#[derive(Debug, Default)]
pub struct ShuffleConfigBuilder {
    config: ShuffleConfig,
}

impl ShuffleConfigBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of partitions.
    pub fn num_partitions(mut self, num_partitions: u32) -> Self {
        self.config.num_partitions = num_partitions;
        self
    }

    /// Set the per-read batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set the channel capacity.
    pub fn channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.config.channel_capacity = channel_capacity;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<ShuffleConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
