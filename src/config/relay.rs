//! Relay configuration
//!
//! Loads server settings from a TOML file. Every key is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Path of the upgrade endpoint
    pub path: String,
    /// The one origin allowed to open a connection
    pub allowed_origin: String,
    /// Largest inbound frame accepted, in bytes
    pub max_frame_size: usize,
    /// Events buffered per client before new ones are dropped
    pub outbound_queue_capacity: usize,
    /// Seconds to wait for a pong before dropping a client
    pub pong_wait_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            path: "/ws".to_string(),
            allowed_origin: "http://localhost:3000".to_string(),
            max_frame_size: 512,
            outbound_queue_capacity: 256,
            pong_wait_secs: 10,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_size must be greater than 0".to_string(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.pong_wait_secs == 0 {
            return Err(ConfigError::Invalid(
                "pong_wait_secs must be greater than 0".to_string(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "path must start with '/', got {:?}",
                self.path
            )));
        }
        Ok(())
    }

    /// Time to wait for a pong
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }
}
