use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::errors::{BridgeError, Result};

/// Default upper bound for an encoded portable token (64 KiB)
pub const DEFAULT_MAX_TOKEN_BYTES: usize = 64 * 1024;

/// Serialization used for the payload of a portable token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenFormat {
    /// serde_json payload, readable when uncompressed
    Json,
    /// bincode payload
    Binary,
}

impl Default for TokenFormat {
    fn default() -> Self {
        TokenFormat::Json
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identifies this host in the session handed to every manager call
    pub host_identifier: String,
    /// Payload format used by `freeze`
    pub token_format: TokenFormat,
    /// zstd level for portable tokens (None = uncompressed)
    pub compression_level: Option<i32>,
    /// Maximum encoded token size, also caps the decompressed payload
    pub max_token_bytes: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host_identifier: "liaison.host".to_string(),
            token_format: TokenFormat::Json,
            compression_level: None,
            max_token_bytes: DEFAULT_MAX_TOKEN_BYTES,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for CoordinatorConfig
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Binary, compressed tokens for shipping to many workers
    pub fn compact() -> Self {
        Self {
            token_format: TokenFormat::Binary,
            compression_level: Some(3),
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.host_identifier.trim().is_empty() {
            return Err(BridgeError::configuration_field(
                "host_identifier cannot be empty",
                "host_identifier",
            ));
        }
        if self.max_token_bytes == 0 {
            return Err(BridgeError::configuration_field(
                "max_token_bytes must be greater than 0",
                "max_token_bytes",
            ));
        }
        if let Some(level) = self.compression_level {
            if !(1..=21).contains(&level) {
                return Err(BridgeError::configuration_field(
                    format!("compression_level must be between 1 and 21, got {}", level),
                    "compression_level",
                ));
            }
        }
        Ok(())
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}

/// Builder for CoordinatorConfig
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    /// Set the host identifier
    pub fn host_identifier(mut self, id: impl Into<String>) -> Self {
        self.config.host_identifier = id.into();
        self
    }

    /// Set the token payload format
    pub fn token_format(mut self, format: TokenFormat) -> Self {
        self.config.token_format = format;
        self
    }

    /// Enable zstd compression at the given level
    pub fn compression_level(mut self, level: i32) -> Self {
        self.config.compression_level = Some(level);
        self
    }

    /// Set the token size limit
    pub fn max_token_bytes(mut self, bytes: usize) -> Self {
        self.config.max_token_bytes = bytes;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
