use thiserror::Error;

use crate::manager::{Boundary, ManagerError};

/// Unified error type for the liaison library
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An action group was exited without a matching enter.
    ///
    /// This is a bug in the calling code, never a manager failure, and
    /// retrying will not help.
    #[error("Unbalanced action group for state {token}: exit called at depth 0")]
    UnbalancedScope { token: String },

    /// The manager rejected a transaction boundary call
    #[error("Manager rejected {boundary} for state {token}")]
    TransactionBoundary {
        boundary: Boundary,
        token: String,
        #[source]
        source: ManagerError,
    },

    /// A portable token could not be produced or decoded
    #[error("Portable token codec failed: {message}")]
    Codec {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors (configuration files)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    /// Create an unbalanced scope error
    pub fn unbalanced<S: Into<String>>(token: S) -> Self {
        Self::UnbalancedScope {
            token: token.into(),
        }
    }

    /// Create a transaction boundary error wrapping the manager's failure
    pub fn boundary<S: Into<String>>(boundary: Boundary, token: S, source: ManagerError) -> Self {
        Self::TransactionBoundary {
            boundary,
            token: token.into(),
            source,
        }
    }

    /// Create a codec error
    pub fn codec<S: Into<String>>(message: S) -> Self {
        Self::Codec {
            message: message.into(),
            source: None,
        }
    }

    /// Create a codec error with source
    pub fn codec_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Codec {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// The boundary the manager rejected, if this is a boundary error
    pub fn rejected_boundary(&self) -> Option<Boundary> {
        match self {
            Self::TransactionBoundary { boundary, .. } => Some(*boundary),
            _ => None,
        }
    }

    /// Check if error is recoverable
    ///
    /// Only manager-side failures are: the caller may retry the boundary or
    /// escalate to `cancel_all`. Everything else is a local bug or bad input.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TransactionBoundary { .. } => true,
            Self::Io { .. } => true,
            Self::UnbalancedScope { .. } | Self::Codec { .. } | Self::Configuration { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnbalancedScope { .. } => "unbalanced_scope",
            Self::TransactionBoundary { .. } => "transaction_boundary",
            Self::Codec { .. } => "codec",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec_with_source("json", err)
    }
}

impl From<bincode::Error> for BridgeError {
    fn from(err: bincode::Error) -> Self {
        let source: Box<dyn std::error::Error + Send + Sync> = err;
        Self::Codec {
            message: "bincode".to_string(),
            source: Some(source),
        }
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("invalid yaml: {}", err),
            field: None,
        }
    }
}
