//! Extension host error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("script error: {0}")]
    Parse(String),

    #[error("missing required metadata field: {0}")]
    MissingMetadata(&'static str),

    #[error("invalid metadata field '{field}': {reason}")]
    InvalidMetadata { field: &'static str, reason: String },

    #[error("operation '{operation}' is not supported by extension {extension}")]
    UnsupportedOperation {
        extension: String,
        operation: &'static str,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("execution timeout: extension {0} exceeded its time or instruction budget")]
    Timeout(String),

    #[error("call cancelled: extension {0}")]
    Cancelled(String),

    #[error("runtime closed: extension {0}")]
    Closed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl ExtensionError {
    /// Errors that leave an extension registered in the `Error` state when
    /// they happen while loading a script.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::MissingMetadata(_) | Self::InvalidMetadata { .. }
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }
}

impl From<reqwest::Error> for ExtensionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
