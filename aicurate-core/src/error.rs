use thiserror::Error;

use crate::storage::StorageError;

/// Error outputs from `aicurate-core`.
///
/// Business outcomes (an invalid nonce, a rejected proof, an unconfirmed
/// payment) are not errors; they are returned as outcome enums by the
/// respective gateways. This type covers the failures a caller cannot branch
/// on: missing configuration, transport problems and malformed data.
#[derive(Debug, Error)]
pub enum AicurateError {
    /// A required server-side setting is missing or invalid. Not retryable.
    #[error("configuration_error: {0}")]
    Configuration(String),
    /// The presented input is not valid for the requested operation
    #[error("invalid_input: {0}")]
    InvalidInput(String),
    /// Unexpected error serializing or parsing information
    #[error("serialization_error: {error}")]
    SerializationError {
        /// Details of the failure.
        error: String,
    },
    /// Network connection error with details
    #[error("network_error: {url} (status: {status:?}) {error}")]
    NetworkError {
        /// The URL that was requested.
        url: String,
        /// The HTTP status, when a response was received.
        status: Option<u16>,
        /// Details of the failure.
        error: String,
    },
    /// HTTP request failure
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// An upstream call exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Failure of the persistence layer.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AicurateError {
    /// Whether this error is caused by missing operator configuration.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub(crate) fn serialization(error: impl std::fmt::Display) -> Self {
        Self::SerializationError {
            error: error.to_string(),
        }
    }
}
