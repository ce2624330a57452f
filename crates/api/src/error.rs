//! Backend API error types and result alias.
//!
//! Every [`PublicKeySource`](crate::keys::PublicKeySource) implementation maps
//! its transport and protocol failures onto [`ApiError`], so that consumers can
//! decide between "the service answered no" and "the service did not answer".
//!
//! # Error Types
//!
//! - [`ApiError::Connection`] - Network or connection-related failures
//! - [`ApiError::Timeout`] - Request exceeded its time limit
//! - [`ApiError::Serialization`] - Response body could not be decoded
//! - [`ApiError::Api`] - The service answered with a non-2xx status
//! - [`ApiError::Internal`] - Anything else
//!
//! # Example
//!
//! ```
//! use mmt_common_api::{ApiError, ApiResult};
//!
//! fn fetch() -> ApiResult<String> {
//!     Err(ApiError::api(401, "AuthenticationException", "Invalid API key"))
//! }
//!
//! assert!(fetch().is_err());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for Backend API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors that can occur while talking to the Backend API.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`: new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Request timed out.
    #[error("Request timeout")]
    Timeout,

    /// Response body could not be decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying decoding error.
        #[source]
        source: Option<BoxError>,
    },

    /// The service answered with a status outside `[200, 299]`.
    #[error("{message} ({code} - {kind})")]
    Api {
        /// HTTP-like status code reported in the response envelope.
        code: i32,
        /// Exception type reported by the service (e.g. `NotFoundException`).
        kind: String,
        /// Human readable message reported by the service.
        message: String,
    },

    /// Catch-all for failures that fit no other category.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl ApiError {
    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Api` error from a response envelope.
    #[must_use]
    pub fn api(code: i32, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api { code, kind: kind.into(), message: message.into() }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Returns `true` when the failure says nothing about the service's answer
    /// (connection loss, timeout), i.e. retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}
