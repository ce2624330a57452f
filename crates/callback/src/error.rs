//! Callback verification error types.
//!
//! This module defines the errors raised while obtaining the signing key,
//! verifying a callback token, and decoding the callback envelope. The
//! expected-failure channel (a batch job that finished with an error status)
//! is carried by [`DomainError`].

use std::{fmt, sync::Arc};

use mmt_common_api::ApiError;
use serde_json::Value;
use thiserror::Error;

/// Exception type reported for signature failures.
pub const SIGNATURE_ERROR_KIND: &str = "SignatureException";

/// A batch translation that the service reported as failed.
///
/// Carries the status code, exception type and message from the callback
/// envelope, plus the caller's opaque metadata for correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainError {
    /// Status code from `result.status` (outside `[200, 299]`).
    pub code: i32,
    /// Exception type from `result.error.type`.
    pub kind: String,
    /// Message from `result.error.message`.
    pub message: String,
    /// Top-level `metadata` of the callback, if any.
    pub metadata: Option<Value>,
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} - {})", self.message, self.code, self.kind)
    }
}

impl std::error::Error for DomainError {}

/// Callback verification and decoding errors.
///
/// # Retry Semantics
///
/// [`Parse`](Self::Parse) and [`Signature`](Self::Signature) may be caused by
/// a rotated signing key; callers retry them once after a forced key refresh
/// (see [`CallbackError::is_retryable`]). Everything else is terminal.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`: new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CallbackError {
    /// Malformed public key encoding (DER, PEM armor or base64).
    #[error("Invalid public key: {message}")]
    Parse {
        /// What was wrong with the encoding.
        message: String,
    },

    /// No key has ever been fetched and fetching one failed.
    #[error("Public key unavailable: {message}")]
    KeyUnavailable {
        /// Description of the failed fetch.
        message: String,
        /// The fetch or decode error that left the cache empty.
        #[source]
        source: Option<Arc<CallbackError>>,
    },

    /// Signature mismatch, disallowed algorithm, or malformed token.
    #[error("Invalid signature: {message}")]
    Signature {
        /// Why verification failed.
        message: String,
    },

    /// The verified token's `exp` claim is in the past.
    #[error("Token expired")]
    TokenExpired,

    /// The verified token's `nbf` claim is in the future.
    #[error("Token not yet valid")]
    TokenNotYetValid,

    /// Backend API failure while fetching the public key.
    #[error("Key endpoint error: {0}")]
    Api(
        /// The underlying Backend API error.
        #[source]
        ApiError,
    ),

    /// The callback body is not a well-formed envelope.
    #[error("Invalid callback envelope: {message}")]
    Envelope {
        /// What was wrong with the envelope.
        message: String,
    },

    /// The batch translation finished with an error status.
    #[error(transparent)]
    Domain(DomainError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CallbackError {
    /// Creates a new `Parse` error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }

    /// Creates a new `KeyUnavailable` error caused by `source`.
    #[must_use]
    pub fn key_unavailable(message: impl Into<String>, source: CallbackError) -> Self {
        Self::KeyUnavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Signature` error.
    #[must_use]
    pub fn signature(message: impl Into<String>) -> Self {
        Self::Signature { message: message.into() }
    }

    /// Creates a new `Envelope` error.
    #[must_use]
    pub fn envelope(message: impl Into<String>) -> Self {
        Self::Envelope { message: message.into() }
    }

    /// Returns `true` for failures that a key rotation could explain.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Signature { .. })
    }

    /// Status code in the service's exception taxonomy.
    ///
    /// Domain errors report the callback status and Backend API errors their
    /// response status; every local failure reports `0`.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Domain(err) => err.code,
            Self::Api(ApiError::Api { code, .. }) => *code,
            _ => 0,
        }
    }

    /// Exception type in the service's taxonomy.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Domain(err) => &err.kind,
            Self::Api(ApiError::Api { kind, .. }) => kind,
            Self::Signature { .. } | Self::TokenExpired | Self::TokenNotYetValid => {
                SIGNATURE_ERROR_KIND
            },
            Self::Parse { .. } | Self::KeyUnavailable { .. } => "PublicKeyException",
            Self::Api(_) => "ConnectionException",
            Self::Envelope { .. } => "ParseException",
            Self::Config(_) => "ConfigurationException",
        }
    }
}

impl From<ApiError> for CallbackError {
    fn from(err: ApiError) -> Self {
        Self::Api(err)
    }
}

impl From<DomainError> for CallbackError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

/// Result type alias for callback operations.
pub type Result<T> = std::result::Result<T, CallbackError>;
