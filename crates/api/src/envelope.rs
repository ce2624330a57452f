//! Backend API response envelope.
//!
//! Every Backend API response is wrapped in the same envelope:
//!
//! ```json
//! { "status": 200, "data": { ... } }
//! { "status": 404, "error": { "type": "NotFoundException", "message": "..." } }
//! ```
//!
//! [`decode_envelope`] unwraps `data` for 2xx statuses and turns anything else
//! into [`ApiError::Api`].

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};

/// Exception type reported when a failed envelope carries no `error.type`.
pub const UNKNOWN_ERROR_KIND: &str = "UnknownException";

/// Message reported when a failed envelope carries no `error.message`.
pub const UNKNOWN_ERROR_MESSAGE: &str = "No details provided.";

/// Returns `true` when `status` denotes success (`200..=299`).
#[must_use]
pub fn is_success(status: i64) -> bool {
    (200..300).contains(&status)
}

/// The `error` object of a failed envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    /// Exception type, e.g. `BadRequestException`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Human readable description.
    pub message: Option<String>,
}

impl ErrorBody {
    /// Reads `type` and `message` from a JSON `error` object.
    ///
    /// Each field is taken only if it is a string; a mistyped field does not
    /// hide its sibling.
    #[must_use]
    pub fn from_value(error: &Value) -> Self {
        let field = |name: &str| error.get(name).and_then(Value::as_str).map(str::to_owned);
        Self { kind: field("type"), message: field("message") }
    }

    /// Exception type, or [`UNKNOWN_ERROR_KIND`] when absent.
    #[must_use]
    pub fn kind_or_default(&self) -> &str {
        self.kind.as_deref().unwrap_or(UNKNOWN_ERROR_KIND)
    }

    /// Message, or [`UNKNOWN_ERROR_MESSAGE`] when absent.
    #[must_use]
    pub fn message_or_default(&self) -> &str {
        self.message.as_deref().unwrap_or(UNKNOWN_ERROR_MESSAGE)
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    status: i64,
    data: Option<T>,
    #[serde(default)]
    error: Option<Value>,
}

/// Decodes a raw Backend API response body.
///
/// # Errors
///
/// - [`ApiError::Serialization`] if the body is not a valid envelope, or a
///   2xx envelope has no `data`
/// - [`ApiError::Api`] if `status` is outside `[200, 299]`
pub fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    let envelope: Envelope<T> = serde_json::from_slice(body)
        .map_err(|e| ApiError::serialization_with_source("invalid response envelope", e))?;

    if !is_success(envelope.status) {
        let error = envelope.error.as_ref().map(ErrorBody::from_value).unwrap_or_default();
        let code = i32::try_from(envelope.status).unwrap_or(i32::MAX);
        tracing::debug!(status = code, kind = error.kind_or_default(), "api error response");
        return Err(ApiError::api(code, error.kind_or_default(), error.message_or_default()));
    }

    envelope
        .data
        .ok_or_else(|| ApiError::serialization("successful response envelope has no data"))
}
