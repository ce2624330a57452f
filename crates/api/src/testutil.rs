//! Shared test utilities for Backend API consumers.
//!
//! Feature-gated behind `testutil`:
//!
//! ```toml
//! [dev-dependencies]
//! mmt-common-api = { path = "../api", features = ["testutil"] }
//! ```

use serde::Serialize;

/// Builds a raw `{"status": 200, "data": ...}` response body.
///
/// # Panics
///
/// Panics if `data` cannot be serialized.
pub fn success_envelope(data: &impl Serialize) -> Vec<u8> {
    let data = serde_json::to_value(data).expect("envelope data");
    serde_json::to_vec(&serde_json::json!({ "status": 200, "data": data })).expect("envelope")
}

/// Builds a raw failed response body with the given status, type and message.
///
/// # Panics
///
/// Panics if JSON serialization fails.
pub fn error_envelope(status: i32, kind: &str, message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "status": status,
        "error": { "type": kind, "message": message },
    }))
    .expect("envelope")
}

/// Asserts that a [`Result<T, ApiError>`](crate::ApiError) is an `Err` of the given variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use mmt_common_api::{ApiError, assert_api_error};
///
/// let result: Result<(), ApiError> = Err(ApiError::timeout());
/// assert_api_error!(result, Timeout);
/// ```
#[macro_export]
macro_rules! assert_api_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::ApiError::$variant { .. })),
            "expected ApiError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
}
