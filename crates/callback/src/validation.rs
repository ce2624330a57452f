//! Token algorithm and time-claim validation.
//!
//! # Security
//!
//! Callback tokens are always RS256. Anything else is rejected before a
//! signature is checked, so a forged header cannot downgrade verification:
//! - `none` and the HMAC family are refused outright
//! - Other asymmetric algorithms are refused as unsupported

use serde_json::Value;

use crate::error::CallbackError;

/// Algorithms that are never accepted for security reasons.
///
/// - `none`: No signature verification (trivially bypassable)
/// - `HS256`, `HS384`, `HS512`: Symmetric algorithms; a verifier holding only
///   the public key could be tricked into using it as an HMAC secret
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Accepted token algorithms. The signing service only issues RS256.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["RS256"];

/// Default tolerance applied to `exp` and `nbf` checks, in seconds.
pub const DEFAULT_LEEWAY_SECS: u64 = 60;

/// Validate a token header `alg` against the algorithm policy.
///
/// # Errors
///
/// Returns [`CallbackError::Signature`] if:
/// - Algorithm is `none` or symmetric (HS256, HS384, HS512)
/// - Algorithm is not in [`ACCEPTED_ALGORITHMS`]
///
/// # Examples
///
/// ```
/// use mmt_common_callback::validation::validate_algorithm;
///
/// assert!(validate_algorithm("RS256").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("EdDSA").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), CallbackError> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(CallbackError::signature(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(CallbackError::signature(format!(
            "Algorithm '{alg}' is not in accepted list (only RS256 is supported)"
        )));
    }

    Ok(())
}

/// Enforce the optional `exp` and `nbf` claims of a verified payload.
///
/// Claims that are absent or not numeric are ignored; the signing service
/// does not always set them.
///
/// # Errors
///
/// - [`CallbackError::TokenExpired`] if `exp + leeway <= now`
/// - [`CallbackError::TokenNotYetValid`] if `nbf - leeway > now`
pub fn validate_time_claims(claims: &Value, now: i64, leeway: u64) -> Result<(), CallbackError> {
    let leeway = i64::try_from(leeway).unwrap_or(i64::MAX);

    if let Some(exp) = numeric_claim(claims, "exp")
        && exp.saturating_add(leeway) <= now
    {
        return Err(CallbackError::TokenExpired);
    }

    if let Some(nbf) = numeric_claim(claims, "nbf")
        && nbf.saturating_sub(leeway) > now
    {
        return Err(CallbackError::TokenNotYetValid);
    }

    Ok(())
}

fn numeric_claim(claims: &Value, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    // Fractional timestamps are legal in NumericDate; truncate them.
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}
