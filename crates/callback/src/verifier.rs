//! RS256 signature verification of callback tokens.
//!
//! A callback token is a compact signed structure of three base64url
//! segments, `header.payload.signature`. Verification recomputes
//! RSASSA-PKCS1-v1.5 with SHA-256 over the ASCII `header.payload` and the
//! signing service's public key.
//!
//! # Example
//!
//! ```no_run
//! // Requires a token and the key it was signed with.
//! use mmt_common_callback::{PublicKeyMaterial, verifier::SignatureVerifier};
//!
//! # fn example(token: &str, key: &PublicKeyMaterial) -> Result<(), Box<dyn std::error::Error>> {
//! let verified = SignatureVerifier::new().verify(token, key)?;
//! println!("issuer: {:?}", verified.claims().get("iss"));
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{CallbackError, Result},
    key::PublicKeyMaterial,
    validation::{DEFAULT_LEEWAY_SECS, validate_algorithm, validate_time_claims},
};

/// Decoded token header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Signature algorithm; only `RS256` verifies.
    pub alg: String,
    /// Token type, usually `JWT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Key identifier, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// A compact token split into its segments. Nothing is verified yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedToken<'a> {
    signing_input: &'a str,
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
}

impl<'a> SignedToken<'a> {
    /// Splits `token` into header, payload and signature segments.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Signature`] unless the token has exactly three
    /// `.`-separated segments.
    pub fn parse(token: &'a str) -> Result<Self> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CallbackError::signature("token must have 3 parts separated by dots"));
        };

        let signing_input = &token[..header.len() + 1 + payload.len()];
        Ok(Self { signing_input, header, payload, signature })
    }

    /// Decodes the header segment.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Signature`] if the segment is not base64url
    /// JSON with a string `alg`.
    pub fn header(&self) -> Result<TokenHeader> {
        let bytes = URL_SAFE_NO_PAD
            .decode(self.header)
            .map_err(|e| CallbackError::signature(format!("failed to decode token header: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CallbackError::signature(format!("failed to parse token header: {e}")))
    }

    fn claims(&self) -> Result<Value> {
        let bytes = URL_SAFE_NO_PAD.decode(self.payload).map_err(|e| {
            CallbackError::signature(format!("failed to decode token payload: {e}"))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CallbackError::signature(format!("failed to parse token payload: {e}")))
    }
}

/// Proof that a token carried a valid signature from the signing service.
///
/// Only [`SignatureVerifier::verify`] creates values of this type, and
/// [`decode`](crate::callback::decode) requires one, so an unverified
/// callback body cannot be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    header: TokenHeader,
    claims: Value,
}

impl VerifiedToken {
    pub(crate) fn new(header: TokenHeader, claims: Value) -> Self {
        Self { header, claims }
    }

    /// The verified token header.
    #[must_use]
    pub fn header(&self) -> &TokenHeader {
        &self.header
    }

    /// The verified payload claims.
    #[must_use]
    pub fn claims(&self) -> &Value {
        &self.claims
    }
}

/// Stateless RS256 verifier.
///
/// Holds only the clock tolerance for `exp`/`nbf`; the key is supplied per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureVerifier {
    leeway: Duration,
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self { leeway: Duration::from_secs(DEFAULT_LEEWAY_SECS) }
    }
}

impl SignatureVerifier {
    /// Creates a verifier with the default 60 second leeway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tolerance applied to `exp` and `nbf` claims.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Returns the configured leeway.
    #[must_use]
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Verifies `token` against `key`.
    ///
    /// The header algorithm is checked first, then the signature, and only
    /// then is the payload parsed and its time claims enforced.
    ///
    /// # Errors
    ///
    /// - [`CallbackError::Signature`] if the token is malformed, declares an
    ///   algorithm other than RS256, or the signature does not match
    /// - [`CallbackError::TokenExpired`] / [`CallbackError::TokenNotYetValid`]
    ///   if a validly signed token is outside its `exp`/`nbf` window
    pub fn verify(&self, token: &str, key: &PublicKeyMaterial) -> Result<VerifiedToken> {
        let token = SignedToken::parse(token)?;
        let header = token.header()?;
        validate_algorithm(&header.alg)?;

        let valid = jsonwebtoken::crypto::verify(
            token.signature,
            token.signing_input.as_bytes(),
            key.decoding_key(),
            Algorithm::RS256,
        )
        .map_err(|e| CallbackError::signature(format!("malformed signature: {e}")))?;

        if !valid {
            tracing::debug!(key_bits = key.key_bits(), "token signature mismatch");
            return Err(CallbackError::signature("signature does not match public key"));
        }

        let claims = token.claims()?;
        validate_time_claims(&claims, Utc::now().timestamp(), self.leeway.as_secs())?;

        Ok(VerifiedToken::new(header, claims))
    }
}

/// Verifies `token` against `key` with the default leeway.
///
/// # Errors
///
/// See [`SignatureVerifier::verify`].
pub fn verify(token: &str, key: &PublicKeyMaterial) -> Result<VerifiedToken> {
    SignatureVerifier::new().verify(token, key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use mmt_common_api::PublicKeyResponse;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        key::decode_public_key_response,
        testutil::{TestRsaKey, craft_raw_token, flip_bit, rotated_rsa_key, shared_rsa_key},
    };

    fn material(key: &TestRsaKey) -> PublicKeyMaterial {
        decode_public_key_response(&PublicKeyResponse { public_key: key.public_key_b64() })
            .expect("decode key")
    }

    fn assert_signature_error(result: Result<VerifiedToken>, needle: &str) {
        match result {
            Err(CallbackError::Signature { message }) => {
                assert!(message.contains(needle), "expected '{needle}' in '{message}'")
            },
            other => panic!("expected Signature error containing '{needle}', got {other:?}"),
        }
    }

    #[test]
    fn test_signed_token_verifies() {
        let key = shared_rsa_key();
        let token = key.sign(&json!({"iss": "https://api.modernmt.com", "jobId": 7}));

        let verified = verify(&token, &material(key)).expect("verify");
        assert_eq!(verified.header().alg, "RS256");
        assert_eq!(verified.claims()["jobId"], 7);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = shared_rsa_key().sign_callback_token();
        let result = verify(&token, &material(rotated_rsa_key()));
        assert_signature_error(result, "does not match");
    }

    #[rstest]
    #[case::payload_first_byte(1, 0, 0)]
    #[case::payload_last_bit(1, usize::MAX, 7)]
    #[case::signature_first_byte(2, 0, 3)]
    #[case::signature_middle(2, 128, 5)]
    #[case::header(0, 3, 1)]
    fn test_single_bit_flip_rejected(
        #[case] segment: usize,
        #[case] byte: usize,
        #[case] bit: u8,
    ) {
        let key = shared_rsa_key();
        let token = key.sign_callback_token();
        let tampered = flip_bit(&token, segment, byte, bit);

        let result = verify(&tampered, &material(key));
        assert!(matches!(result, Err(CallbackError::Signature { .. })), "got {result:?}");
    }

    #[rstest]
    #[case::empty("")]
    #[case::one_part("abc")]
    #[case::two_parts("abc.def")]
    #[case::four_parts("a.b.c.d")]
    fn test_segment_count_enforced(#[case] token: &str) {
        assert_signature_error(verify(token, &material(shared_rsa_key())), "3 parts");
    }

    #[rstest]
    #[case::none("none", "not allowed")]
    #[case::hs256("HS256", "not allowed")]
    #[case::es256("ES256", "not in accepted list")]
    fn test_algorithm_rejected_before_signature(#[case] alg: &str, #[case] needle: &str) {
        let token = craft_raw_token(&json!({"alg": alg, "typ": "JWT"}), &json!({}));
        assert_signature_error(verify(&token, &material(shared_rsa_key())), needle);
    }

    #[test]
    fn test_header_without_alg_rejected() {
        let token = craft_raw_token(&json!({"typ": "JWT"}), &json!({}));
        assert_signature_error(verify(&token, &material(shared_rsa_key())), "token header");
    }

    #[test]
    fn test_malformed_signature_base64_rejected() {
        let token = shared_rsa_key().sign_callback_token();
        let (signing_input, _) = token.rsplit_once('.').unwrap();
        let token = format!("{signing_input}.!!!");

        assert_signature_error(verify(&token, &material(shared_rsa_key())), "malformed signature");
    }

    #[test]
    fn test_empty_signature_rejected() {
        let token = shared_rsa_key().sign_callback_token();
        let (signing_input, _) = token.rsplit_once('.').unwrap();
        let token = format!("{signing_input}.");

        assert!(matches!(
            verify(&token, &material(shared_rsa_key())),
            Err(CallbackError::Signature { .. })
        ));
    }

    #[test]
    fn test_expired_token_is_terminal() {
        let key = shared_rsa_key();
        let token = key.sign(&json!({"exp": Utc::now().timestamp() - 3600}));

        let result = verify(&token, &material(key));
        assert!(matches!(result, Err(CallbackError::TokenExpired)));
        assert!(!result.unwrap_err().is_retryable());
    }

    #[test]
    fn test_not_yet_valid_token() {
        let key = shared_rsa_key();
        let token = key.sign(&json!({"nbf": Utc::now().timestamp() + 3600}));

        assert!(matches!(verify(&token, &material(key)), Err(CallbackError::TokenNotYetValid)));
    }

    #[test]
    fn test_leeway_is_configurable() {
        let key = shared_rsa_key();
        let token = key.sign(&json!({"exp": Utc::now().timestamp() - 120}));

        assert!(verify(&token, &material(key)).is_err());
        let lenient = SignatureVerifier::new().with_leeway(Duration::from_secs(600));
        assert!(lenient.verify(&token, &material(key)).is_ok());
        assert_eq!(lenient.leeway(), Duration::from_secs(600));
    }

    #[test]
    fn test_signed_token_parse_keeps_signing_input() {
        let token = SignedToken::parse("aGVhZA.Ym9keQ.c2ln").unwrap();
        assert_eq!(token.signing_input, "aGVhZA.Ym9keQ");
        assert_eq!(token.signature, "c2ln");
    }

    /// Known-bad token inputs must never panic.
    mod fuzz_regressions {
        use super::*;

        fn exercise(token: &str) {
            let _ = verify(token, &material(shared_rsa_key()));
        }

        #[test]
        fn dots_only_no_panic() {
            exercise("..");
            exercise("...");
        }

        #[test]
        fn non_ascii_no_panic() {
            exercise("é.ü.ß");
        }

        #[test]
        fn payload_not_json_no_panic() {
            exercise(&format!(
                "{}.{}.",
                URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#),
                URL_SAFE_NO_PAD.encode(b"not json")
            ));
        }

        #[test]
        fn oversized_header_no_panic() {
            exercise(&format!("{}.e30.", "A".repeat(100_000)));
        }
    }
}
