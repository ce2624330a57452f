//! # ModernMT Common Callback
//!
//! Verification and decoding of signed batch translation callbacks.
//!
//! Batch translations complete asynchronously; the result is delivered to a
//! caller-supplied webhook as a JSON envelope plus an RS256 token signed by
//! the service. This crate provides:
//! - **Key provider**: TTL cache of the service's rotating RSA public key,
//!   with stale-on-failure and single-flight refresh
//! - **Key decoding**: base64 / PEM / DER `SubjectPublicKeyInfo` parsing
//! - **Signature verification**: RS256 with a strict algorithm policy
//! - **Envelope decoding**: typed single/batch results or a [`DomainError`]
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mmt_common_api::MemoryKeySource;
//! use mmt_common_callback::{CallbackConfig, CallbackError, CallbackHandler};
//!
//! # async fn example(body: &[u8], token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(MemoryKeySource::with_public_key("LS0tLS1CRUdJTi..."));
//! let handler = CallbackHandler::from_config(source, &CallbackConfig::default())?;
//!
//! match handler.handle_callback(body, token).await {
//!     Ok(result) => println!("{} translations", result.translations().len()),
//!     Err(CallbackError::Domain(err)) => println!("job failed: {err}"),
//!     Err(err) => return Err(err.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: RSA key generation, SPKI encoding, token signing and the
//!   `assert_callback_error!` macro. Enable this in `[dev-dependencies]`.
//! - **`failpoints`**: Enables `fail_point!` injection sites.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Callback envelope decoding.
pub mod callback;
/// Verification configuration.
pub mod config;
/// Minimal RSA `SubjectPublicKeyInfo` DER decoder.
pub mod der;
/// Callback error types.
pub mod error;
/// End-to-end callback handling.
pub mod handler;
/// Decoded signing key material.
pub mod key;
/// Cached key access.
pub mod key_provider;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
/// Algorithm and time-claim validation.
pub mod validation;
/// RS256 token verification.
pub mod verifier;

// Re-export key types for convenience
pub use callback::{BatchTranslationResult, Translation, TranslationData};
pub use config::CallbackConfig;
pub use error::{CallbackError, DomainError, Result};
pub use handler::CallbackHandler;
pub use key::PublicKeyMaterial;
pub use key_provider::{DEFAULT_KEY_TTL, KeyProvider, KeyProviderMetrics};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
pub use verifier::{SignatureVerifier, VerifiedToken};
