//! End-to-end callback handling.
//!
//! [`CallbackHandler`] ties the pieces together for a webhook endpoint:
//!
//! ```text
//! callback arrives (body, token)
//!     → KeyProvider::current_key
//!     → verify token
//!         → Signature/Parse failure? force_refresh_replacing, verify once more
//!     → parse body JSON
//!     → decode envelope → BatchTranslationResult | DomainError
//! ```
//!
//! The body is not even parsed until the token verified.

use std::sync::Arc;

use mmt_common_api::PublicKeySource;
use serde_json::Value;

use crate::{
    callback::{BatchTranslationResult, decode},
    config::CallbackConfig,
    error::{CallbackError, Result},
    key_provider::KeyProvider,
    verifier::{SignatureVerifier, VerifiedToken},
};

/// Verifies and decodes batch translation callbacks.
///
/// Cheap to share: hold it in an [`Arc`] or clone it per request handler;
/// clones use the same [`KeyProvider`].
///
/// # Example
///
/// ```no_run
/// // Requires a `PublicKeySource` implementation talking to the key endpoint.
/// use std::sync::Arc;
/// use mmt_common_api::PublicKeySource;
/// use mmt_common_callback::{CallbackConfig, CallbackHandler};
///
/// # async fn example(source: Arc<dyn PublicKeySource>, body: &[u8], token: &str)
/// #     -> Result<(), Box<dyn std::error::Error>> {
/// let handler = CallbackHandler::from_config(source, &CallbackConfig::default())?;
/// let result = handler.handle_callback(body, token).await?;
/// for translation in result.translations() {
///     println!("{}", translation.translation);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CallbackHandler {
    provider: Arc<KeyProvider>,
    verifier: SignatureVerifier,
}

impl CallbackHandler {
    /// Creates a handler that verifies with keys from `provider`.
    #[must_use]
    pub fn new(provider: Arc<KeyProvider>) -> Self {
        Self { provider, verifier: SignatureVerifier::new() }
    }

    /// Creates a handler and its [`KeyProvider`] from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Config`] if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// With a `refresh_interval`, must be called within a Tokio runtime context.
    pub fn from_config(
        source: Arc<dyn PublicKeySource>,
        config: &CallbackConfig,
    ) -> Result<Self> {
        let provider = KeyProvider::from_config(source, config)?;
        Ok(Self::new(provider).with_verifier(SignatureVerifier::new().with_leeway(config.leeway())))
    }

    /// Replaces the verifier, e.g. to change the clock leeway.
    #[must_use]
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Returns the key provider shared by this handler.
    #[must_use]
    pub fn key_provider(&self) -> &Arc<KeyProvider> {
        &self.provider
    }

    /// Verifies `token` and decodes the callback `body`.
    ///
    /// # Errors
    ///
    /// - [`CallbackError::KeyUnavailable`] if no key could ever be fetched
    /// - [`CallbackError::Signature`] if the token fails verification with the
    ///   cached key and again with a freshly fetched one
    /// - [`CallbackError::Api`] / [`CallbackError::Parse`] if the forced
    ///   refresh itself fails
    /// - [`CallbackError::TokenExpired`] / [`CallbackError::TokenNotYetValid`]
    /// - [`CallbackError::Envelope`] if the body is not a callback envelope
    /// - [`CallbackError::Domain`] if the batch translation failed
    #[tracing::instrument(skip_all, fields(body_len = body.len()))]
    pub async fn handle_callback(
        &self,
        body: &[u8],
        token: &str,
    ) -> Result<BatchTranslationResult> {
        let verified = self.verify(token).await?;

        let body: Value = serde_json::from_slice(body)
            .map_err(|e| CallbackError::envelope(format!("body is not valid JSON: {e}")))?;
        decode(&body, &verified)
    }

    /// Verifies `token`, retrying once with a refreshed key.
    ///
    /// # Errors
    ///
    /// See [`handle_callback`](Self::handle_callback); body errors excluded.
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        let key = self.provider.current_key().await?;

        let err = match self.verifier.verify(token, &key) {
            Ok(verified) => return Ok(verified),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        tracing::warn!(error = %err, "token verification failed, retrying with refreshed key");
        let key = self.provider.force_refresh_replacing(&key).await?;

        self.verifier.verify(token, &key).inspect_err(|err| {
            tracing::warn!(error = %err, "token rejected after key refresh");
        })
    }
}
