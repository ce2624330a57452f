//! Key endpoint of the Backend API.
//!
//! The signing service publishes its current RSA public key as
//! `{"publicKey": "<base64 of PEM text>"}`. [`PublicKeySource`] abstracts the
//! request so that production (HTTP) and testing (in-memory) share one
//! interface.
//!
//! # Usage
//!
//! ```no_run
//! // Demonstrates the trait interface; requires a concrete source implementation.
//! use mmt_common_api::{ApiResult, keys::{PublicKeyResponse, PublicKeySource}};
//!
//! async fn fetch<S: PublicKeySource>(source: &S) -> ApiResult<PublicKeyResponse> {
//!     source.get_public_key().await
//! }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    envelope::decode_envelope,
    error::{ApiError, ApiResult},
};

/// Body of a successful key endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    /// Base64 encoding of the PEM-armored SubjectPublicKeyInfo.
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Fetches the signing service's current public key.
///
/// # Timeouts
///
/// Implementations own timeout and transport-level retry. Callers treat
/// `get_public_key` as a single blocking external call.
///
/// # Error Handling
///
/// Transport failures should map to [`ApiError::Connection`] or
/// [`ApiError::Timeout`]; non-2xx answers to [`ApiError::Api`].
#[async_trait]
pub trait PublicKeySource: Send + Sync {
    /// Requests the current public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unreachable, answers with a non-2xx
    /// status, or the response body cannot be decoded.
    async fn get_public_key(&self) -> ApiResult<PublicKeyResponse>;
}

#[async_trait]
impl<T: PublicKeySource + ?Sized> PublicKeySource for Arc<T> {
    async fn get_public_key(&self) -> ApiResult<PublicKeyResponse> {
        (**self).get_public_key().await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Raw response envelope served on the next fetch.
    body: Option<Vec<u8>>,
    /// Injected failure, takes precedence over `body`.
    failure: Option<ApiError>,
}

/// In-memory implementation of [`PublicKeySource`] for testing.
///
/// Stores a raw response envelope and decodes it through
/// [`decode_envelope`] on every fetch, so tests exercise the same decoding
/// path as a real HTTP source. Failures can be injected with
/// [`set_failure`](Self::set_failure), and every call is counted.
///
/// # Thread Safety
///
/// Uses [`parking_lot::RwLock`]; clones share state.
///
/// # Examples
///
/// ```
/// use mmt_common_api::keys::{MemoryKeySource, PublicKeySource};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let source = MemoryKeySource::with_public_key("LS0tLS1CRUdJTi...");
///     let response = source.get_public_key().await?;
///     assert_eq!(response.public_key, "LS0tLS1CRUdJTi...");
///     assert_eq!(source.fetch_count(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryKeySource {
    state: Arc<RwLock<MemoryState>>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryKeySource {
    /// Creates a source with no published key.
    ///
    /// Fetches fail with a 404 [`ApiError::Api`] until a key is set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source publishing `public_key` (base64 of PEM text).
    #[must_use]
    pub fn with_public_key(public_key: impl Into<String>) -> Self {
        let source = Self::new();
        source.set_public_key(public_key);
        source
    }

    /// Publishes a new key; subsequent fetches return it.
    pub fn set_public_key(&self, public_key: impl Into<String>) {
        let body = serde_json::json!({
            "status": 200,
            "data": PublicKeyResponse { public_key: public_key.into() },
        });
        self.set_response_body(body.to_string().into_bytes());
    }

    /// Serves `body` verbatim as the raw response envelope.
    pub fn set_response_body(&self, body: Vec<u8>) {
        self.state.write().body = Some(body);
    }

    /// Injects (or with `None`, clears) a failure returned by every fetch.
    pub fn set_failure(&self, failure: Option<ApiError>) {
        self.state.write().failure = failure;
    }

    /// Number of `get_public_key` calls observed so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Resets the fetch counter to zero.
    pub fn reset_fetch_count(&self) {
        self.fetches.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl PublicKeySource for MemoryKeySource {
    #[tracing::instrument(skip(self))]
    async fn get_public_key(&self) -> ApiResult<PublicKeyResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let state = self.state.read();
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }

        match &state.body {
            Some(body) => decode_envelope(body),
            None => Err(ApiError::api(404, "NotFoundException", "No public key published")),
        }
    }
}
