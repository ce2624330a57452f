//! Cached access to the signing service's current public key.
//!
//! This module provides [`KeyProvider`], which wraps a
//! [`PublicKeySource`] with a single-slot TTL cache so that callback
//! verification does not hit the key endpoint for every request.
//!
//! # Architecture
//!
//! ```text
//! current_key()
//!     → cached key younger than TTL? return it
//!     → stale or absent: fetch via PublicKeySource (single-flight)
//!         → decode base64 / PEM / DER
//!         → swap into the cache, return it
//!     → fetch failed: stale key cached? return it
//!                     nothing cached?   KeyUnavailable
//! ```
//!
//! # Cache Strategy
//!
//! - **TTL**: Default 3600 seconds (1 hour)
//! - **Stale-on-failure**: An expired key keeps being served while the key
//!   endpoint is failing; a rotated key is picked up by the next successful
//!   fetch or by [`KeyProvider::force_refresh`]
//! - **Single-flight**: At most one fetch runs at a time. Readers holding a
//!   stale key do not wait for it; readers with no key do.
//!
//! # Examples
//!
//! ```no_run
//! // Requires a `PublicKeySource` implementation talking to the key endpoint.
//! use std::{sync::Arc, time::Duration};
//! use mmt_common_api::PublicKeySource;
//! use mmt_common_callback::KeyProvider;
//!
//! async fn example(source: Arc<dyn PublicKeySource>) {
//!     let provider = KeyProvider::new(source, Duration::from_secs(900));
//!     let key = provider.current_key().await;
//! }
//! ```

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use fail::fail_point;
use mmt_common_api::{ApiError, PublicKeySource};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    config::CallbackConfig,
    error::{CallbackError, Result},
    key::{PublicKeyMaterial, decode_public_key_response},
};

/// Default key cache TTL (1 hour).
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(3_600);

/// The cached key together with the instant it was stored.
struct CachedKey {
    material: Arc<PublicKeyMaterial>,
    stored_at: Instant,
}

/// Point-in-time view of [`KeyProvider`] counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
pub struct KeyProviderMetrics {
    /// Fetches attempted against the key endpoint.
    pub fetch_count: u64,
    /// Fetches that failed, either at the endpoint or while decoding.
    pub refresh_errors_total: u64,
    /// Times an expired key was served because a refresh failed.
    pub stale_served_total: u64,
    /// Completed background refresh ticks.
    pub background_refresh_count: u64,
    /// Cumulative fetch latency in microseconds.
    pub fetch_latency_us: u64,
    /// Strength of the cached key, if any.
    pub cached_key_bits: Option<usize>,
}

/// TTL cache in front of the key endpoint.
///
/// Shared by every concurrent callback handler. The cached key is replaced
/// atomically (an [`Arc`] swap under a short [`parking_lot::RwLock`] critical
/// section), so readers observe either the old or the new key, never a mix.
/// The network fetch always runs outside that lock.
///
/// An optional background task (see
/// [`with_refresh_interval`](Self::with_refresh_interval)) refreshes the key
/// ahead of expiry.
pub struct KeyProvider {
    /// Backend API key endpoint.
    source: Arc<dyn PublicKeySource>,
    /// How long a stored key counts as fresh.
    ttl: Duration,
    /// The single cache slot; `None` until the first successful fetch.
    cached: RwLock<Option<CachedKey>>,
    /// Serializes fetches so at most one is in flight.
    refresh_gate: tokio::sync::Mutex<()>,
    /// Monotonic counter incremented on every successful store.
    ///
    /// [`force_refresh`](Self::force_refresh) snapshots it before waiting on
    /// the gate; a change means another task already fetched a newer key.
    refresh_gen: AtomicU64,
    /// Cancellation token for stopping the background refresh task.
    cancel_token: CancellationToken,
    /// Handle for the background refresh task, if running.
    refresh_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    fetch_count: AtomicU64,
    refresh_errors_total: AtomicU64,
    stale_served_total: AtomicU64,
    background_refresh_count: AtomicU64,
    fetch_latency_us: AtomicU64,
}

impl std::fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyProvider")
            .field("ttl", &self.ttl)
            .field("cached", &self.cached_key())
            .finish_non_exhaustive()
    }
}

impl KeyProvider {
    /// Creates a provider with an empty cache.
    ///
    /// # Arguments
    ///
    /// * `source` - Backend API key endpoint
    /// * `ttl` - How long a fetched key is served without re-fetching
    #[must_use]
    pub fn new(source: Arc<dyn PublicKeySource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_gen: AtomicU64::new(0),
            cancel_token: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
            fetch_count: AtomicU64::new(0),
            refresh_errors_total: AtomicU64::new(0),
            stale_served_total: AtomicU64::new(0),
            background_refresh_count: AtomicU64::new(0),
            fetch_latency_us: AtomicU64::new(0),
        }
    }

    /// Creates a provider from a validated [`CallbackConfig`].
    ///
    /// Starts background refresh when `refresh_interval` is set.
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
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let provider = Arc::new(Self::new(source, config.key_ttl()));
        Ok(match config.refresh_interval() {
            Some(interval) => provider.with_refresh_interval(interval),
            None => provider,
        })
    }

    /// Returns the current key, fetching it if the cached one expired.
    ///
    /// A fresh cached key is returned without touching the network. A stale
    /// key is replaced on a successful fetch and served as-is when the fetch
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::KeyUnavailable`] only when no key has ever
    /// been fetched and fetching one fails; its source is the fetch or decode
    /// error.
    #[tracing::instrument(skip(self))]
    pub async fn current_key(&self) -> Result<Arc<PublicKeyMaterial>> {
        if let Some(key) = self.fresh_key() {
            tracing::debug!(cache = "hit", "signing key cache hit");
            return Ok(key);
        }

        let stale = self.cached_key();
        let _guard = match &stale {
            Some(stale) => match self.refresh_gate.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::debug!(cache = "stale", "refresh in flight, serving stale key");
                    return Ok(Arc::clone(stale));
                },
            },
            None => self.refresh_gate.lock().await,
        };

        // Another task may have stored a key while we waited on the gate.
        if let Some(key) = self.fresh_key() {
            tracing::debug!(cache = "hit", "signing key refreshed by another task");
            return Ok(key);
        }
        tracing::debug!(cache = "miss", "signing key cache miss");

        match self.fetch_and_store().await {
            Ok(key) => Ok(key),
            Err(err) => match self.cached_key() {
                Some(stale) => {
                    self.stale_served_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        cache = "stale",
                        key_age_secs = self.key_age().map(|age| age.as_secs()),
                        error = %err,
                        "key refresh failed, serving stale key"
                    );
                    Ok(stale)
                },
                None => Err(CallbackError::key_unavailable(
                    "no signing key cached and fetching one failed",
                    err,
                )),
            },
        }
    }

    /// Fetches the key unconditionally and replaces the cached one.
    ///
    /// If another refresh completes while this call waits for the in-flight
    /// fetch, its key is returned instead of fetching again.
    ///
    /// # Errors
    ///
    /// Returns the fetch ([`CallbackError::Api`]) or decode
    /// ([`CallbackError::Parse`]) error as-is. The cache is left untouched.
    #[tracing::instrument(skip(self))]
    pub async fn force_refresh(&self) -> Result<Arc<PublicKeyMaterial>> {
        let gen_before = self.refresh_gen.load(Ordering::Acquire);
        let _guard = self.refresh_gate.lock().await;

        if self.refresh_gen.load(Ordering::Acquire) != gen_before
            && let Some(key) = self.cached_key()
        {
            tracing::debug!("concurrent refresh completed, reusing its key");
            return Ok(key);
        }

        self.fetch_and_store().await
    }

    /// Fetches a replacement for a key that just failed verification.
    ///
    /// Unlike [`force_refresh`](Self::force_refresh), a key stored by a
    /// concurrent refresh is reused only if it differs from `rejected`. A
    /// fetch that began before the signing service rotated may have stored
    /// the rejected key again; fetching once more picks up the rotation.
    ///
    /// # Errors
    ///
    /// Same as [`force_refresh`](Self::force_refresh).
    #[tracing::instrument(skip_all)]
    pub async fn force_refresh_replacing(
        &self,
        rejected: &PublicKeyMaterial,
    ) -> Result<Arc<PublicKeyMaterial>> {
        let _guard = self.refresh_gate.lock().await;

        if let Some(key) = self.cached_key()
            && !key.same_key(rejected)
        {
            tracing::debug!("cached key already replaced, reusing it");
            return Ok(key);
        }

        self.fetch_and_store().await
    }

    /// Fetches, decodes and stores the key. Callers hold `refresh_gate`.
    async fn fetch_and_store(&self) -> Result<Arc<PublicKeyMaterial>> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let result = self.fetch().await;
        self.fetch_latency_us.fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);

        match result {
            Ok(material) => {
                let material = Arc::new(material);
                self.store(Arc::clone(&material));
                Ok(material)
            },
            Err(err) => {
                self.refresh_errors_total.fetch_add(1, Ordering::Relaxed);
                Err(err)
            },
        }
    }

    async fn fetch(&self) -> Result<PublicKeyMaterial> {
        fail_point!("key-provider-before-fetch", |_| {
            Err(CallbackError::from(ApiError::internal("injected failure before key fetch")))
        });

        let response = self.source.get_public_key().await?;
        decode_public_key_response(&response)
    }

    fn store(&self, material: Arc<PublicKeyMaterial>) {
        let key_bits = material.key_bits();
        let previous = {
            let mut cached = self.cached.write();
            cached
                .replace(CachedKey { material: Arc::clone(&material), stored_at: Instant::now() })
                .map(|old| old.material)
        };
        self.refresh_gen.fetch_add(1, Ordering::Release);

        match previous {
            None => tracing::info!(key_bits, "signing key loaded"),
            Some(old) if !old.same_key(&material) => {
                tracing::info!(key_bits, "signing key rotated");
            },
            Some(_) => tracing::debug!(key_bits, "signing key unchanged"),
        }
    }

    fn fresh_key(&self) -> Option<Arc<PublicKeyMaterial>> {
        self.cached
            .read()
            .as_ref()
            .filter(|cached| cached.stored_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.material))
    }

    /// Returns the cached key, fresh or stale, without fetching.
    #[must_use]
    pub fn cached_key(&self) -> Option<Arc<PublicKeyMaterial>> {
        self.cached.read().as_ref().map(|cached| Arc::clone(&cached.material))
    }

    /// Time since the cached key was stored, if any.
    #[must_use]
    pub fn key_age(&self) -> Option<Duration> {
        self.cached.read().as_ref().map(|cached| cached.stored_at.elapsed())
    }

    /// Returns the configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Enables background refresh of the key at the given interval.
    ///
    /// A `tokio::spawn`ed task wakes every `interval` and refreshes the key,
    /// so callers keep finding a fresh one. A tick that finds a fetch already
    /// in flight is skipped. Failures are logged and counted; the cached key
    /// is kept.
    ///
    /// The task stops when [`shutdown`](Self::shutdown) is called or the
    /// provider is dropped.
    ///
    /// # Arguments
    ///
    /// * `interval` - Refresh period. Should be less than the TTL so callers never see an expired
    ///   key during normal operation. A zero interval leaves background refresh disabled.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn with_refresh_interval(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        if interval.is_zero() {
            tracing::warn!("zero refresh interval, background key refresh disabled");
            return self;
        }

        let provider: Weak<Self> = Arc::downgrade(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so we start
            // with a full interval wait.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("background key refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(provider) = provider.upgrade() else {
                            break;
                        };
                        provider.background_refresh().await;
                    }
                }
            }
        });

        *self.refresh_handle.lock() = Some(handle);
        self
    }

    async fn background_refresh(&self) {
        let Ok(_guard) = self.refresh_gate.try_lock() else {
            tracing::debug!("background refresh skipped, fetch already in flight");
            return;
        };

        if let Err(err) = self.fetch_and_store().await {
            tracing::warn!(error = %err, "background key refresh failed");
        }
        self.background_refresh_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Stops the background refresh task, if running, and waits for it.
    ///
    /// The cached key stays available.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        // Take the handle so we can await it without holding the lock.
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "background key refresh task panicked");
        }
    }

    /// Returns the cancellation token for the background refresh task.
    ///
    /// Callers can use this to integrate with external shutdown signals.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Returns the number of fetches attempted against the key endpoint.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    /// Returns the number of failed fetches.
    #[must_use]
    pub fn refresh_errors_total(&self) -> u64 {
        self.refresh_errors_total.load(Ordering::Relaxed)
    }

    /// Returns how often a stale key was served because a refresh failed.
    #[must_use]
    pub fn stale_served_total(&self) -> u64 {
        self.stale_served_total.load(Ordering::Relaxed)
    }

    /// Returns the number of completed background refresh ticks.
    #[must_use]
    pub fn background_refresh_count(&self) -> u64 {
        self.background_refresh_count.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn metrics(&self) -> KeyProviderMetrics {
        KeyProviderMetrics {
            fetch_count: self.fetch_count(),
            refresh_errors_total: self.refresh_errors_total(),
            stale_served_total: self.stale_served_total(),
            background_refresh_count: self.background_refresh_count(),
            fetch_latency_us: self.fetch_latency_us.load(Ordering::Relaxed),
            cached_key_bits: self.cached_key().map(|key| key.key_bits()),
        }
    }
}

impl Drop for KeyProvider {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use async_trait::async_trait;
    use mmt_common_api::{ApiResult, MemoryKeySource, PublicKeyResponse};

    use super::*;
    use crate::testutil::{TestRsaKey, shared_rsa_key, small_rsa_key};

    const SHORT_TTL: Duration = Duration::from_millis(50);

    /// Delegates to a [`MemoryKeySource`] after a fixed delay.
    #[derive(Clone)]
    struct SlowKeySource {
        inner: MemoryKeySource,
        delay: Duration,
    }

    #[async_trait]
    impl PublicKeySource for SlowKeySource {
        async fn get_public_key(&self) -> ApiResult<PublicKeyResponse> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_public_key().await
        }
    }

    /// Reads the published key first, then delays before answering, so a
    /// rotation during the delay is not seen by that fetch.
    #[derive(Clone)]
    struct LaggingKeySource {
        inner: MemoryKeySource,
        delay: Duration,
    }

    #[async_trait]
    impl PublicKeySource for LaggingKeySource {
        async fn get_public_key(&self) -> ApiResult<PublicKeyResponse> {
            let response = self.inner.get_public_key().await;
            tokio::time::sleep(self.delay).await;
            response
        }
    }

    fn key_a() -> &'static TestRsaKey {
        small_rsa_key()
    }

    fn key_b() -> &'static TestRsaKey {
        shared_rsa_key()
    }

    fn material(key: &TestRsaKey) -> PublicKeyMaterial {
        PublicKeyMaterial::new(key.modulus.clone(), key.exponent.clone(), chrono::Utc::now())
    }

    fn provider(source: &MemoryKeySource, ttl: Duration) -> KeyProvider {
        KeyProvider::new(Arc::new(source.clone()), ttl)
    }

    #[tokio::test]
    async fn test_first_call_fetches_then_cache_hit() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, DEFAULT_KEY_TTL);

        let first = provider.current_key().await.unwrap();
        let second = provider.current_key().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.modulus(), key_a().modulus.as_slice());
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_rotation_invisible_before_ttl() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, DEFAULT_KEY_TTL);
        provider.current_key().await.unwrap();

        source.set_public_key(key_b().public_key_b64());

        let key = provider.current_key().await.unwrap();
        assert_eq!(key.modulus(), key_a().modulus.as_slice());
    }

    #[tokio::test]
    async fn test_rotation_visible_after_ttl() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, SHORT_TTL);
        provider.current_key().await.unwrap();

        source.set_public_key(key_b().public_key_b64());
        tokio::time::sleep(SHORT_TTL * 2).await;

        let key = provider.current_key().await.unwrap();
        assert_eq!(key.modulus(), key_b().modulus.as_slice());
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_key_served_when_refresh_fails() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, SHORT_TTL);
        let original = provider.current_key().await.unwrap();

        source.set_failure(Some(ApiError::connection("key endpoint down")));
        tokio::time::sleep(SHORT_TTL * 2).await;

        let key = provider.current_key().await.unwrap();
        assert!(Arc::ptr_eq(&key, &original));
        assert_eq!(provider.stale_served_total(), 1);
        assert_eq!(provider.refresh_errors_total(), 1);

        // Still stale, so the next call retries the fetch.
        provider.current_key().await.unwrap();
        assert_eq!(source.fetch_count(), 3);
        assert_eq!(provider.stale_served_total(), 2);
    }

    #[tokio::test]
    async fn test_stale_key_served_when_new_key_is_malformed() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, SHORT_TTL);
        provider.current_key().await.unwrap();

        source.set_public_key("not base64!");
        tokio::time::sleep(SHORT_TTL * 2).await;

        let key = provider.current_key().await.unwrap();
        assert_eq!(key.modulus(), key_a().modulus.as_slice());
        assert_eq!(provider.stale_served_total(), 1);
    }

    #[tokio::test]
    async fn test_no_key_and_fetch_failure_is_unavailable() {
        let source = MemoryKeySource::new();
        source.set_failure(Some(ApiError::timeout()));
        let provider = provider(&source, DEFAULT_KEY_TTL);

        let err = provider.current_key().await.unwrap_err();

        assert!(matches!(err, CallbackError::KeyUnavailable { .. }));
        let cause = err.source().expect("cause");
        assert_eq!(cause.to_string(), "Key endpoint error: Request timeout");
        assert!(provider.cached_key().is_none());
    }

    #[tokio::test]
    async fn test_no_key_and_malformed_key_is_unavailable() {
        let source = MemoryKeySource::with_public_key("bm90IGEgcGVt");
        let provider = provider(&source, DEFAULT_KEY_TTL);

        let err = provider.current_key().await.unwrap_err();

        match err {
            CallbackError::KeyUnavailable { source: Some(cause), .. } => {
                assert!(matches!(*cause, CallbackError::Parse { .. }));
            },
            other => panic!("expected KeyUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_force_refresh_replaces_fresh_key() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, DEFAULT_KEY_TTL);
        provider.current_key().await.unwrap();

        source.set_public_key(key_b().public_key_b64());
        let refreshed = provider.force_refresh().await.unwrap();

        assert_eq!(refreshed.modulus(), key_b().modulus.as_slice());
        let current = provider.current_key().await.unwrap();
        assert!(Arc::ptr_eq(&refreshed, &current));
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_error_is_raw_and_keeps_cache() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, DEFAULT_KEY_TTL);
        let original = provider.current_key().await.unwrap();

        source.set_failure(Some(ApiError::api(503, "ServiceUnavailable", "maintenance")));
        let err = provider.force_refresh().await.unwrap_err();
        assert!(matches!(err, CallbackError::Api(ApiError::Api { code: 503, .. })));

        source.set_failure(None);
        source.set_public_key("bm90IGEgcGVt");
        let err = provider.force_refresh().await.unwrap_err();
        assert!(matches!(err, CallbackError::Parse { .. }));

        let current = provider.current_key().await.unwrap();
        assert!(Arc::ptr_eq(&current, &original));
        assert_eq!(provider.refresh_errors_total(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_fetch_is_single_flight() {
        let inner = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let source = SlowKeySource { inner: inner.clone(), delay: Duration::from_millis(100) };
        let provider = Arc::new(KeyProvider::new(Arc::new(source), DEFAULT_KEY_TTL));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move { provider.current_key().await }));
        }

        for handle in handles {
            let key = handle.await.unwrap().unwrap();
            assert_eq!(key.modulus(), key_a().modulus.as_slice());
        }
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stale_reader_does_not_wait_for_refresh() {
        let inner = MemoryKeySource::with_public_key(key_b().public_key_b64());
        let source = SlowKeySource { inner, delay: Duration::from_millis(500) };
        let provider = Arc::new(KeyProvider::new(Arc::new(source), SHORT_TTL));
        provider.store(Arc::new(material(key_a())));
        tokio::time::sleep(SHORT_TTL * 2).await;

        let refresher = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.current_key().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stale = tokio::time::timeout(Duration::from_millis(200), provider.current_key())
            .await
            .expect("stale reader must not wait for the in-flight fetch")
            .unwrap();
        assert_eq!(stale.modulus(), key_a().modulus.as_slice());
        assert_eq!(provider.stale_served_total(), 0);

        let fresh = refresher.await.unwrap().unwrap();
        assert_eq!(fresh.modulus(), key_b().modulus.as_slice());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_force_refresh_collapses() {
        let inner = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let source = SlowKeySource { inner: inner.clone(), delay: Duration::from_millis(200) };
        let provider = Arc::new(KeyProvider::new(Arc::new(source), DEFAULT_KEY_TTL));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move { provider.force_refresh().await }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replacing_refresh_refetches_when_concurrent_fetch_stored_rejected_key() {
        let inner = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let source = LaggingKeySource { inner: inner.clone(), delay: Duration::from_millis(200) };
        let provider = Arc::new(KeyProvider::new(Arc::new(source), DEFAULT_KEY_TTL));
        let rejected = Arc::new(material(key_a()));
        provider.store(Arc::clone(&rejected));

        // Starts reading key A before the rotation, stores it after.
        let pre_rotation = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.force_refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        inner.set_public_key(key_b().public_key_b64());

        let replaced = provider.force_refresh_replacing(&rejected).await.unwrap();

        let stored_by_other = pre_rotation.await.unwrap().unwrap();
        assert_eq!(stored_by_other.modulus(), key_a().modulus.as_slice());
        assert_eq!(replaced.modulus(), key_b().modulus.as_slice());
        assert_eq!(inner.fetch_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replacing_refresh_reuses_newer_key() {
        let inner = MemoryKeySource::with_public_key(key_b().public_key_b64());
        let source = SlowKeySource { inner: inner.clone(), delay: Duration::from_millis(100) };
        let provider = Arc::new(KeyProvider::new(Arc::new(source), DEFAULT_KEY_TTL));
        let rejected = material(key_a());
        provider.store(Arc::new(material(key_a())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            let rejected = rejected.clone();
            handles.push(tokio::spawn(async move {
                provider.force_refresh_replacing(&rejected).await
            }));
        }

        for handle in handles {
            let key = handle.await.unwrap().unwrap();
            assert_eq!(key.modulus(), key_b().modulus.as_slice());
        }
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_refresh_interval_disables_background_refresh() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = Arc::new(provider(&source, DEFAULT_KEY_TTL)).with_refresh_interval(Duration::ZERO);

        assert!(provider.refresh_handle.lock().is_none());
        provider.current_key().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.background_refresh_count(), 0);
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_refresh_picks_up_rotation() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider =
            Arc::new(provider(&source, DEFAULT_KEY_TTL)).with_refresh_interval(Duration::from_millis(20));
        provider.current_key().await.unwrap();

        source.set_public_key(key_b().public_key_b64());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let key = provider.current_key().await.unwrap();
        assert_eq!(key.modulus(), key_b().modulus.as_slice());
        assert!(provider.background_refresh_count() >= 1);

        provider.shutdown().await;
        assert!(provider.cancel_token().is_cancelled());

        let ticks = provider.background_refresh_count();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(provider.background_refresh_count(), ticks);
        assert!(provider.cached_key().is_some(), "shutdown keeps the cached key");
    }

    #[tokio::test]
    async fn test_background_refresh_failure_keeps_key() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider =
            Arc::new(provider(&source, DEFAULT_KEY_TTL)).with_refresh_interval(Duration::from_millis(20));
        provider.current_key().await.unwrap();

        source.set_failure(Some(ApiError::connection("down")));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let key = provider.current_key().await.unwrap();
        assert_eq!(key.modulus(), key_a().modulus.as_slice());
        assert!(provider.refresh_errors_total() >= 1);

        provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let config = CallbackConfig::builder()
            .key_ttl(Duration::from_secs(120))
            .refresh_interval(Duration::from_secs(60))
            .build()
            .unwrap();

        let provider = KeyProvider::from_config(Arc::new(source), &config).unwrap();
        assert_eq!(provider.ttl(), Duration::from_secs(120));
        assert!(provider.refresh_handle.lock().is_some());
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid() {
        let config: CallbackConfig = serde_json::from_str(r#"{"key_ttl": "0s"}"#).unwrap();
        let result = KeyProvider::from_config(Arc::new(MemoryKeySource::new()), &config);
        assert!(matches!(result, Err(CallbackError::Config(_))));
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let source = MemoryKeySource::with_public_key(key_a().public_key_b64());
        let provider = provider(&source, SHORT_TTL);
        provider.current_key().await.unwrap();

        source.set_failure(Some(ApiError::timeout()));
        tokio::time::sleep(SHORT_TTL * 2).await;
        provider.current_key().await.unwrap();

        let metrics = provider.metrics();
        let expected = KeyProviderMetrics::builder()
            .fetch_count(2)
            .refresh_errors_total(1)
            .stale_served_total(1)
            .background_refresh_count(0)
            .fetch_latency_us(metrics.fetch_latency_us)
            .cached_key_bits(512)
            .build();
        assert_eq!(metrics, expected);
    }

    #[test]
    fn test_debug_does_not_dump_key() {
        let provider = KeyProvider::new(Arc::new(MemoryKeySource::new()), DEFAULT_KEY_TTL);
        let debug = format!("{provider:?}");
        assert!(debug.contains("KeyProvider"));
        assert!(debug.contains("cached: None"));
    }
}
