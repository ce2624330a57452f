//! # ModernMT Common API
//!
//! The Backend API collaborator surface consumed by batch-translation
//! callback verification.
//!
//! This crate provides:
//! - **Key endpoint**: the [`PublicKeySource`] trait and its in-memory implementation
//! - **Response envelope**: decoding of the `{status, data, error}` wire envelope
//! - **Errors**: the [`ApiError`] taxonomy shared by all sources
//!
//! The HTTP client for translation, memory and context-vector endpoints is not
//! part of this crate; production code plugs its own [`PublicKeySource`]
//! implementation on top of it.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with envelope builders and the
//!   `assert_api_error!` macro. Enable this in `[dev-dependencies]` for integration tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod keys;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

pub use envelope::{ErrorBody, decode_envelope};
pub use error::{ApiError, ApiResult, BoxError};
pub use keys::{MemoryKeySource, PublicKeyResponse, PublicKeySource};
