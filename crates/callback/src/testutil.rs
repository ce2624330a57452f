//! Shared test utilities for callback verification testing.
//!
//! This module provides helpers for generating RSA key pairs, encoding their
//! public halves the way the key endpoint publishes them (SPKI DER, PEM armor,
//! base64), signing RS256 tokens, and crafting raw tokens for attack testing.
//! It is feature-gated behind `testutil` to prevent leaking into production
//! builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! mmt-common-callback = { path = "../callback", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use mmt_common_callback::testutil::{shared_rsa_key, craft_raw_token};
//! ```

use std::sync::LazyLock;

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand_core::OsRng;
use rsa::{RsaPrivateKey, pkcs1::EncodeRsaPrivateKey, traits::PublicKeyParts};
use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::key::{PEM_FOOTER, PEM_HEADER};

/// How DER lengths are encoded by [`encode_spki_der`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthForm {
    /// Shortest form for each length, as a conforming encoder would emit.
    Minimal,
    /// Always the short form (`LL`); every length must be below 128.
    Short,
    /// Always the one-octet long form (`0x81 LL`); every length must be below 256.
    LongOne,
    /// Always the two-octet long form (`0x82 HH LL`).
    LongTwo,
}

/// An RSA key pair for signing test tokens.
///
/// The private key is kept as PKCS#1 DER in a [`Zeroizing`] buffer, and the
/// public half as minimal big-endian magnitudes.
pub struct TestRsaKey {
    /// Modulus `n`, big-endian, no sign octet.
    pub modulus: Vec<u8>,
    /// Public exponent `e`, big-endian, no sign octet.
    pub exponent: Vec<u8>,
    pkcs1_der: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for TestRsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRsaKey").field("bits", &(self.modulus.len() * 8)).finish()
    }
}

impl TestRsaKey {
    /// SPKI DER of the public half with minimal length encoding.
    #[must_use]
    pub fn spki_der(&self) -> Vec<u8> {
        encode_spki_der(&self.modulus, &self.exponent, LengthForm::Minimal)
    }

    /// The public key exactly as the key endpoint publishes it: base64 of PEM text.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        encode_public_key_response(&self.spki_der())
    }

    /// Signs `claims` as an RS256 token.
    ///
    /// # Panics
    ///
    /// Panics if the key is shorter than 2048 bits (rejected by the signer).
    #[must_use]
    pub fn sign(&self, claims: &Value) -> String {
        let encoding_key = EncodingKey::from_rsa_der(&self.pkcs1_der);
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, &encoding_key)
            .expect("Failed to encode test token")
    }

    /// Signs a callback token that expires in one hour.
    #[must_use]
    pub fn sign_callback_token(&self) -> String {
        let now = Utc::now().timestamp();
        self.sign(&json!({
            "iss": "https://api.modernmt.com",
            "iat": now,
            "exp": now + 3600,
        }))
    }
}

/// Generates a fresh RSA key pair of `bits` bits.
///
/// # Panics
///
/// Panics if key generation fails.
#[must_use]
pub fn generate_rsa_key(bits: usize) -> TestRsaKey {
    let private = RsaPrivateKey::new(&mut OsRng, bits).expect("Failed to generate RSA key");
    let pkcs1_der = Zeroizing::new(
        private.to_pkcs1_der().expect("Failed to encode RSA key").as_bytes().to_vec(),
    );

    TestRsaKey {
        modulus: private.n().to_bytes_be(),
        exponent: private.e().to_bytes_be(),
        pkcs1_der,
    }
}

static SHARED_KEY: LazyLock<TestRsaKey> = LazyLock::new(|| generate_rsa_key(2048));
static ROTATED_KEY: LazyLock<TestRsaKey> = LazyLock::new(|| generate_rsa_key(2048));
static SMALL_KEY: LazyLock<TestRsaKey> = LazyLock::new(|| generate_rsa_key(512));

/// A 2048-bit key generated once per test binary.
#[must_use]
pub fn shared_rsa_key() -> &'static TestRsaKey {
    &SHARED_KEY
}

/// A second 2048-bit key, distinct from [`shared_rsa_key`], for rotation tests.
#[must_use]
pub fn rotated_rsa_key() -> &'static TestRsaKey {
    &ROTATED_KEY
}

/// A 512-bit key whose SPKI fits every length form. Too small to sign with.
#[must_use]
pub fn small_rsa_key() -> &'static TestRsaKey {
    &SMALL_KEY
}

/// Encodes an RSA `SubjectPublicKeyInfo` with the given length form.
///
/// `modulus` and `exponent` are big-endian magnitudes; leading zeros are
/// dropped and a sign octet is added where the high bit is set.
///
/// # Panics
///
/// Panics if a length does not fit the requested form.
#[must_use]
pub fn encode_spki_der(modulus: &[u8], exponent: &[u8], form: LengthForm) -> Vec<u8> {
    let mut rsa_key = tlv(0x02, &positive_integer(modulus), form);
    rsa_key.extend(tlv(0x02, &positive_integer(exponent), form));
    let rsa_key = tlv(0x30, &rsa_key, form);

    let mut bit_string = vec![0x00];
    bit_string.extend(rsa_key);

    let mut algorithm = tlv(0x06, crate::der::RSA_ENCRYPTION_OID, form);
    algorithm.extend(tlv(0x05, &[], form));

    let mut spki = tlv(0x30, &algorithm, form);
    spki.extend(tlv(0x03, &bit_string, form));
    tlv(0x30, &spki, form)
}

fn positive_integer(magnitude: &[u8]) -> Vec<u8> {
    let first_non_zero = magnitude.iter().position(|b| *b != 0);
    let trimmed = match first_non_zero {
        Some(at) => &magnitude[at..],
        None => &[0x00][..],
    };

    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0x00);
    }
    out.extend_from_slice(trimmed);
    out
}

fn tlv(tag: u8, content: &[u8], form: LengthForm) -> Vec<u8> {
    let len = content.len();
    let mut out = vec![tag];
    match form {
        LengthForm::Minimal if len < 0x80 => out.push(len as u8),
        LengthForm::Minimal if len <= 0xFF => out.extend([0x81, len as u8]),
        LengthForm::Short => {
            assert!(len < 0x80, "length {len} does not fit the short form");
            out.push(len as u8);
        },
        LengthForm::LongOne => {
            assert!(len <= 0xFF, "length {len} does not fit the 0x81 form");
            out.extend([0x81, len as u8]);
        },
        LengthForm::Minimal | LengthForm::LongTwo => {
            let len = u16::try_from(len).expect("length does not fit the 0x82 form");
            out.push(0x82);
            out.extend(len.to_be_bytes());
        },
    }
    out.extend_from_slice(content);
    out
}

/// Wraps DER in `PUBLIC KEY` PEM armor with 64-column lines.
#[must_use]
pub fn pem_armor(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::from(PEM_HEADER);
    pem.push('\n');
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_FOOTER);
    pem.push('\n');
    pem
}

/// Encodes DER the way the key endpoint publishes it: base64 of PEM text.
#[must_use]
pub fn encode_public_key_response(der: &[u8]) -> String {
    STANDARD.encode(pem_armor(der))
}

/// Creates a raw token string from arbitrary header and payload JSON.
///
/// The resulting token has the structure `{header_b64}.{payload_b64}.` with
/// an empty signature. This is useful for testing rejection of malformed or
/// attack tokens (e.g., `alg: "none"`, algorithm confusion).
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[must_use]
pub fn craft_raw_token(header_json: &Value, payload_json: &Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

/// Flips one bit of the decoded segment at `index` (0 header, 1 payload,
/// 2 signature) and re-encodes the token.
///
/// # Panics
///
/// Panics if the token is not three base64url segments.
#[must_use]
pub fn flip_bit(token: &str, index: usize, byte: usize, bit: u8) -> String {
    let mut segments: Vec<String> = token.split('.').map(str::to_owned).collect();
    assert_eq!(segments.len(), 3, "token must have three segments");

    let mut bytes = URL_SAFE_NO_PAD.decode(&segments[index]).expect("base64url segment");
    let at = byte % bytes.len();
    bytes[at] ^= 1 << (bit % 8);
    segments[index] = URL_SAFE_NO_PAD.encode(bytes);
    segments.join(".")
}

/// Asserts that a result is an error matching the given [`CallbackError`](crate::CallbackError)
/// variant pattern.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use mmt_common_callback::{CallbackError, assert_callback_error};
///
/// let result: Result<(), CallbackError> = Err(CallbackError::TokenExpired);
/// assert_callback_error!(result, TokenExpired);
/// assert_callback_error!(
///     Err::<(), _>(CallbackError::signature("bad")),
///     Signature { .. }
/// );
/// ```
#[macro_export]
macro_rules! assert_callback_error {
    ($result:expr, $($variant:tt)+) => {
        match $result {
            Err($crate::CallbackError::$($variant)+) => {},
            Err(other) => panic!(
                "expected CallbackError::{}, got {:?}",
                stringify!($($variant)+),
                other
            ),
            Ok(_) => panic!("expected CallbackError::{}, got Ok", stringify!($($variant)+)),
        }
    };
}
