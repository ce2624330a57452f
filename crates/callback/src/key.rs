//! Decoded signing key material.
//!
//! The key endpoint publishes the signing service's RSA public key as
//! base64 of PEM text. [`decode_public_key_response`] peels the layers
//! (base64, PEM armor, base64, DER) and yields a [`PublicKeyMaterial`]
//! ready for signature verification.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use mmt_common_api::PublicKeyResponse;
use zeroize::Zeroizing;

use crate::{
    der::decode_rsa_public_key,
    error::{CallbackError, Result},
};

/// Opening line of the PEM armor around a `SubjectPublicKeyInfo`.
pub const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";

/// Closing line of the PEM armor around a `SubjectPublicKeyInfo`.
pub const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

/// An RSA public key decoded from the key endpoint.
///
/// Immutable once built; the key provider swaps whole values on rotation.
#[derive(Clone)]
pub struct PublicKeyMaterial {
    modulus: Vec<u8>,
    exponent: Vec<u8>,
    fetched_at: DateTime<Utc>,
    decoding_key: DecodingKey,
}

impl PublicKeyMaterial {
    /// Builds key material from big-endian modulus and exponent magnitudes.
    #[must_use]
    pub fn new(modulus: Vec<u8>, exponent: Vec<u8>, fetched_at: DateTime<Utc>) -> Self {
        let decoding_key = DecodingKey::from_rsa_raw_components(&modulus, &exponent);
        Self { modulus, exponent, fetched_at, decoding_key }
    }

    /// Modulus `n`, big-endian, without sign octet.
    #[must_use]
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// Public exponent `e`, big-endian, without sign octet.
    #[must_use]
    pub fn exponent(&self) -> &[u8] {
        &self.exponent
    }

    /// When the key was fetched from the key endpoint.
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Key strength in bits, derived from the modulus length.
    #[must_use]
    pub fn key_bits(&self) -> usize {
        match self.modulus.first() {
            Some(&top) => (self.modulus.len() - 1) * 8 + (8 - top.leading_zeros() as usize),
            None => 0,
        }
    }

    /// Returns `true` when `other` carries the same public key.
    #[must_use]
    pub fn same_key(&self, other: &Self) -> bool {
        self.modulus == other.modulus && self.exponent == other.exponent
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

impl fmt::Debug for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyMaterial")
            .field("key_bits", &self.key_bits())
            .field("exponent", &self.exponent)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

/// Decodes a key endpoint response into key material stamped with the current time.
///
/// # Errors
///
/// Returns [`CallbackError::Parse`] if the outer base64, the PEM text, the
/// inner base64 or the DER structure is malformed.
pub fn decode_public_key_response(response: &PublicKeyResponse) -> Result<PublicKeyMaterial> {
    let pem: Zeroizing<Vec<u8>> = Zeroizing::new(
        STANDARD
            .decode(response.public_key.trim())
            .map_err(|e| CallbackError::parse(format!("base64 decode of PEM text: {e}")))?,
    );
    let der = pem_to_der(&pem)?;

    let components = decode_rsa_public_key(&der)?;
    Ok(PublicKeyMaterial::new(components.modulus, components.exponent, Utc::now()))
}

/// Strips `PUBLIC KEY` armor and whitespace from PEM text and decodes the body.
fn pem_to_der(pem: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| CallbackError::parse("PEM text is not valid UTF-8"))?;

    let body = match text.find(PEM_HEADER) {
        Some(start) => {
            let rest = &text[start + PEM_HEADER.len()..];
            let end = rest
                .find(PEM_FOOTER)
                .ok_or_else(|| CallbackError::parse("PEM text has no END PUBLIC KEY line"))?;
            &rest[..end]
        },
        None => text,
    };

    let body: Zeroizing<String> =
        Zeroizing::new(body.chars().filter(|c| !c.is_ascii_whitespace()).collect());
    if body.is_empty() {
        return Err(CallbackError::parse("PEM body is empty"));
    }

    STANDARD
        .decode(body.as_bytes())
        .map(Zeroizing::new)
        .map_err(|e| CallbackError::parse(format!("base64 decode of PEM body: {e}")))
}
