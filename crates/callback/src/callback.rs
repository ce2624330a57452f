//! Batch translation callback envelope.
//!
//! The signing service delivers the outcome of a batch translation as
//!
//! ```json
//! {
//!   "result": { "status": 200, "data": { "translation": "..." } },
//!   "metadata": { "any": "caller supplied json" }
//! }
//! ```
//!
//! where `data` is either one translation or an array of them, and a failed
//! job carries `"error": {"type": ..., "message": ...}` instead of `data`.
//! [`decode`] turns a verified envelope into a [`BatchTranslationResult`] or
//! a [`DomainError`].

use mmt_common_api::envelope::{ErrorBody, is_success};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{CallbackError, DomainError, Result},
    verifier::VerifiedToken,
};

/// One translated text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    /// Translated text.
    pub translation: String,
    /// Context vector used for adaptation, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_vector: Option<String>,
    /// Source characters processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<u64>,
    /// Characters billed for this translation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billed_characters: Option<u64>,
    /// Source language detected by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
    /// Alternative translations, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_translations: Option<Vec<String>>,
}

/// Payload of a successful callback, shaped like the original request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationData {
    /// The job translated a single text.
    Single(Translation),
    /// The job translated a list of texts; order matches the request.
    Batch(Vec<Translation>),
}

/// A successfully decoded batch translation callback.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTranslationResult {
    /// The translated payload.
    pub data: TranslationData,
    /// Caller supplied metadata, passed through untouched.
    pub metadata: Option<Value>,
}

impl BatchTranslationResult {
    /// The translation of a single-text job, `None` for batches.
    #[must_use]
    pub fn translation(&self) -> Option<&Translation> {
        match &self.data {
            TranslationData::Single(translation) => Some(translation),
            TranslationData::Batch(_) => None,
        }
    }

    /// All translations; a single-text job yields a one-element slice.
    #[must_use]
    pub fn translations(&self) -> &[Translation] {
        match &self.data {
            TranslationData::Single(translation) => std::slice::from_ref(translation),
            TranslationData::Batch(translations) => translations,
        }
    }

    /// Returns `true` when the job translated a list of texts.
    #[must_use]
    pub fn is_batch(&self) -> bool {
        matches!(self.data, TranslationData::Batch(_))
    }

    /// Consumes the result, returning all translations in request order.
    #[must_use]
    pub fn into_translations(self) -> Vec<Translation> {
        match self.data {
            TranslationData::Single(translation) => vec![translation],
            TranslationData::Batch(translations) => translations,
        }
    }
}

/// Decodes a callback envelope whose token has been verified.
///
/// # Errors
///
/// - [`CallbackError::Domain`] if `result.status` is outside `[200, 299]`;
///   the error carries the status, `result.error` (or defaults) and metadata
/// - [`CallbackError::Envelope`] if `result` or `result.status` is missing,
///   the status is not an integer, or a successful `data` does not decode
pub fn decode(body: &Value, _verified: &VerifiedToken) -> Result<BatchTranslationResult> {
    let result = body
        .get("result")
        .filter(|r| r.is_object())
        .ok_or_else(|| CallbackError::envelope("missing result object"))?;
    let status = result
        .get("status")
        .ok_or_else(|| CallbackError::envelope("missing result.status"))?
        .as_i64()
        .ok_or_else(|| CallbackError::envelope("result.status is not an integer"))?;

    let metadata = body.get("metadata").filter(|m| !m.is_null()).cloned();

    if !is_success(status) {
        let error = result.get("error").map(ErrorBody::from_value).unwrap_or_default();
        let code = i32::try_from(status).unwrap_or(i32::MAX);
        tracing::debug!(status = code, kind = error.kind_or_default(), "batch translation failed");

        return Err(DomainError {
            code,
            kind: error.kind_or_default().to_owned(),
            message: error.message_or_default().to_owned(),
            metadata,
        }
        .into());
    }

    let data = result.get("data").ok_or_else(|| CallbackError::envelope("missing result.data"))?;
    let data = match data {
        Value::Array(_) => TranslationData::Batch(
            Vec::<Translation>::deserialize(data)
                .map_err(|e| CallbackError::envelope(format!("invalid result.data: {e}")))?,
        ),
        _ => TranslationData::Single(
            Translation::deserialize(data)
                .map_err(|e| CallbackError::envelope(format!("invalid result.data: {e}")))?,
        ),
    };

    Ok(BatchTranslationResult { data, metadata })
}
