//! Response parsing at the model boundary.
//!
//! Parsing strategy:
//! 1. Try `serde_json::from_str` on the full response text.
//! 2. If that fails, strip a Markdown code fence and retry.
//! 3. If that fails, extract the first balanced `{…}` substring and retry.
//! 4. Otherwise the response is a schema error. There is no text fallback:
//!    partial state must never flow downstream.

use crate::LedgerError;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Outcome of parsing a model response into `T`
#[derive(Debug)]
pub enum Parsed<T> {
    Valid(T),
    SchemaError(String),
}

impl<T> Parsed<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Turn a schema error into [`LedgerError::MalformedResponse`].
    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Self::Valid(value) => Ok(value),
            Self::SchemaError(reason) => Err(LedgerError::MalformedResponse(reason)),
        }
    }

    /// Apply a further validation step to a successfully decoded value.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Result<U, String>) -> Parsed<U> {
        match self {
            Self::Valid(value) => match f(value) {
                Ok(u) => Parsed::Valid(u),
                Err(reason) => Parsed::SchemaError(reason),
            },
            Self::SchemaError(reason) => Parsed::SchemaError(reason),
        }
    }
}

/// Parse a model response as JSON of shape `T`.
pub fn parse_json<T: DeserializeOwned>(response: &str) -> Parsed<T> {
    let text = response.trim();
    if text.is_empty() {
        return Parsed::SchemaError("empty response".to_string());
    }

    // Layer 1: whole text
    let first_err = match serde_json::from_str::<T>(text) {
        Ok(value) => return Parsed::Valid(value),
        Err(e) => e,
    };

    // Layer 2: fenced block
    let unfenced = strip_code_fences(text);
    if unfenced != text {
        if let Ok(value) = serde_json::from_str::<T>(unfenced) {
            return Parsed::Valid(value);
        }
    }

    // Layer 3: first balanced object
    if let Some(json_str) = extract_json_object(text) {
        match serde_json::from_str::<T>(json_str) {
            Ok(value) => return Parsed::Valid(value),
            Err(e) => {
                debug!("Embedded JSON object did not match schema: {e}");
                return Parsed::SchemaError(e.to_string());
            }
        }
    }

    Parsed::SchemaError(first_err.to_string())
}

/// Remove a surrounding ```` ``` ```` / ```` ```json ```` fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening line
    match body.find('\n') {
        Some(pos) => body[pos + 1..].trim(),
        None => body.trim(),
    }
}

/// Extract the first balanced JSON object from `text`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return text.get(start..start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
