//! Output Extractor: pulls the first balanced JSON object/array out of noisy
//! helper output.
//!
//! Two phases: locate the balanced region with a string-aware depth walk, then
//! hand exactly that slice to `serde_json`. Helpers routinely print progress
//! lines or warnings around their payload, so whole-string parsing is not an option.

use serde_json::Value;
use thiserror::Error;

const BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no JSON object or array found")]
    NoPayload,

    #[error("unclosed JSON object or array starting at byte {start}")]
    Unbalanced { start: usize },

    #[error("malformed JSON payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parses the first balanced `{...}` / `[...]` region of `raw`.
pub fn extract(raw: &str) -> Result<Value, ExtractionError> {
    let text = raw.strip_prefix(BOM).unwrap_or(raw);
    let (start, end) = locate_payload(text)?;
    Ok(serde_json::from_str(&text[start..end])?)
}

/// Returns the byte range `[start, end)` of the first balanced region.
///
/// Brackets inside string literals are ignored; a backslash escapes exactly the
/// next character, so `"\\"` closes the string and `"\""` does not.
fn locate_payload(text: &str) -> Result<(usize, usize), ExtractionError> {
    let bytes = text.as_bytes();
    let start = bytes
        .iter()
        .position(|&b| b == b'{' || b == b'[')
        .ok_or(ExtractionError::NoPayload)?;

    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    // Structural characters are all ASCII, so a byte walk never splits a UTF-8
    // sequence at a reported boundary.
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((start, start + offset + 1));
                }
            }
            _ => {}
        }
    }

    Err(ExtractionError::Unbalanced { start })
}
