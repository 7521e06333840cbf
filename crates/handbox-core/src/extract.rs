// ABOUTME: Shared best-effort extraction of JSON embedded in free-form model output.
// ABOUTME: One fallback policy for every strategy: fenced block, balanced object, balanced array, raw text.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::MalformedModelOutput;

/// Pull a JSON object or array out of a model response.
///
/// Tried in order:
/// 1. the whole (trimmed) response, when it is already valid JSON
/// 2. the body of each fenced code block (```json ... ``` or bare ```)
/// 3. the first balanced `{...}` that parses
/// 4. the first balanced `[...]` that parses
///
/// When nothing matches, the response is unstructured text and the error
/// carries it so the caller can degrade to a raw-text result.
pub fn extract_structured(text: &str) -> Result<Value, MalformedModelOutput> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && is_structured(&value)
    {
        return Ok(value);
    }

    for block in fenced_blocks(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim())
            && is_structured(&value)
        {
            return Ok(value);
        }
    }

    if let Some(value) = first_balanced(text, '{', '}') {
        return Ok(value);
    }

    if let Some(value) = first_balanced(text, '[', ']') {
        return Ok(value);
    }

    Err(MalformedModelOutput {
        raw: text.to_string(),
    })
}

/// Extract and deserialize into `T`. A shape mismatch counts as malformed
/// output, same as a missing JSON payload.
pub fn extract_typed<T: DeserializeOwned>(text: &str) -> Result<T, MalformedModelOutput> {
    let value = extract_structured(text)?;
    serde_json::from_value(value).map_err(|_| MalformedModelOutput {
        raw: text.to_string(),
    })
}

/// Render a JSON value as prompt/search text: strings verbatim, null as
/// empty, everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_structured(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

/// Bodies of all closed ``` fences, skipping the info string on the opening line.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let Some(newline) = after_fence.find('\n') else {
            break;
        };
        let body = &after_fence[newline + 1..];
        match body.find("```") {
            Some(end) => {
                blocks.push(&body[..end]);
                rest = &body[end + 3..];
            }
            None => break,
        }
    }

    blocks
}

/// Try each `open` position in order and return the first balanced span
/// that parses as JSON.
fn first_balanced(text: &str, open: char, close: char) -> Option<Value> {
    for (start, _) in text.match_indices(open) {
        let tail = &text[start..];
        if let Some(end) = matching_close(tail, open, close)
            && let Ok(value) = serde_json::from_str::<Value>(&tail[..=end])
        {
            return Some(value);
        }
    }
    None
}

/// Byte offset of the delimiter closing the one at offset 0, ignoring
/// delimiters inside JSON string literals.
fn matching_close(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(i);
            }
        }
    }

    None
}
