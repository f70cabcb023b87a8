//! Recovery of binary payloads that a storage adapter returned as text.
//!
//! Some adapters hand back `[137,80,78,71,...]`, `[137 80 78 71 ...]`,
//! `137 80 78 71` or a JSON string wrapping one of those instead of the raw
//! bytes. Each pass peels one layer; at most [`MAX_REPAIR_PASSES`] run.

use bytes::Bytes;

pub const MAX_REPAIR_PASSES: usize = 4;

/// Undo textual encodings of `data`, leaving genuine binary untouched.
pub fn repair_textual_bytes(data: Bytes) -> Bytes {
    let mut current = data;
    for _ in 0..MAX_REPAIR_PASSES {
        match decode_once(&current) {
            Some(decoded) if decoded.as_slice() != current.as_ref() => {
                current = Bytes::from(decoded);
            }
            _ => break,
        }
    }
    current
}

fn decode_once(data: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(data).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    if text.starts_with('"') {
        if let Ok(serde_json::Value::String(inner)) = serde_json::from_str(text) {
            return Some(inner.into_bytes());
        }
        return None;
    }

    let (inner, bracketed) = match text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        Some(inner) => (inner, true),
        None => (text, false),
    };

    let mut out = Vec::new();
    for token in inner
        .split(|c: char| c == ',' || c.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
    {
        out.push(token.parse::<u8>().ok()?);
    }

    // A lone bare number is more likely real text than a one-byte image.
    if out.is_empty() || (!bracketed && out.len() < 2) {
        return None;
    }
    Some(out)
}
