//! RFC 8785 (JCS) canonical JSON serialization (C2, first half).
//!
//! Used for every payload whose bytes are signed or HMAC'd: pairing
//! transcripts, auth tags, and fingerprints-over-certificates all depend on
//! both sides producing byte-identical canonical output. Only object key
//! ordering, number formatting, and whitespace are in scope here — this is
//! not a general JSON formatter.

use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;

#[derive(Debug, thiserror::Error)]
pub enum CanonicalJsonError {
    #[error("value is not representable in canonical JSON: {0}")]
    Unrepresentable(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Serialize `value` to RFC 8785 canonical JSON bytes.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let v = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&v, &mut out)?;
    Ok(out.into_bytes())
}

/// Serialize `value` to an RFC 8785 canonical JSON `String`.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    Ok(String::from_utf8(to_canonical_bytes(value)?)
        .expect("canonical JSON writer only emits valid UTF-8"))
}

/// Re-canonicalize an already-parsed `serde_json::Value`. Used to verify
/// idempotence (`canonical(parse(canonical(o))) == canonical(o)`).
pub fn canonicalize_value(value: &Value) -> Result<String, CanonicalJsonError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CanonicalJsonError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // JCS: object members sorted by UTF-16 code unit of the key.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| utf16_code_units(a).cmp(&utf16_code_units(b)));
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn utf16_code_units(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Minimal-escape JSON string encoder: only `"`, `\`, and control
/// characters (U+0000–U+001F) are escaped, matching JCS's "no unnecessary
/// escaping" requirement.
fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// ECMA-262 "shortest round-trip" number formatting. JSON numbers in this
/// codebase are always integers (timestamps, ports, levels) or plain
/// floats from external callers; both cases round-trip through `f64`.
fn write_number(n: &serde_json::Number, out: &mut String) -> Result<(), CanonicalJsonError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
        return Ok(());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| CanonicalJsonError::Unrepresentable(n.to_string()))?;
    if !f.is_finite() {
        return Err(CanonicalJsonError::Unrepresentable(n.to_string()));
    }
    if f == f.trunc() && f.abs() < 1e15 {
        let _ = write!(out, "{}", f as i64);
    } else {
        let _ = write!(out, "{}", ryu_shortest(f));
    }
    Ok(())
}

/// Shortest decimal representation that round-trips to the same `f64`,
/// without pulling in a dedicated grisu/ryu crate: Rust's `{}` formatter
/// for `f64` already produces the shortest round-tripping form, we only
/// need to drop a trailing `.0` equivalent the canonical form disallows
/// for exponents and keep lowercase `e`.
fn ryu_shortest(f: f64) -> String {
    let s = format!("{f}");
    s.replace('E', "e")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys_by_utf16_code_unit() {
        let v = json!({"b": 1, "a": 2, "A": 3});
        let s = canonicalize_value(&v).unwrap();
        assert_eq!(s, r#"{"A":3,"a":2,"b":1}"#);
    }

    #[test]
    fn integers_have_no_decimal_point() {
        let v = json!({"timestamp": 123, "peakLevel": 85});
        let s = canonicalize_value(&v).unwrap();
        assert_eq!(s, r#"{"peakLevel":85,"timestamp":123}"#);
    }

    #[test]
    fn escapes_only_required_characters() {
        let v = json!({"name": "a\"b\\c\nd"});
        let s = canonicalize_value(&v).unwrap();
        assert_eq!(s, r#"{"name":"a\"b\\c\nd"}"#);
    }

    #[test]
    fn idempotent_under_reparse() {
        let v = json!({"z": [1, 2, {"y": true, "x": null}], "a": "hi"});
        let once = canonicalize_value(&v).unwrap();
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        let twice = canonicalize_value(&reparsed).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn no_whitespace_in_output() {
        let v = json!({"a": [1, 2, 3], "b": "x"});
        let s = canonicalize_value(&v).unwrap();
        assert!(!s.contains(' '));
        assert!(!s.contains('\n'));
    }
}
