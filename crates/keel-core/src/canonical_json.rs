//! Canonical JSON serialization and content fingerprints.
//!
//! Desired states are compared across apply invocations by fingerprint, so
//! two semantically equal documents must always hash to the same value no
//! matter how their maps were built. Canonical JSON has:
//!
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - UTF-8 output
//! - Integral floats written as integers (`1.0` and `1` are the same value)

use std::io::Write;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix of every fingerprint produced by [`fingerprint`].
pub const FINGERPRINT_PREFIX: &str = "sha256:";

/// Errors that can occur during canonical JSON serialization.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// Serde JSON conversion failed.
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error during writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 encoding error (should never happen with valid JSON).
    #[error("UTF-8 encoding error")]
    Utf8Error,
}

/// Serialize `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if the value cannot be represented as JSON.
#[must_use = "canonical bytes should be used for hashing"]
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let v = serde_json::to_value(value)?;
    let mut out = Vec::<u8>::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Same as [`to_canonical_bytes`], but returns a UTF-8 String.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if serialization fails or
/// `CanonicalJsonError::Utf8Error` if UTF-8 conversion fails.
#[must_use = "canonical string should be used for hashing"]
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|_| CanonicalJsonError::Utf8Error)
}

/// Returns `sha256:<hex>` over the canonical JSON encoding of `value`.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    let hash = Sha256::digest(&bytes);
    Ok(format!("{FINGERPRINT_PREFIX}{}", hex::encode(hash)))
}

fn write_value(v: &Value, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => serde_json::to_writer(&mut *out, s)?,
        Value::Array(arr) => {
            out.push(b'[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, out)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    out.push(b'{');

    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    for (i, (k, val)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut *out, k)?;
        out.push(b':');
        write_value(val, out)?;
    }

    out.push(b'}');
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn write_number(n: &Number, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    if let Some(i) = n.as_i64() {
        write!(out, "{i}")?;
    } else if let Some(u) = n.as_u64() {
        write!(out, "{u}")?;
    } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < 9.0e15 {
            write!(out, "{}", f as i64)?;
        } else {
            serde_json::to_writer(&mut *out, n)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_level() {
        let v = json!({"b": 1, "a": {"z": true, "m": null}});
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            r#"{"a":{"m":null,"z":true},"b":1}"#
        );
    }

    #[test]
    fn integral_floats_match_integers() {
        let a = fingerprint(&json!({"ttl": 60})).unwrap();
        let b = fingerprint(&json!({"ttl": 60.0})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = fingerprint(&json!({"name": "www"})).unwrap();
        let b = fingerprint(&json!({"name": "mail"})).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(FINGERPRINT_PREFIX));
        assert_eq!(a.len(), FINGERPRINT_PREFIX.len() + 64);
    }

    proptest::proptest! {
        #[test]
        fn fingerprint_ignores_insertion_order(
            entries in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 0..12)
        ) {
            let forward: Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reversed: Map<String, Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            proptest::prop_assert_eq!(
                fingerprint(&Value::Object(forward)).unwrap(),
                fingerprint(&Value::Object(reversed)).unwrap()
            );
        }
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"records": ["v=DMARC1; p=none;", "quote\"d"]});
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            r#"{"records":["v=DMARC1; p=none;","quote\"d"]}"#
        );
    }
}
