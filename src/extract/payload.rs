//! Defensive accessors over raw platform payloads.
//!
//! The platform ships two dialects (the page-render JSON and the lower-level
//! API JSON) and neither is stable. Every accessor tolerates missing keys,
//! nulls, and type variance, defaulting to empty/zero so a malformed payload
//! degrades to a partial extraction instead of an error.

use serde_json::Value;

static NULL: Value = Value::Null;
const EMPTY: &[Value] = &[];

/// Walk a key path, returning `Null` when any step is missing.
pub fn at<'a>(value: &'a Value, path: &[&str]) -> &'a Value {
    let mut current = value;
    for key in path {
        current = current.get(key).unwrap_or(&NULL);
    }
    current
}

/// String at a key path, empty when absent or not a string.
pub fn str_at(value: &Value, path: &[&str]) -> String {
    at(value, path).as_str().unwrap_or_default().to_string()
}

/// Integer at a key path; accepts numbers, floats, and numeric strings.
pub fn i64_at(value: &Value, path: &[&str]) -> i64 {
    let v = at(value, path);
    if let Some(n) = v.as_i64() {
        return n;
    }
    if let Some(f) = v.as_f64() {
        return f as i64;
    }
    v.as_str().and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Boolean at a key path; accepts bools and 0/1 numbers.
pub fn bool_at(value: &Value, path: &[&str]) -> bool {
    let v = at(value, path);
    v.as_bool().unwrap_or_else(|| v.as_i64().unwrap_or(0) != 0)
}

/// Array at a key path, empty when absent.
pub fn array_at<'a>(value: &'a Value, path: &[&str]) -> &'a [Value] {
    at(value, path).as_array().map_or(EMPTY, Vec::as_slice)
}

/// Unix timestamp at a key path.
///
/// The page-render dialect carries RFC 3339 strings, the API dialect epoch
/// seconds or milliseconds; all three are normalized to epoch seconds.
pub fn epoch_at(value: &Value, path: &[&str]) -> i64 {
    let v = at(value, path);

    if let Some(n) = v.as_i64() {
        // Millisecond timestamps are thirteen digits.
        return if n > 100_000_000_000 { n / 1000 } else { n };
    }

    if let Some(s) = v.as_str() {
        if let Ok(n) = s.parse::<i64>() {
            return if n > 100_000_000_000 { n / 1000 } else { n };
        }
        if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(s) {
            return parsed.timestamp();
        }
    }

    0
}

/// Serialize a sub-object back to a compact JSON string, empty for `Null`.
pub fn raw_at(value: &Value, path: &[&str]) -> String {
    let v = at(value, path);
    if v.is_null() {
        String::new()
    } else {
        v.to_string()
    }
}
