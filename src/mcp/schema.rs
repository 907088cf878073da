//! Parameter extraction with field-level validation errors.
//!
//! Tool schemas are published as JSON Schema objects in `tools/list`,
//! but validation itself is hand-rolled: each extractor returns a
//! [`BrokerError::Validation`] naming the offending field and reason,
//! which maps directly onto the `-32602` / field-error contract.

use serde_json::Value;

use crate::error::{BrokerError, BrokerResult};

fn invalid(field: &str, reason: impl Into<String>) -> BrokerError {
    BrokerError::Validation {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Required string field.
pub fn require_str(params: &Value, field: &str) -> BrokerResult<String> {
    match params.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(invalid(field, "must not be empty")),
        Some(_) => Err(invalid(field, "expected string")),
        None => Err(invalid(field, "required")),
    }
}

/// Optional string field.
pub fn opt_str(params: &Value, field: &str) -> BrokerResult<Option<String>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(field, "expected string")),
    }
}

/// Optional boolean field with a default.
pub fn opt_bool(params: &Value, field: &str, default: bool) -> BrokerResult<bool> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid(field, "expected boolean")),
    }
}

/// Optional number field.
pub fn opt_f64(params: &Value, field: &str) -> BrokerResult<Option<f64>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(field, "expected finite number")),
        Some(_) => Err(invalid(field, "expected number")),
    }
}

/// Optional integer field (non-negative).
pub fn opt_u64(params: &Value, field: &str) -> BrokerResult<Option<u64>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(field, "expected non-negative integer")),
        Some(_) => Err(invalid(field, "expected integer")),
    }
}

/// Optional signed millisecond timestamp.
pub fn opt_i64(params: &Value, field: &str) -> BrokerResult<Option<i64>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(field, "expected integer")),
        Some(_) => Err(invalid(field, "expected integer")),
    }
}

/// Required array of strings, with an optional length cap.
pub fn require_str_array(
    params: &Value,
    field: &str,
    max_len: Option<usize>,
) -> BrokerResult<Vec<String>> {
    let Some(raw) = params.get(field) else {
        return Err(invalid(field, "required"));
    };
    str_array_inner(raw, field, max_len)
}

/// Optional array of strings, with an optional length cap.
pub fn opt_str_array(
    params: &Value,
    field: &str,
    max_len: Option<usize>,
) -> BrokerResult<Option<Vec<String>>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => str_array_inner(raw, field, max_len).map(Some),
    }
}

fn str_array_inner(raw: &Value, field: &str, max_len: Option<usize>) -> BrokerResult<Vec<String>> {
    let Some(arr) = raw.as_array() else {
        return Err(invalid(field, "expected array of strings"));
    };
    if let Some(max) = max_len {
        if arr.len() > max {
            return Err(invalid(
                field,
                format!("at most {max} entries, got {}", arr.len()),
            ));
        }
    }
    let mut out = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        match item.as_str() {
            Some(s) if !s.is_empty() => out.push(s.to_string()),
            Some(_) => return Err(invalid(&format!("{field}[{i}]"), "must not be empty")),
            None => return Err(invalid(&format!("{field}[{i}]"), "expected string")),
        }
    }
    Ok(out)
}

/// Compile an optional regex filter field.
pub fn opt_regex(params: &Value, field: &str) -> BrokerResult<Option<regex::Regex>> {
    match opt_str(params, field)? {
        None => Ok(None),
        Some(pattern) => regex::Regex::new(&pattern)
            .map(Some)
            .map_err(|e| invalid(field, format!("invalid regex: {e}"))),
    }
}
