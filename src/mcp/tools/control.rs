//! Control tools: batch get and set.

use serde_json::{json, Value};

use crate::adapter::types::ControlValue;
use crate::adapter::SetRequest;
use crate::constants;
use crate::error::{BrokerError, BrokerResult};
use crate::mcp::schema;

use super::ToolContext;

/// Ramp/fade parameter names accepted on set entries but never forwarded
/// to the core. The result payload annotates which ones were present.
const IGNORED_SET_FIELDS: &[&str] = &["ramp", "rampTime", "fade", "fadeTime"];

/// `get_control_values` — batch read, ≤ 100 names.
pub async fn get_control_values(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let names = schema::require_str_array(
        params,
        "controlNames",
        Some(constants::MAX_BATCH_CONTROLS),
    )?;
    let outcomes = ctx.adapter.get_control_values(&names).await?;
    Ok(json!(outcomes))
}

/// `set_control_values` — batch write with per-entry atomicity.
pub async fn set_control_values(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let Some(entries) = params.get("controls").and_then(Value::as_array) else {
        return Err(BrokerError::Validation {
            field: "controls".to_string(),
            reason: "required array of {name, value, validate?}".to_string(),
        });
    };
    if entries.len() > constants::MAX_BATCH_CONTROLS {
        return Err(BrokerError::Validation {
            field: "controls".to_string(),
            reason: format!(
                "at most {} entries per call, got {}",
                constants::MAX_BATCH_CONTROLS,
                entries.len()
            ),
        });
    }

    let mut requests = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BrokerError::Validation {
                field: format!("controls[{i}].name"),
                reason: "required string".to_string(),
            })?;
        let raw_value = entry.get("value").ok_or_else(|| BrokerError::Validation {
            field: format!("controls[{i}].value"),
            reason: "required".to_string(),
        })?;
        if !matches!(
            raw_value,
            Value::Bool(_) | Value::Number(_) | Value::String(_)
        ) {
            return Err(BrokerError::Validation {
                field: format!("controls[{i}].value"),
                reason: "expected number, boolean, or string".to_string(),
            });
        }
        let validate = entry
            .get("validate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let ignored_fields: Vec<String> = IGNORED_SET_FIELDS
            .iter()
            .filter(|f| entry.get(**f).is_some())
            .map(|f| (*f).to_string())
            .collect();

        requests.push(SetRequest {
            name: name.to_string(),
            value: ControlValue::from_json(raw_value),
            validate,
            ignored_fields,
        });
    }

    // Per-entry atomicity: the result is the array itself, so partial
    // success reads as exactly what it is.
    let outcomes = ctx.adapter.set_control_values(&requests).await?;
    Ok(json!(outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_field_names_cover_ramp_and_fade() {
        // The annotation contract: every spelled variant is recognized.
        for field in ["ramp", "rampTime", "fade", "fadeTime"] {
            assert!(IGNORED_SET_FIELDS.contains(&field));
        }
    }
}
