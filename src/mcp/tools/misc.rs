//! Echo and documentation tools.

use serde_json::{json, Value};

use crate::core::protocol::METHOD_CATALOGUE;
use crate::error::{BrokerError, BrokerResult};
use crate::mcp::schema;

/// `echo` — connectivity check, callable anonymously.
pub fn echo(params: &Value) -> BrokerResult<Value> {
    let message = schema::require_str(params, "message")?;
    Ok(json!({ "message": message }))
}

/// `get_api_documentation` — self-describing docs for agents.
pub fn get_api_documentation(params: &Value) -> BrokerResult<Value> {
    let query_type = schema::require_str(params, "query_type")?;
    let search = schema::opt_str(params, "search")?.map(|s| s.to_lowercase());

    let matches = |text: &str| -> bool {
        search
            .as_ref()
            .is_none_or(|needle| text.to_lowercase().contains(needle))
    };

    match query_type.as_str() {
        "tools" => {
            let tools: Vec<Value> = super::catalog()
                .into_iter()
                .filter(|t| matches(t.id) || matches(t.description))
                .map(|t| {
                    json!({
                        "id": t.id,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();
            Ok(json!({ "queryType": "tools", "tools": tools }))
        }
        "methods" => {
            let methods: Vec<&str> = METHOD_CATALOGUE
                .iter()
                .copied()
                .filter(|m| matches(m))
                .collect();
            Ok(json!({ "queryType": "methods", "methods": methods }))
        }
        "errors" => {
            let errors: Vec<Value> = [
                (1001, "connection", "core link not available"),
                (1002, "timeout", "command exceeded its deadline"),
                (1003, "circuit_open", "breaker open, request fast-failed"),
                (1004, "auth", "missing or invalid credentials"),
                (1005, "rate_limit", "token bucket exhausted; carries retry-after"),
                (1006, "validation", "parameter schema mismatch"),
                (1007, "unknown_method", "tool or core method not registered"),
                (1008, "unknown_component", "component absent from the design"),
                (1009, "unknown_control", "control absent from the index"),
                (1010, "unknown_group", "change group does not exist"),
                (1011, "persistence", "event store unavailable or write failed"),
                (1012, "state", "operation invalid for current state"),
                (1013, "internal", "unexpected failure; carries a correlation id"),
            ]
            .iter()
            .filter(|(_, kind, text)| matches(kind) || matches(text))
            .map(|(code, kind, text)| json!({ "code": code, "kind": kind, "description": text }))
            .collect();
            Ok(json!({ "queryType": "errors", "errors": errors }))
        }
        "examples" => Ok(json!({
            "queryType": "examples",
            "examples": [
                {
                    "title": "Discover and read a gain",
                    "steps": [
                        { "tool": "list_components", "params": { "filter": "^Gain" } },
                        { "tool": "get_control_values", "params": { "controlNames": ["Gain1.gain"] } },
                    ]
                },
                {
                    "title": "Watch a mixer with a change group",
                    "steps": [
                        { "tool": "create_change_group", "params": { "groupId": "mix", "pollRate": 0.5 } },
                        { "tool": "add_controls_to_change_group", "params": { "groupId": "mix", "controlNames": ["Mixer.out1.gain"] } },
                        { "tool": "query_change_events", "params": { "groupId": "mix" } },
                    ]
                },
            ]
        })),
        other => Err(BrokerError::Validation {
            field: "query_type".to_string(),
            reason: format!("unknown query_type '{other}'"),
        }),
    }
}
