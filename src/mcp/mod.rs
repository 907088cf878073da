//! MCP transport: line-delimited JSON-RPC 2.0 over stdio.
//!
//! stdout carries only JSON-RPC responses; everything diagnostic goes to
//! stderr through the logger. This module owns envelope parsing and
//! response shaping; the broker loop owns the actual stdin/stdout pump.
//!
//! # Envelope contract
//!
//! Requests: `{jsonrpc:"2.0", method, params?, id?}` — one per line.
//! `method` is an MCP method (`initialize`, `tools/list`, `tools/call`)
//! or a tool id invoked directly. Responses echo the id; parse failures
//! answer with `-32700`, unknown methods `-32601`, invalid params
//! `-32602`, internal errors `-32603`, and domain failures carry the
//! positive codes from the error taxonomy.

pub mod audit;
pub mod dispatch;
pub mod rate_limit;
pub mod schema;
pub mod tools;

use serde_json::{json, Value};

use crate::error::BrokerError;

/// JSON-RPC parse error code.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC unknown-method code.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC invalid-params code.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC internal-error code.
pub const INTERNAL_ERROR: i64 = -32603;

/// A decoded request line.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Request id; `None` marks a notification (no response expected).
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Params object (`{}` when absent).
    pub params: Value,
}

/// Decode one stdin line.
///
/// # Errors
///
/// Returns the ready-to-write `-32700` response for undecodable lines.
pub fn parse_request(line: &str) -> Result<RpcRequest, Value> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| error_response(Value::Null, PARSE_ERROR, &format!("parse error: {e}")))?;
    let Some(obj) = value.as_object() else {
        return Err(error_response(
            Value::Null,
            PARSE_ERROR,
            "request must be a JSON object",
        ));
    };
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return Err(error_response(
            obj.get("id").cloned().unwrap_or(Value::Null),
            PARSE_ERROR,
            "request has no method",
        ));
    };
    Ok(RpcRequest {
        id: obj.get("id").cloned().filter(|id| !id.is_null()),
        method: method.to_string(),
        params: obj.get("params").cloned().unwrap_or_else(|| json!({})),
    })
}

/// Build a success response.
#[must_use]
pub fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response with a transport-level code.
#[must_use]
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Map a domain error onto a JSON-RPC error response.
///
/// Validation errors surface as `-32602` with the field detail in
/// `data`; every other kind keeps its stable positive code.
#[must_use]
pub fn broker_error_response(id: Value, err: &BrokerError) -> Value {
    let mut error = err.to_jsonrpc();
    if matches!(err, BrokerError::Validation { .. }) {
        error["code"] = json!(INVALID_PARAMS);
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// The `initialize` handshake result.
#[must_use]
pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2025-03-26",
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": crate::constants::SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// The `tools/list` result.
#[must_use]
pub fn tools_list_result() -> Value {
    let tools: Vec<Value> = tools::catalog()
        .into_iter()
        .map(|t| {
            json!({
                "name": t.id,
                "description": t.description,
                "inputSchema": t.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}
