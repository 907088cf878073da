//! QRC wire protocol types and envelope encoding.
//!
//! The core speaks JSON-RPC 2.0 over the WebSocket, one JSON document per
//! text frame. Requests carry a numeric id; responses echo it, except that
//! some core firmware returns `id: null` — the client then correlates by
//! send order (see the outstanding-call table in `core::CoreClient`).
//!
//! Unsolicited frames (no id, a `method` field) are engine notifications:
//! `EngineStatus` on state changes and `ChangeGroup.Poll` results for
//! core-side auto-polled groups.

use anyhow::{bail, Result};
use serde_json::{json, Value};

/// Methods of the QRC catalogue the broker is allowed to issue.
///
/// `send_command` rejects anything else with an unknown-method error
/// before it reaches the wire, so a typo'd tool can never probe the core.
pub const METHOD_CATALOGUE: &[&str] = &[
    "NoOp",
    "Logon",
    "StatusGet",
    "Component.GetComponents",
    "Component.GetControls",
    "Component.Get",
    "Component.Set",
    "Control.Get",
    "Control.Set",
    "ChangeGroup.AddControl",
    "ChangeGroup.AddComponentControl",
    "ChangeGroup.Remove",
    "ChangeGroup.Poll",
    "ChangeGroup.Clear",
    "ChangeGroup.Destroy",
    "ChangeGroup.Invalidate",
    "ChangeGroup.AutoPoll",
    "Snapshot.Load",
    "Snapshot.Save",
];

/// True if `method` is in the QRC catalogue.
#[must_use]
pub fn is_known_method(method: &str) -> bool {
    METHOD_CATALOGUE.contains(&method)
}

/// Methods implemented broker-side rather than forwarded to the core.
///
/// The change-group verbs are served by the change-group engine; the
/// remaining catalogue methods go out over the WebSocket.
#[must_use]
pub fn is_change_group_method(method: &str) -> bool {
    method.starts_with("ChangeGroup.")
}

/// Encode a request envelope with the given id.
#[must_use]
pub fn encode_request(id: u64, method: &str, params: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    })
    .to_string()
}

/// A frame received from the core.
#[derive(Debug, Clone)]
pub enum CoreFrame {
    /// Response to a request: the echoed id (possibly absent) and the
    /// result payload.
    Response {
        /// Echoed request id; `None` when the core answered `id: null`.
        id: Option<u64>,
        /// `Ok(result)` or `Err((code, message))` from the error member.
        outcome: Result<Value, (i64, String)>,
    },
    /// Unsolicited notification (`EngineStatus`, auto-poll results, ...).
    Notification {
        /// Notification method name.
        method: String,
        /// Notification params.
        params: Value,
    },
}

/// Decode one text frame from the core.
///
/// # Errors
///
/// Returns an error for frames that are not JSON objects or that carry
/// neither a `method` nor a `result`/`error` member.
pub fn decode_frame(text: &str) -> Result<CoreFrame> {
    let value: Value = serde_json::from_str(text)?;
    let Some(obj) = value.as_object() else {
        bail!("core frame is not a JSON object");
    };

    // Notifications carry a method and no result/error.
    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        if !obj.contains_key("result") && !obj.contains_key("error") {
            return Ok(CoreFrame::Notification {
                method: method.to_string(),
                params: obj.get("params").cloned().unwrap_or(Value::Null),
            });
        }
    }

    let id = obj.get("id").and_then(Value::as_u64);
    if let Some(error) = obj.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown core error")
            .to_string();
        return Ok(CoreFrame::Response {
            id,
            outcome: Err((code, message)),
        });
    }
    if let Some(result) = obj.get("result") {
        return Ok(CoreFrame::Response {
            id,
            outcome: Ok(result.clone()),
        });
    }
    bail!("core frame has neither result, error, nor method")
}

/// Whether a core JSON-RPC error code is worth retrying.
///
/// Authentication failures and unknown methods will not get better on a
/// second attempt; everything else is treated as transient.
#[must_use]
pub fn is_retryable_core_error(code: i64) -> bool {
    // 10 = Logon required, 11 = bad credentials (QRC error table);
    // -32601 = method not found.
    !matches!(code, 10 | 11 | -32601)
}
