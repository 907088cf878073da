//! Core status tool.

use serde_json::{json, Value};

use crate::error::BrokerResult;
use crate::mcp::schema;

use super::ToolContext;

/// `query_core_status` — StatusGet plus optional broker-side sections.
pub async fn query_core_status(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let include_performance = schema::opt_bool(params, "includePerformance", false)?;
    let include_network = schema::opt_bool(params, "includeNetworkInfo", false)?;
    let include_details = schema::opt_bool(params, "includeDetails", false)?;

    let core = ctx.adapter.query_core_status().await?;
    let mut out = json!({
        "platform": core.get("Platform").cloned().unwrap_or(Value::Null),
        "state": core.get("State").cloned().unwrap_or(Value::Null),
        "designName": core.get("DesignName").cloned().unwrap_or(Value::Null),
        "designCode": core.get("DesignCode").cloned().unwrap_or(Value::Null),
        "isRedundant": core.get("IsRedundant").cloned().unwrap_or(Value::Bool(false)),
        "isEmulator": core.get("IsEmulator").cloned().unwrap_or(Value::Bool(false)),
        "status": core.get("Status").cloned().unwrap_or(Value::Null),
    });

    if include_performance {
        out["performance"] = json!({
            "lastCommandLatencyMs": ctx.adapter.last_command_latency_ms(),
            "uptimeSecs": ctx.started_at.elapsed().as_secs(),
        });
    }
    if include_network {
        out["network"] = json!({
            "host": ctx.config.connection.host,
            "port": ctx.config.connection.port,
        });
    }
    if include_details {
        let link = ctx.adapter.client().status();
        out["connection"] = json!({
            "state": link.state.label(),
            "attempts": link.attempts,
            "lastSuccessMs": link.last_success_ms,
            "lastDisconnectReason": link.last_disconnect_reason,
            "breaker": ctx.adapter.client_mut().breaker_state().label(),
        });
    }
    Ok(out)
}
