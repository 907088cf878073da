//! Connection-management tool.
//!
//! `manage_connection` multiplexes link operations behind one tool id so
//! agents have a single place to look when the core is misbehaving.

use serde_json::{json, Value};

use crate::error::{BrokerError, BrokerResult};
use crate::mcp::schema;

use super::ToolContext;

/// `manage_connection` — action-routed link management.
pub async fn manage_connection(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let action = schema::require_str(params, "action")?;
    match action.as_str() {
        "status" => status(ctx),
        "connect" => connect(ctx).await,
        "disconnect" => disconnect(ctx),
        "reconnect" => reconnect(ctx),
        "diagnose" => diagnose(ctx).await,
        "test" => test(ctx).await,
        "configure" => configure(ctx, params),
        "history" => history(ctx),
        "monitor" => monitor(ctx),
        "reset" => reset(ctx),
        other => Err(BrokerError::Validation {
            field: "action".to_string(),
            reason: format!("unknown action '{other}'"),
        }),
    }
}

fn status(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    let link = ctx.adapter.client().status();
    Ok(json!({
        "state": link.state.label(),
        "attempts": link.attempts,
        "lastSuccessMs": link.last_success_ms,
        "lastDisconnectReason": link.last_disconnect_reason,
        "breaker": ctx.adapter.client_mut().breaker_state().label(),
        "breakerOpenedCount": ctx.adapter.client().breaker_opened_count(),
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
    }))
}

async fn connect(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    ctx.adapter.client_mut().connect().await?;
    ctx.history.push("connected", Some("manage_connection connect".to_string()));
    Ok(json!({ "ok": true, "state": "connected" }))
}

fn disconnect(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    ctx.adapter.client_mut().disconnect();
    ctx.history
        .push("shutting-down", Some("manage_connection disconnect".to_string()));
    Ok(json!({ "ok": true, "state": "disconnected" }))
}

fn reconnect(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    ctx.adapter.client().force_reconnect()?;
    Ok(json!({ "ok": true, "state": "reconnecting" }))
}

/// Probe the link and summarize everything relevant to a stuck agent.
async fn diagnose(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    let link = ctx.adapter.client().status();
    let noop = ctx.adapter.send_command("NoOp", json!({})).await;
    let status = match noop {
        Ok(_) => json!({ "ok": true, "latencyMs": ctx.adapter.last_command_latency_ms() }),
        Err(ref e) => json!({ "ok": false, "error": e.to_string(), "kind": e.kind() }),
    };
    Ok(json!({
        "link": {
            "state": link.state.label(),
            "attempts": link.attempts,
            "lastDisconnectReason": link.last_disconnect_reason,
        },
        "probe": status,
        "breaker": ctx.adapter.client_mut().breaker_state().label(),
        "recorderEnabled": ctx.recorder.is_enabled(),
    }))
}

/// Round-trip a NoOp and report its latency.
async fn test(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    ctx.adapter.send_command("NoOp", json!({})).await?;
    Ok(json!({
        "ok": true,
        "latencyMs": ctx.adapter.last_command_latency_ms(),
    }))
}

/// Runtime-adjust the command timeout (bounded by the hard max).
fn configure(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let timeout_ms = schema::opt_u64(params, "timeoutMs")?;
    match timeout_ms {
        Some(ms) if ms >= 100 => {
            let applied = ctx.adapter.client_mut().set_command_timeout_ms(ms);
            Ok(json!({ "ok": true, "timeoutMs": applied }))
        }
        Some(ms) => Err(BrokerError::Validation {
            field: "timeoutMs".to_string(),
            reason: format!("must be >= 100, got {ms}"),
        }),
        None => Err(BrokerError::Validation {
            field: "timeoutMs".to_string(),
            reason: "configure requires timeoutMs".to_string(),
        }),
    }
}

fn history(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    let entries = ctx.history.entries();
    let count = entries.len();
    Ok(json!({ "transitions": entries, "count": count }))
}

/// Monitoring summary: which groups feed the recorder, how it is
/// coping, and the recent audit trail.
fn monitor(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    let stats = ctx.recorder.statistics()?;
    Ok(json!({
        "monitoredGroups": ctx.recorder.monitored_groups(),
        "recorder": stats,
        "recentCalls": ctx.audit,
    }))
}

/// Clear breaker state and attempt counters.
fn reset(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    ctx.adapter.client_mut().reset_breaker();
    ctx.history.push("reset", Some("manage_connection reset".to_string()));
    Ok(json!({ "ok": true, "breaker": "closed" }))
}
