//! Change-group tools.

use serde_json::{json, Value};

use crate::constants;
use crate::error::BrokerResult;
use crate::mcp::schema;

use super::ToolContext;

/// `create_change_group` — create, optionally with auto-poll.
pub fn create(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let group_id = schema::require_str(params, "groupId")?;
    let poll_rate = schema::opt_f64(params, "pollRate")?;
    ctx.adapter.create_change_group(&group_id)?;
    if let Some(rate) = poll_rate {
        // A bad rate must not leave a half-created group behind.
        if let Err(e) = ctx.adapter.engine_mut().set_auto_poll(&group_id, rate) {
            let _ = ctx.adapter.engine_mut().destroy(&group_id);
            return Err(e);
        }
    }
    Ok(json!({ "ok": true, "groupId": group_id, "pollRate": poll_rate }))
}

/// `add_controls_to_change_group`.
pub fn add_controls(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let group_id = schema::require_str(params, "groupId")?;
    let names = schema::require_str_array(
        params,
        "controlNames",
        Some(constants::MAX_BATCH_CONTROLS),
    )?;
    let added = ctx.adapter.add_controls_to_group(&group_id, &names)?;
    Ok(json!({ "groupId": group_id, "added": added }))
}

/// `poll_change_group`.
pub async fn poll(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let group_id = schema::require_str(params, "groupId")?;
    let show_all = schema::opt_bool(params, "showAll", false)?;
    let event = ctx.adapter.poll_change_group(&group_id, show_all).await?;
    Ok(json!({
        "groupId": event.group_id,
        "sequence": event.sequence,
        "timestampMs": event.timestamp_ms,
        "changes": event.changes,
    }))
}

/// `remove_controls_from_change_group`.
pub fn remove_controls(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let group_id = schema::require_str(params, "groupId")?;
    let names = schema::require_str_array(
        params,
        "controlNames",
        Some(constants::MAX_BATCH_CONTROLS),
    )?;
    let removed = ctx
        .adapter
        .engine_mut()
        .remove_controls(&group_id, &names)?;
    Ok(json!({ "groupId": group_id, "removed": removed }))
}

/// `clear_change_group` — empty the group, keep it.
pub fn clear(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let group_id = schema::require_str(params, "groupId")?;
    ctx.adapter.engine_mut().clear(&group_id)?;
    Ok(json!({ "groupId": group_id, "cleared": true }))
}

/// `destroy_change_group` — terminal.
pub fn destroy(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let group_id = schema::require_str(params, "groupId")?;
    ctx.adapter.engine_mut().destroy(&group_id)?;
    Ok(json!({ "groupId": group_id, "destroyed": true }))
}

/// `list_change_groups`.
pub fn list(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    let groups = ctx.adapter.list_change_groups();
    let count = groups.len();
    Ok(json!({ "groups": groups, "count": count }))
}
