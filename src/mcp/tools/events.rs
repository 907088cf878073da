//! Event-history tools over the recorder.

use serde_json::{json, Value};

use crate::error::BrokerResult;
use crate::events::EventQuery;
use crate::mcp::schema;

use super::ToolContext;

/// `query_change_events` — filtered history query.
///
/// The recorder flushes its buffer first, so every event accepted before
/// this call is visible in the result.
pub fn query_change_events(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let query = EventQuery {
        start_ms: schema::opt_i64(params, "startTime")?,
        end_ms: schema::opt_i64(params, "endTime")?,
        group_id: schema::opt_str(params, "groupId")?,
        control_names: schema::opt_str_array(params, "controlNames", None)?.unwrap_or_default(),
        component_names: schema::opt_str_array(params, "componentNames", None)?
            .unwrap_or_default(),
        limit: schema::opt_u64(params, "limit")?.unwrap_or(1000) as usize,
        offset: schema::opt_u64(params, "offset")?.unwrap_or(0) as usize,
    };
    let (events, truncated) = ctx.recorder.query(&query)?;
    let count = events.len();
    Ok(json!({
        "events": events,
        "count": count,
        "truncated": truncated,
    }))
}

/// `get_event_statistics`.
pub fn get_event_statistics(ctx: &mut ToolContext<'_>) -> BrokerResult<Value> {
    let stats = ctx.recorder.statistics()?;
    serde_json::to_value(&stats)
        .map_err(|e| crate::error::BrokerError::internal(format!("serialize statistics: {e}")))
}
