//! Discovery tools: component and control enumeration, bulk reads.

use serde_json::{json, Value};

use crate::error::BrokerResult;
use crate::mcp::schema;

use super::ToolContext;

/// `list_components` — components of the running design.
pub async fn list_components(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let filter = schema::opt_regex(params, "filter")?;
    let include_properties = schema::opt_bool(params, "includeProperties", false)?;
    let components = ctx
        .adapter
        .list_components(filter.as_ref(), include_properties)
        .await?;
    Ok(json!(components))
}

/// `list_controls` — controls of one component (or `"*"` for all).
pub async fn list_controls(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let component = schema::require_str(params, "component")?;
    let control_type = schema::opt_str(params, "controlType")?;
    let include_metadata = schema::opt_bool(params, "includeMetadata", false)?;
    let controls = ctx
        .adapter
        .list_controls(&component, control_type.as_deref(), include_metadata)
        .await?;
    Ok(json!(controls))
}

/// `qsys_component_get` — bulk-read named controls of one component.
pub async fn component_get(ctx: &mut ToolContext<'_>, params: &Value) -> BrokerResult<Value> {
    let component = schema::require_str(params, "component")?;
    let controls = schema::opt_str_array(params, "controls", None)?;
    let result = ctx
        .adapter
        .component_get(&component, controls.as_deref())
        .await?;
    Ok(json!({ "component": component, "result": result }))
}
