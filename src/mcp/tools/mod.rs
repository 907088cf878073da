//! The fixed tool catalogue.
//!
//! One descriptor per tool (id, description, parameter schema) plus the
//! central `dispatch()` routing. Handlers live in sibling modules grouped
//! by concern and are free functions taking a [`ToolContext`] — the Hub
//! never reaches around the catalogue to call them directly.

mod changegroup;
mod connection;
mod control;
mod discovery;
mod events;
mod misc;
mod status;

use std::time::Instant;

use serde_json::{json, Value};

use crate::adapter::QsysAdapter;
use crate::config::Config;
use crate::core::ConnectionHistory;
use crate::error::{BrokerError, BrokerResult};
use crate::events::EventRecorder;
use crate::mcp::audit::AuditRecord;

/// Everything a tool handler may touch.
pub struct ToolContext<'a> {
    /// The command adapter (and through it, the core client and engine).
    pub adapter: &'a mut QsysAdapter,
    /// The event recorder.
    pub recorder: &'a mut EventRecorder,
    /// Connection transition history.
    pub history: &'a mut ConnectionHistory,
    /// Broker configuration.
    pub config: &'a Config,
    /// Read-only snapshot of recent audit records, taken at dispatch.
    pub audit: Vec<AuditRecord>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// One registered tool.
pub struct ToolDescriptor {
    /// Stable tool id (part of the public interface).
    pub id: &'static str,
    /// Human description shown in `tools/list`.
    pub description: &'static str,
    /// JSON Schema for the parameters.
    pub input_schema: Value,
}

/// Build the full catalogue, in the order tools are listed to agents.
#[must_use]
pub fn catalog() -> Vec<ToolDescriptor> {
    let names_schema = json!({
        "type": "array", "items": { "type": "string" }, "maxItems": 100
    });
    vec![
        ToolDescriptor {
            id: "list_components",
            description: "List components in the core's running design, \
                          optionally filtered by a name regex.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "filter": { "type": "string", "description": "Regex matched against component names" },
                    "includeProperties": { "type": "boolean" }
                }
            }),
        },
        ToolDescriptor {
            id: "list_controls",
            description: "List controls of one component ('*' for every \
                          component), optionally filtered by control type.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "component": { "type": "string" },
                    "controlType": {
                        "type": "string",
                        "enum": ["gain", "mute", "meter", "text", "trigger", "unknown", "all"]
                    },
                    "includeMetadata": { "type": "boolean" }
                },
                "required": ["component"]
            }),
        },
        ToolDescriptor {
            id: "get_control_values",
            description: "Read current values for up to 100 named controls.",
            input_schema: json!({
                "type": "object",
                "properties": { "controlNames": names_schema.clone() },
                "required": ["controlNames"]
            }),
        },
        ToolDescriptor {
            id: "set_control_values",
            description: "Write control values (up to 100 entries, per-entry \
                          atomicity). Ramp/fade fields are accepted but ignored.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "controls": {
                        "type": "array",
                        "maxItems": 100,
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "value": {},
                                "validate": { "type": "boolean" }
                            },
                            "required": ["name", "value"]
                        }
                    }
                },
                "required": ["controls"]
            }),
        },
        ToolDescriptor {
            id: "qsys_component_get",
            description: "Bulk-read controls of one component.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "component": { "type": "string" },
                    "controls": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["component"]
            }),
        },
        ToolDescriptor {
            id: "query_core_status",
            description: "Query core status: platform, design, redundancy \
                          and emulator flags.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "includePerformance": { "type": "boolean" },
                    "includeNetworkInfo": { "type": "boolean" },
                    "includeDetails": { "type": "boolean" }
                }
            }),
        },
        ToolDescriptor {
            id: "create_change_group",
            description: "Create a named change group, optionally enabling \
                          auto-poll at a rate in seconds.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "groupId": { "type": "string" },
                    "pollRate": { "type": "number", "minimum": 0.05 }
                },
                "required": ["groupId"]
            }),
        },
        ToolDescriptor {
            id: "add_controls_to_change_group",
            description: "Add fully-qualified controls to a change group.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "groupId": { "type": "string" },
                    "controlNames": names_schema.clone()
                },
                "required": ["groupId", "controlNames"]
            }),
        },
        ToolDescriptor {
            id: "poll_change_group",
            description: "Poll a change group for value changes since the \
                          last poll.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "groupId": { "type": "string" },
                    "showAll": { "type": "boolean" }
                },
                "required": ["groupId"]
            }),
        },
        ToolDescriptor {
            id: "remove_controls_from_change_group",
            description: "Remove controls from a change group.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "groupId": { "type": "string" },
                    "controlNames": names_schema
                },
                "required": ["groupId", "controlNames"]
            }),
        },
        ToolDescriptor {
            id: "clear_change_group",
            description: "Remove every control from a change group, keeping \
                          the group itself.",
            input_schema: json!({
                "type": "object",
                "properties": { "groupId": { "type": "string" } },
                "required": ["groupId"]
            }),
        },
        ToolDescriptor {
            id: "destroy_change_group",
            description: "Destroy a change group and cancel its auto-poll \
                          timer.",
            input_schema: json!({
                "type": "object",
                "properties": { "groupId": { "type": "string" } },
                "required": ["groupId"]
            }),
        },
        ToolDescriptor {
            id: "list_change_groups",
            description: "List change groups with state, size, and poll rate.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDescriptor {
            id: "query_change_events",
            description: "Query recorded change events by time range, group, \
                          control, or component.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "startTime": { "type": "integer", "description": "Unix ms, inclusive" },
                    "endTime": { "type": "integer", "description": "Unix ms, inclusive" },
                    "groupId": { "type": "string" },
                    "controlNames": { "type": "array", "items": { "type": "string" } },
                    "componentNames": { "type": "array", "items": { "type": "string" } },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 10000 },
                    "offset": { "type": "integer", "minimum": 0 }
                }
            }),
        },
        ToolDescriptor {
            id: "get_event_statistics",
            description: "Event store statistics: totals, time span, disk \
                          usage, buffer state.",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDescriptor {
            id: "manage_connection",
            description: "Manage the core link: status, connect, disconnect, \
                          reconnect, diagnose, test, configure, history, \
                          monitor, reset.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["status", "connect", "disconnect", "reconnect",
                                 "diagnose", "test", "configure", "history",
                                 "monitor", "reset"]
                    },
                    "timeoutMs": { "type": "integer", "minimum": 100, "maximum": 30000 }
                },
                "required": ["action"]
            }),
        },
        ToolDescriptor {
            id: "get_api_documentation",
            description: "Documentation for the broker's tools, core methods, \
                          and error codes.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query_type": {
                        "type": "string",
                        "enum": ["tools", "methods", "errors", "examples"]
                    },
                    "search": { "type": "string" }
                },
                "required": ["query_type"]
            }),
        },
        ToolDescriptor {
            id: "echo",
            description: "Echo a message back (connectivity check; callable \
                          anonymously).",
            input_schema: json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }),
        },
    ]
}

/// Route one validated-by-id call to its handler.
///
/// This is the tagged handler table: the ids come from [`catalog`], the
/// dispatcher has already authenticated and rate-limited the caller,
/// and each arm validates its own parameters.
pub async fn dispatch(
    ctx: &mut ToolContext<'_>,
    tool: &str,
    params: &Value,
) -> BrokerResult<Value> {
    match tool {
        "list_components" => discovery::list_components(ctx, params).await,
        "list_controls" => discovery::list_controls(ctx, params).await,
        "qsys_component_get" => discovery::component_get(ctx, params).await,
        "get_control_values" => control::get_control_values(ctx, params).await,
        "set_control_values" => control::set_control_values(ctx, params).await,
        "query_core_status" => status::query_core_status(ctx, params).await,
        "create_change_group" => changegroup::create(ctx, params),
        "add_controls_to_change_group" => changegroup::add_controls(ctx, params),
        "poll_change_group" => changegroup::poll(ctx, params).await,
        "remove_controls_from_change_group" => changegroup::remove_controls(ctx, params),
        "clear_change_group" => changegroup::clear(ctx, params),
        "destroy_change_group" => changegroup::destroy(ctx, params),
        "list_change_groups" => changegroup::list(ctx),
        "query_change_events" => events::query_change_events(ctx, params),
        "get_event_statistics" => events::get_event_statistics(ctx),
        "manage_connection" => connection::manage_connection(ctx, params).await,
        "get_api_documentation" => misc::get_api_documentation(params),
        "echo" => misc::echo(params),
        other => Err(BrokerError::UnknownMethod(other.to_string())),
    }
}
