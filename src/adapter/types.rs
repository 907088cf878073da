//! Data model shared by the adapter, change-group engine, and recorder.
//!
//! Control values are a small tagged union; comparisons are structural
//! (exact numeric equality for numbers, strict equality for booleans and
//! strings) so poll diffing never reports a spurious change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of a control: number, boolean, or string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    /// Boolean control (mute, trigger state, ...).
    Bool(bool),
    /// Numeric control (gain, level, position, ...).
    Number(f64),
    /// String control (text labels, combo selections, ...).
    Text(String),
}

impl ControlValue {
    /// Convert a JSON value into a control value.
    ///
    /// Integers widen to `f64`; anything non-scalar is rendered as text,
    /// matching how the core serializes unusual control payloads.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    /// Render back to JSON for tool responses and persistence.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Numeric view, if this is a number.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Direction of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlDirection {
    /// Observable only.
    Read,
    /// Observable and settable.
    ReadWrite,
}

/// Immutable snapshot of a core component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Unique component name within the running design.
    pub name: String,
    /// Type tag ("gain", "mixer", "router", ...).
    #[serde(rename = "type")]
    pub component_type: String,
    /// Opaque property map advertised by the core.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Typed leaf of a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlInfo {
    /// Control name local to the component (may itself contain dots).
    pub name: String,
    /// Owning component name.
    pub component: String,
    /// Type tag ("gain", "mute", "text", ...).
    #[serde(rename = "type")]
    pub control_type: String,
    /// Read or read-write.
    pub direction: ControlDirection,
    /// Current value.
    pub value: ControlValue,
    /// Formatted string rendering.
    pub string: String,
    /// Lower numeric bound, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_min: Option<f64>,
    /// Upper numeric bound, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_max: Option<f64>,
    /// Normalized position in [0, 1], when bounds are known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

impl ControlInfo {
    /// Fully-qualified `Component.control` path.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}.{}", self.component, self.name)
    }
}

/// Split a fully-qualified control path at the first dot.
///
/// Control names may contain further dots (`Mixer.out1.gain` is component
/// `Mixer`, control `out1.gain`), so only the first dot is structural.
#[must_use]
pub fn split_control_path(path: &str) -> Option<(&str, &str)> {
    let (component, control) = path.split_once('.')?;
    if component.is_empty() || control.is_empty() {
        return None;
    }
    Some((component, control))
}

/// Normalized position of `value` within [min, max].
#[must_use]
pub fn position_of(value: f64, min: Option<f64>, max: Option<f64>) -> Option<f64> {
    let (min, max) = (min?, max?);
    if max <= min {
        return None;
    }
    Some(((value - min) / (max - min)).clamp(0.0, 1.0))
}

/// Recompute a control's formatted string from its value and type.
///
/// Gain-like controls carry a dB suffix; everything else falls back to a
/// plain rendering. Integral numbers drop the trailing `.0` so a value
/// of -20 formats as "-20dB", matching the core's own renderer.
#[must_use]
pub fn format_value(control_type: &str, value: &ControlValue) -> String {
    match value {
        ControlValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        ControlValue::Text(s) => s.clone(),
        ControlValue::Number(n) => {
            let rendered = if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{n:.1}")
            };
            if control_type.contains("gain") || control_type.contains("level") {
                format!("{rendered}dB")
            } else {
                rendered
            }
        }
    }
}
