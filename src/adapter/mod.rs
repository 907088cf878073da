//! Command adapter: the single dispatch surface between tools and the core.
//!
//! Owns the discovery cache (components + control metadata), the control
//! index (fully-qualified name → descriptor + last known value), and the
//! change-group engine. Every tool funnels through [`QsysAdapter::send_command`]
//! or one of the typed wrappers built on it.
//!
//! # Caching discipline
//!
//! The discovery cache is authoritative for one session only: it is built
//! lazily on first use after connect, refreshed on an explicit discovery
//! call, and fully rebuilt on every reconnect before queued tool calls
//! are allowed to complete. The control index is updated on poll, set,
//! and core update notifications.

pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde_json::{json, Value};

use crate::changegroup::{ChangeGroupEngine, ChangesEvent, EventSource, GroupSummary};
use crate::constants;
use crate::core::{protocol, CoreClient};
use crate::error::{BrokerError, BrokerResult};
use types::{
    format_value, position_of, split_control_path, ComponentInfo, ControlDirection, ControlInfo,
    ControlValue,
};

/// Control index entry: descriptor plus freshness.
#[derive(Debug, Clone)]
pub struct IndexedControl {
    /// Descriptor with the last known value.
    pub info: ControlInfo,
    /// Unix-ms of the last observation.
    pub updated_ms: i64,
}

/// Per-entry outcome of a batch set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SetOutcome {
    /// Fully-qualified control path.
    pub name: String,
    /// True when the core accepted the write.
    pub ok: bool,
    /// Error description for failed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Value actually applied after range clamping, when it differs
    /// from the requested one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clamped_to: Option<f64>,
    /// Ramp/fade fields that were accepted but ignored.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignored: Vec<String>,
}

/// Per-entry outcome of a batch get.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GetOutcome {
    /// Fully-qualified control path.
    pub name: String,
    /// Current value, absent on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ControlValue>,
    /// Formatted string rendering, absent on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    /// Unix-ms of the observation.
    #[serde(rename = "timestampMs", skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
    /// Error description for failed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The adapter: discovery cache + control index + change-group registry.
pub struct QsysAdapter {
    client: CoreClient,
    engine: ChangeGroupEngine,
    components: BTreeMap<String, ComponentInfo>,
    /// Component name → local control names, discovery order.
    component_controls: BTreeMap<String, Vec<String>>,
    /// Fully-qualified path → descriptor.
    index: HashMap<String, IndexedControl>,
    cache_built: bool,
    /// Latency of the most recent successful core command.
    last_command_latency_ms: Option<u64>,
}

impl QsysAdapter {
    /// Build an adapter over an already-constructed client and engine.
    #[must_use]
    pub fn new(client: CoreClient, engine: ChangeGroupEngine) -> Self {
        Self {
            client,
            engine,
            components: BTreeMap::new(),
            component_controls: BTreeMap::new(),
            index: HashMap::new(),
            cache_built: false,
            last_command_latency_ms: None,
        }
    }

    /// Core client handle (connection management tools go through this).
    pub fn client_mut(&mut self) -> &mut CoreClient {
        &mut self.client
    }

    /// Core client handle, read-only.
    #[must_use]
    pub fn client(&self) -> &CoreClient {
        &self.client
    }

    /// Change-group engine (the broker loop feeds auto-poll outcomes back).
    pub fn engine_mut(&mut self) -> &mut ChangeGroupEngine {
        &mut self.engine
    }

    /// Latency of the most recent successful core command, if any.
    #[must_use]
    pub fn last_command_latency_ms(&self) -> Option<u64> {
        self.last_command_latency_ms
    }

    // ── Single dispatch surface ─────────────────────────────────────────

    /// Issue a command by QRC method name.
    ///
    /// Change-group methods are served broker-side by the engine; the
    /// rest of the catalogue is forwarded to the core. Unknown methods
    /// are rejected before they reach the wire.
    pub async fn send_command(&mut self, method: &str, params: Value) -> BrokerResult<Value> {
        if !protocol::is_known_method(method) {
            return Err(BrokerError::UnknownMethod(method.to_string()));
        }
        if protocol::is_change_group_method(method) {
            return self.change_group_command(method, params).await;
        }
        let started = Instant::now();
        let result = self.client.send_command(method, params).await?;
        self.last_command_latency_ms = Some(started.elapsed().as_millis() as u64);
        Ok(result)
    }

    /// Route a `ChangeGroup.*` method to the engine.
    async fn change_group_command(&mut self, method: &str, params: Value) -> BrokerResult<Value> {
        let id = params
            .get("Id")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Validation {
                field: "Id".to_string(),
                reason: "change-group commands require a string Id".to_string(),
            })?
            .to_string();

        match method {
            "ChangeGroup.AddControl" => {
                let names = string_array(&params, "Controls")?;
                if !self.engine.exists(&id) {
                    self.engine.create(&id)?;
                }
                let added = self.add_controls_to_group(&id, &names)?;
                Ok(json!({ "Id": id, "Added": added }))
            }
            "ChangeGroup.AddComponentControl" => {
                let component = params
                    .pointer("/Component/Name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BrokerError::Validation {
                        field: "Component.Name".to_string(),
                        reason: "expected string".to_string(),
                    })?;
                let controls = params
                    .pointer("/Component/Controls")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|c| c.get("Name").and_then(Value::as_str))
                            .map(|c| format!("{component}.{c}"))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if !self.engine.exists(&id) {
                    self.engine.create(&id)?;
                }
                let added = self.add_controls_to_group(&id, &controls)?;
                Ok(json!({ "Id": id, "Added": added }))
            }
            "ChangeGroup.Remove" => {
                let names = string_array(&params, "Controls")?;
                let removed = self.engine.remove_controls(&id, &names)?;
                Ok(json!({ "Id": id, "Removed": removed }))
            }
            "ChangeGroup.Poll" => {
                let event = self.poll_change_group(&id, false).await?;
                Ok(serde_json::to_value(&event)
                    .map_err(|e| BrokerError::internal(format!("serialize poll result: {e}")))?)
            }
            "ChangeGroup.Clear" => {
                self.engine.clear(&id)?;
                Ok(json!({ "Id": id }))
            }
            "ChangeGroup.Destroy" => {
                self.engine.destroy(&id)?;
                Ok(json!({ "Id": id }))
            }
            "ChangeGroup.Invalidate" => {
                self.engine.invalidate(&id)?;
                Ok(json!({ "Id": id }))
            }
            "ChangeGroup.AutoPoll" => {
                let rate = params
                    .get("Rate")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| BrokerError::Validation {
                        field: "Rate".to_string(),
                        reason: "expected number of seconds".to_string(),
                    })?;
                self.engine.set_auto_poll(&id, rate)?;
                Ok(json!({ "Id": id, "Rate": rate }))
            }
            other => Err(BrokerError::UnknownMethod(other.to_string())),
        }
    }

    // ── Discovery ───────────────────────────────────────────────────────

    /// Build the discovery cache if it has not been built this session.
    pub async fn ensure_cache(&mut self) -> BrokerResult<()> {
        if self.cache_built {
            return Ok(());
        }
        self.rebuild_discovery().await.map(|_| ())
    }

    /// Discard and rebuild the discovery cache from the core.
    ///
    /// Returns the number of components discovered. Per-component
    /// control enumeration failures are logged and skipped rather than
    /// failing the whole rebuild.
    pub async fn rebuild_discovery(&mut self) -> BrokerResult<usize> {
        let result = self
            .send_command("Component.GetComponents", json!({}))
            .await?;
        let raw_components = result
            .as_array()
            .cloned()
            .or_else(|| result.get("Components").and_then(Value::as_array).cloned())
            .unwrap_or_default();

        let mut components = BTreeMap::new();
        let mut component_controls = BTreeMap::new();
        let mut index = HashMap::new();

        for raw in &raw_components {
            let Some(component) = parse_component(raw) else {
                log::warn!("skipping malformed component descriptor: {raw}");
                continue;
            };
            let name = component.name.clone();
            components.insert(name.clone(), component);

            let controls = match self
                .client
                .send_command("Component.GetControls", json!({ "Name": name }))
                .await
            {
                Ok(value) => value
                    .get("Controls")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Err(e) => {
                    log::warn!("control enumeration failed for '{name}': {e}");
                    Vec::new()
                }
            };

            let mut local = Vec::new();
            for raw_control in &controls {
                if let Some(info) = parse_control(&name, raw_control) {
                    local.push(info.name.clone());
                    index.insert(
                        info.path(),
                        IndexedControl {
                            info,
                            updated_ms: now_ms(),
                        },
                    );
                }
            }
            component_controls.insert(name, local);
        }

        let count = components.len();
        self.components = components;
        self.component_controls = component_controls;
        self.index = index;
        self.cache_built = true;
        log::info!(
            "discovery cache built: {count} components, {} controls",
            self.index.len()
        );
        Ok(count)
    }

    /// Invalidate session-scoped state after a reconnect, then rebuild.
    ///
    /// Change-group baselines are discarded so every group's next poll
    /// reports all of its controls against the fresh design.
    pub async fn on_reconnected(&mut self) -> BrokerResult<usize> {
        self.cache_built = false;
        self.engine.invalidate_all();
        self.rebuild_discovery().await
    }

    /// Components matching an optional regex filter.
    pub async fn list_components(
        &mut self,
        filter: Option<&regex::Regex>,
        include_properties: bool,
    ) -> BrokerResult<Vec<Value>> {
        self.ensure_cache().await?;
        Ok(self
            .components
            .values()
            .filter(|c| filter.is_none_or(|re| re.is_match(&c.name)))
            .map(|c| {
                let mut obj = json!({ "name": c.name, "type": c.component_type });
                if include_properties {
                    obj["properties"] = json!(c.properties);
                }
                obj
            })
            .collect())
    }

    /// Controls of one component (`"*"` means every component), with an
    /// optional type filter.
    pub async fn list_controls(
        &mut self,
        component: &str,
        control_type: Option<&str>,
        include_metadata: bool,
    ) -> BrokerResult<Vec<Value>> {
        self.ensure_cache().await?;

        let components: Vec<String> = if component == "*" {
            self.components.keys().cloned().collect()
        } else {
            if !self.components.contains_key(component) {
                return Err(BrokerError::UnknownComponent(component.to_string()));
            }
            vec![component.to_string()]
        };

        let mut out = Vec::new();
        for name in components {
            let Some(locals) = self.component_controls.get(&name) else {
                continue;
            };
            for local in locals {
                let path = format!("{name}.{local}");
                let Some(entry) = self.index.get(&path) else {
                    continue;
                };
                let info = &entry.info;
                if let Some(wanted) = control_type {
                    if wanted != "all" && info.control_type != wanted {
                        continue;
                    }
                }
                let mut obj = json!({
                    "name": path,
                    "component": info.component,
                    "type": info.control_type,
                    "value": info.value,
                    "string": info.string,
                });
                if include_metadata {
                    obj["direction"] = json!(info.direction);
                    obj["valueMin"] = json!(info.value_min);
                    obj["valueMax"] = json!(info.value_max);
                    obj["position"] = json!(info.position);
                    obj["updatedMs"] = json!(entry.updated_ms);
                }
                out.push(obj);
            }
        }
        Ok(out)
    }

    // ── Control get/set ─────────────────────────────────────────────────

    /// Read current values for a batch of controls (≤ 100 names).
    pub async fn get_control_values(&mut self, names: &[String]) -> BrokerResult<Vec<GetOutcome>> {
        if names.len() > constants::MAX_BATCH_CONTROLS {
            return Err(BrokerError::Validation {
                field: "controlNames".to_string(),
                reason: format!(
                    "at most {} names per call, got {}",
                    constants::MAX_BATCH_CONTROLS,
                    names.len()
                ),
            });
        }
        self.ensure_cache().await?;

        let readings = self.fetch_readings(names).await?;
        let by_path: HashMap<&str, (&ControlValue, &str)> = readings
            .iter()
            .map(|(path, value, string)| (path.as_str(), (value, string.as_str())))
            .collect();

        Ok(names
            .iter()
            .map(|name| match by_path.get(name.as_str()) {
                Some((value, string)) => GetOutcome {
                    name: name.clone(),
                    value: Some((*value).clone()),
                    string: Some((*string).to_string()),
                    timestamp_ms: Some(now_ms()),
                    error: None,
                },
                None => GetOutcome {
                    name: name.clone(),
                    value: None,
                    string: None,
                    timestamp_ms: None,
                    error: Some("unknown control".to_string()),
                },
            })
            .collect())
    }

    /// Write a batch of control values. Atomicity is per-entry: a failed
    /// entry never aborts its neighbors.
    ///
    /// With `validate`, numeric values are clamped into the control's
    /// known bounds and the applied value is reported back.
    pub async fn set_control_values(
        &mut self,
        entries: &[SetRequest],
    ) -> BrokerResult<Vec<SetOutcome>> {
        if entries.len() > constants::MAX_BATCH_CONTROLS {
            return Err(BrokerError::Validation {
                field: "controls".to_string(),
                reason: format!(
                    "at most {} entries per call, got {}",
                    constants::MAX_BATCH_CONTROLS,
                    entries.len()
                ),
            });
        }
        self.ensure_cache().await?;

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            outcomes.push(self.set_one(entry).await);
        }
        Ok(outcomes)
    }

    async fn set_one(&mut self, entry: &SetRequest) -> SetOutcome {
        let mut outcome = SetOutcome {
            name: entry.name.clone(),
            ok: false,
            error: None,
            clamped_to: None,
            ignored: entry.ignored_fields.clone(),
        };

        if split_control_path(&entry.name).is_none() {
            outcome.error = Some("not a Component.control path".to_string());
            return outcome;
        }
        let Some(indexed) = self.index.get(&entry.name) else {
            outcome.error = Some("unknown control".to_string());
            return outcome;
        };
        if indexed.info.direction == ControlDirection::Read {
            outcome.error = Some("control is read-only".to_string());
            return outcome;
        }

        let mut value = entry.value.clone();
        if entry.validate {
            if let ControlValue::Number(n) = value {
                let min = indexed.info.value_min;
                let max = indexed.info.value_max;
                let clamped = n.clamp(
                    min.unwrap_or(f64::NEG_INFINITY),
                    max.unwrap_or(f64::INFINITY),
                );
                if clamped != n {
                    outcome.clamped_to = Some(clamped);
                    value = ControlValue::Number(clamped);
                }
            }
        }

        let result = self
            .send_command(
                "Control.Set",
                json!({ "Name": entry.name, "Value": value.to_json() }),
            )
            .await;

        match result {
            Ok(_) => {
                outcome.ok = true;
                let control_type = self
                    .index
                    .get(&entry.name)
                    .map(|e| e.info.control_type.clone())
                    .unwrap_or_default();
                let string = format_value(&control_type, &value);
                self.update_index(&entry.name, &value, &string);
                // Notify subscribed groups that already hold a baseline
                // for this control, so the write is recorded at once.
                self.engine.note_set(&entry.name, &value, &string);
            }
            Err(e) => {
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    /// `Component.Get` for one component, optionally narrowed to named
    /// controls.
    pub async fn component_get(
        &mut self,
        component: &str,
        controls: Option<&[String]>,
    ) -> BrokerResult<Value> {
        self.ensure_cache().await?;
        if !self.components.contains_key(component) {
            return Err(BrokerError::UnknownComponent(component.to_string()));
        }
        let names: Vec<String> = match controls {
            Some(names) => names.to_vec(),
            None => self
                .component_controls
                .get(component)
                .cloned()
                .unwrap_or_default(),
        };
        let params = json!({
            "Name": component,
            "Controls": names.iter().map(|n| json!({ "Name": n })).collect::<Vec<_>>(),
        });
        let result = self.send_command("Component.Get", params).await?;

        // Fold the readings back into the index.
        if let Some(entries) = result.get("Controls").and_then(Value::as_array) {
            for raw in entries {
                if let Some(local) = raw.get("Name").and_then(Value::as_str) {
                    let path = format!("{component}.{local}");
                    if let Some(raw_value) = raw.get("Value") {
                        let value = ControlValue::from_json(raw_value);
                        let string = raw
                            .get("String")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| {
                                let control_type = self
                                    .index
                                    .get(&path)
                                    .map(|e| e.info.control_type.clone())
                                    .unwrap_or_default();
                                format_value(&control_type, &value)
                            });
                        self.update_index(&path, &value, &string);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Query core status (`StatusGet`).
    pub async fn query_core_status(&mut self) -> BrokerResult<Value> {
        self.send_command("StatusGet", json!({})).await
    }

    // ── Change groups (typed surface for the tools) ─────────────────────

    /// Create a change group.
    pub fn create_change_group(&mut self, id: &str) -> BrokerResult<()> {
        self.engine.create(id)
    }

    /// Add fully-qualified controls to a group.
    ///
    /// Names unknown to the index are accepted with a warning — the
    /// first poll will surface their current value if the core knows
    /// them.
    pub fn add_controls_to_group(&mut self, id: &str, names: &[String]) -> BrokerResult<usize> {
        if names.len() > constants::MAX_BATCH_CONTROLS {
            return Err(BrokerError::Validation {
                field: "controlNames".to_string(),
                reason: format!(
                    "at most {} names per call, got {}",
                    constants::MAX_BATCH_CONTROLS,
                    names.len()
                ),
            });
        }
        for name in names {
            if self.cache_built && !self.index.contains_key(name) {
                log::warn!("group '{id}': adding control '{name}' unknown to the index");
            }
        }
        self.engine.add_controls(id, names)
    }

    /// Poll a group: read fresh values from the core and diff them
    /// against the group's baselines.
    pub async fn poll_change_group(
        &mut self,
        id: &str,
        show_all: bool,
    ) -> BrokerResult<ChangesEvent> {
        let names = self.engine.controls_of(id)?;
        let readings = if names.is_empty() {
            Vec::new()
        } else {
            self.fetch_readings(&names).await?
        };
        self.engine.poll(id, &readings, show_all, EventSource::Poll)
    }

    /// Group summaries for `list_change_groups`.
    #[must_use]
    pub fn list_change_groups(&self) -> Vec<GroupSummary> {
        self.engine.list()
    }

    // ── Notifications ───────────────────────────────────────────────────

    /// Fold an unsolicited core notification into the control index.
    ///
    /// Updates are a supplement only: they refresh the index so the next
    /// poll sees fresh values, but are never recorded directly.
    pub fn apply_notification(&mut self, method: &str, params: &Value) {
        match method {
            "EngineStatus" => {
                let state = params
                    .get("State")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                log::info!("core engine status: {state}");
            }
            "ChangeGroup.Poll" => {
                let Some(changes) = params.get("Changes").and_then(Value::as_array) else {
                    return;
                };
                for change in changes {
                    let (Some(name), Some(raw_value)) = (
                        change.get("Name").and_then(Value::as_str),
                        change.get("Value"),
                    ) else {
                        continue;
                    };
                    let value = ControlValue::from_json(raw_value);
                    let string = change
                        .get("String")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format_value("", &value));
                    self.update_index(name, &value, &string);
                }
            }
            other => {
                log::debug!("ignoring core notification '{other}'");
            }
        }
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Read current values for `names` from the core.
    ///
    /// Talks to the client directly (not through `send_command`) because
    /// it sits inside the change-group poll path. Sends the whole batch
    /// first; if the core rejects it (commonly one stale name), retries
    /// with the index-known subset so one bad name cannot starve a whole
    /// group.
    async fn fetch_readings(
        &mut self,
        names: &[String],
    ) -> BrokerResult<Vec<(String, ControlValue, String)>> {
        let started = Instant::now();
        let result = match self
            .client
            .send_command("Control.Get", json!(names.to_vec()))
            .await
        {
            Ok(result) => result,
            Err(first_err) => {
                let known: Vec<String> = names
                    .iter()
                    .filter(|n| self.index.contains_key(*n))
                    .cloned()
                    .collect();
                if known.is_empty() || known.len() == names.len() {
                    return Err(first_err);
                }
                log::warn!(
                    "batch read rejected ({first_err}); retrying with {} known controls",
                    known.len()
                );
                self.client.send_command("Control.Get", json!(known)).await?
            }
        };
        self.last_command_latency_ms = Some(started.elapsed().as_millis() as u64);

        let entries = result.as_array().cloned().unwrap_or_default();
        let mut readings = Vec::with_capacity(entries.len());
        for raw in &entries {
            let (Some(name), Some(raw_value)) = (
                raw.get("Name").and_then(Value::as_str),
                raw.get("Value"),
            ) else {
                continue;
            };
            let value = ControlValue::from_json(raw_value);
            let control_type = self
                .index
                .get(name)
                .map(|e| e.info.control_type.clone())
                .unwrap_or_default();
            let string = raw
                .get("String")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format_value(&control_type, &value));
            self.update_index(name, &value, &string);
            readings.push((name.to_string(), value, string));
        }
        Ok(readings)
    }

    /// Update (or create) a control index entry with a fresh reading.
    fn update_index(&mut self, path: &str, value: &ControlValue, string: &str) {
        if let Some(entry) = self.index.get_mut(path) {
            entry.info.value = value.clone();
            entry.info.string = string.to_string();
            entry.info.position = value
                .as_number()
                .and_then(|n| position_of(n, entry.info.value_min, entry.info.value_max));
            entry.updated_ms = now_ms();
            return;
        }
        // A control the discovery pass never saw (added to a group by
        // hand, or a design change mid-session). Index it with minimal
        // metadata so later gets and polls resolve.
        let Some((component, control)) = split_control_path(path) else {
            return;
        };
        self.index.insert(
            path.to_string(),
            IndexedControl {
                info: ControlInfo {
                    name: control.to_string(),
                    component: component.to_string(),
                    control_type: "unknown".to_string(),
                    direction: ControlDirection::ReadWrite,
                    value: value.clone(),
                    string: string.to_string(),
                    value_min: None,
                    value_max: None,
                    position: None,
                },
                updated_ms: now_ms(),
            },
        );
    }
}

/// One entry of a batch set request.
#[derive(Debug, Clone)]
pub struct SetRequest {
    /// Fully-qualified control path.
    pub name: String,
    /// Requested value.
    pub value: ControlValue,
    /// Clamp numeric values into known bounds and report the result.
    pub validate: bool,
    /// Ramp/fade fields present in the request (accepted, ignored).
    pub ignored_fields: Vec<String>,
}

/// Parse a component descriptor from `Component.GetComponents`.
fn parse_component(raw: &Value) -> Option<ComponentInfo> {
    let name = raw.get("Name")?.as_str()?.to_string();
    let component_type = raw
        .get("Type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let mut properties = BTreeMap::new();
    if let Some(props) = raw.get("Properties").and_then(Value::as_array) {
        for prop in props {
            if let (Some(k), Some(v)) = (
                prop.get("Name").and_then(Value::as_str),
                prop.get("Value").and_then(Value::as_str),
            ) {
                properties.insert(k.to_string(), v.to_string());
            }
        }
    }
    Some(ComponentInfo {
        name,
        component_type,
        properties,
    })
}

/// Parse a control descriptor from `Component.GetControls`.
fn parse_control(component: &str, raw: &Value) -> Option<ControlInfo> {
    let name = raw.get("Name")?.as_str()?.to_string();
    let control_type = raw
        .get("Type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let direction = match raw.get("Direction").and_then(Value::as_str) {
        Some("Read") => ControlDirection::Read,
        _ => ControlDirection::ReadWrite,
    };
    let value = raw
        .get("Value")
        .map(ControlValue::from_json)
        .unwrap_or(ControlValue::Number(0.0));
    let value_min = raw.get("ValueMin").and_then(Value::as_f64);
    let value_max = raw.get("ValueMax").and_then(Value::as_f64);
    let position = raw.get("Position").and_then(Value::as_f64).or_else(|| {
        value
            .as_number()
            .and_then(|n| position_of(n, value_min, value_max))
    });
    let string = raw
        .get("String")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format_value(&control_type, &value));
    Some(ControlInfo {
        name,
        component: component.to_string(),
        control_type,
        direction,
        value,
        string,
        value_min,
        value_max,
        position,
    })
}

/// Pull a string array out of QRC-shaped params.
fn string_array(params: &Value, field: &str) -> BrokerResult<Vec<String>> {
    params
        .get(field)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| BrokerError::Validation {
            field: field.to_string(),
            reason: "expected array of strings".to_string(),
        })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
