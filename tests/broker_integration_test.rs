//! End-to-end tests against an in-process mock core.
//!
//! The mock speaks just enough QRC over a plain `ws://` listener to
//! exercise discovery, control get/set, change groups, recording, and
//! reconnection — no real core required.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use qsys_broker::adapter::types::ControlValue;
use qsys_broker::adapter::{QsysAdapter, SetRequest};
use qsys_broker::changegroup::ChangeGroupEngine;
use qsys_broker::config::{ConnectionConfig, RecorderConfig};
use qsys_broker::core::{CoreClient, CoreEvent};
use qsys_broker::events::{EventQuery, EventRecorder};
use qsys_broker::{BrokerError, EngineEvent};

// ─── Mock core ──────────────────────────────────────────────────────────────

/// One control in the mock design.
#[derive(Clone)]
struct MockControl {
    component: String,
    name: String,
    ctype: String,
    value: Value,
    min: Option<f64>,
    max: Option<f64>,
}

impl MockControl {
    fn path(&self) -> String {
        format!("{}.{}", self.component, self.name)
    }

    fn string(&self) -> String {
        match &self.value {
            Value::Number(n) if self.ctype == "gain" => format!("{n}dB"),
            other => other.to_string().trim_matches('"').to_string(),
        }
    }
}

#[derive(Default)]
struct MockState {
    /// path → control.
    controls: HashMap<String, MockControl>,
    /// (name, type) pairs, discovery order.
    components: Vec<(String, String)>,
}

/// Minimal QRC core over `ws://`.
struct MockCore {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    kill_tx: tokio::sync::broadcast::Sender<()>,
}

impl MockCore {
    /// Start with the standard two-component test design:
    /// `Gain1 {gain: -10 (bounds -100..20), mute: false}` and
    /// `Mixer {out1.gain: 0}`.
    async fn start() -> Self {
        let mut state = MockState::default();
        state.components = vec![
            ("Gain1".to_string(), "gain".to_string()),
            ("Mixer".to_string(), "mixer".to_string()),
        ];
        for control in [
            MockControl {
                component: "Gain1".to_string(),
                name: "gain".to_string(),
                ctype: "gain".to_string(),
                value: json!(-10.0),
                min: Some(-100.0),
                max: Some(20.0),
            },
            MockControl {
                component: "Gain1".to_string(),
                name: "mute".to_string(),
                ctype: "mute".to_string(),
                value: json!(false),
                min: None,
                max: None,
            },
            MockControl {
                component: "Mixer".to_string(),
                name: "out1.gain".to_string(),
                ctype: "gain".to_string(),
                value: json!(0.0),
                min: Some(-100.0),
                max: Some(20.0),
            },
        ] {
            state.controls.insert(control.path(), control);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(Mutex::new(state));
        let (kill_tx, _) = tokio::sync::broadcast::channel(4);

        let accept_state = Arc::clone(&state);
        let accept_kill = kill_tx.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&accept_state);
                let mut kill_rx = accept_kill.subscribe();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut source) = ws.split();
                    loop {
                        tokio::select! {
                            _ = kill_rx.recv() => return, // drop = hard disconnect
                            msg = source.next() => {
                                let Some(Ok(msg)) = msg else { return };
                                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                                    let reply = respond(&state, &text);
                                    if let Some(reply) = reply {
                                        if sink
                                            .send(tokio_tungstenite::tungstenite::Message::Text(
                                                reply.to_string(),
                                            ))
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            state,
            kill_tx,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/qrc-public-api/v0", self.addr)
    }

    /// Drop every live connection (simulates a core reboot).
    fn kill_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Mutate a control out-of-band (an operator touching the design).
    fn set_value(&self, path: &str, value: Value) {
        let mut state = self.state.lock().expect("lock");
        if let Some(control) = state.controls.get_mut(path) {
            control.value = value;
        }
    }

    fn value_of(&self, path: &str) -> Option<Value> {
        let state = self.state.lock().expect("lock");
        state.controls.get(path).map(|c| c.value.clone())
    }
}

/// Answer one QRC request.
fn respond(shared: &Arc<Mutex<MockState>>, text: &str) -> Option<Value> {
    let request: Value = serde_json::from_str(text).ok()?;
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method")?.as_str()?;
    let params = request.get("params").cloned().unwrap_or(json!({}));

    let result = match method {
        "NoOp" | "Logon" => json!(true),
        "StatusGet" => json!({
            "Platform": "Core 110f",
            "State": "Active",
            "DesignName": "TestDesign",
            "DesignCode": "abc123",
            "IsRedundant": false,
            "IsEmulator": true,
            "Status": { "Code": 0, "String": "OK" }
        }),
        "Component.GetComponents" => {
            let state = shared.lock().expect("lock");
            let components: Vec<Value> = state
                .components
                .iter()
                .map(|(name, ctype)| json!({ "Name": name, "Type": ctype, "Properties": [] }))
                .collect();
            json!(components)
        }
        "Component.GetControls" => {
            let component = params.get("Name")?.as_str()?;
            let state = shared.lock().expect("lock");
            let controls: Vec<Value> = state
                .controls
                .values()
                .filter(|c| c.component == component)
                .map(|c| {
                    json!({
                        "Name": c.name,
                        "Type": c.ctype,
                        "Value": c.value,
                        "String": c.string(),
                        "ValueMin": c.min,
                        "ValueMax": c.max,
                    })
                })
                .collect();
            json!({ "Name": component, "Controls": controls })
        }
        "Control.Get" => {
            let names = params.as_array().cloned().unwrap_or_default();
            let state = shared.lock().expect("lock");
            let entries: Vec<Value> = names
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|name| {
                    state.controls.get(name).map(|c| {
                        json!({ "Name": name, "Value": c.value, "String": c.string() })
                    })
                })
                .collect();
            json!(entries)
        }
        "Control.Set" => {
            let name = params.get("Name")?.as_str()?;
            let mut state = shared.lock().expect("lock");
            match state.controls.get_mut(name) {
                Some(control) => {
                    control.value = params.get("Value").cloned().unwrap_or(Value::Null);
                    json!(true)
                }
                None => {
                    return Some(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": 8, "message": format!("Unknown control {name}") }
                    }));
                }
            }
        }
        "Component.Get" => {
            let component = params.get("Name")?.as_str()?;
            let wanted: Vec<String> = params
                .get("Controls")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|c| c.get("Name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let state = shared.lock().expect("lock");
            let controls: Vec<Value> = wanted
                .iter()
                .filter_map(|local| {
                    state.controls.get(&format!("{component}.{local}")).map(|c| {
                        json!({ "Name": local, "Value": c.value, "String": c.string() })
                    })
                })
                .collect();
            json!({ "Name": component, "Controls": controls })
        }
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Unknown method {method}") }
            }));
        }
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

// ─── Harness ───────────────────────────────────────────────────────────────

struct Harness {
    adapter: QsysAdapter,
    core_events: mpsc::UnboundedReceiver<CoreEvent>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    _ticks: mpsc::UnboundedReceiver<String>,
}

async fn connect_adapter(core: &MockCore) -> Harness {
    let (core_tx, core_events) = mpsc::unbounded_channel();
    let (emit_tx, engine_events) = mpsc::unbounded_channel();
    let (tick_tx, ticks) = mpsc::unbounded_channel();

    let cfg = ConnectionConfig {
        host: "127.0.0.1".to_string(),
        ..ConnectionConfig::default()
    };
    let mut client = CoreClient::with_url(cfg, core.url(), core_tx);
    client.connect().await.expect("connect to mock core");
    let engine = ChangeGroupEngine::new(emit_tx, tick_tx);
    let mut harness = Harness {
        adapter: QsysAdapter::new(client, engine),
        core_events,
        engine_events,
        _ticks: ticks,
    };
    // Drain the initial Connected event.
    let _ = harness.core_events.recv().await;
    harness
}

/// Forward every pending engine event into a recorder.
fn pump_engine_events(
    engine_events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    recorder: &mut EventRecorder,
) {
    while let Ok(event) = engine_events.try_recv() {
        recorder.on_engine_event(&event);
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_discovery_lists_both_components() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let components = harness
        .adapter
        .list_components(None, false)
        .await
        .expect("list");
    assert_eq!(components.len(), 2);
    assert_eq!(components[0]["name"], "Gain1");
    assert_eq!(components[0]["type"], "gain");
    assert_eq!(components[1]["name"], "Mixer");
    assert_eq!(components[1]["type"], "mixer");
}

#[tokio::test]
async fn test_discovery_filter_regex() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let filter = regex::Regex::new("^Gain").expect("regex");
    let components = harness
        .adapter
        .list_components(Some(&filter), false)
        .await
        .expect("list");
    assert_eq!(components.len(), 1);
    assert_eq!(components[0]["name"], "Gain1");
}

#[tokio::test]
async fn test_list_controls_with_metadata() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let controls = harness
        .adapter
        .list_controls("Gain1", None, true)
        .await
        .expect("list");
    assert_eq!(controls.len(), 2);
    let gain = controls
        .iter()
        .find(|c| c["name"] == "Gain1.gain")
        .expect("gain present");
    assert_eq!(gain["valueMin"], -100.0);
    assert_eq!(gain["valueMax"], 20.0);

    let err = harness
        .adapter
        .list_controls("Nonexistent", None, false)
        .await
        .expect_err("unknown component");
    assert!(matches!(err, BrokerError::UnknownComponent(_)));
}

#[tokio::test]
async fn test_get_control_values_reads_mock_state() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let outcomes = harness
        .adapter
        .get_control_values(&["Gain1.gain".to_string(), "Gain1.mute".to_string()])
        .await
        .expect("get");
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].value, Some(ControlValue::Number(-10.0)));
    assert_eq!(outcomes[1].value, Some(ControlValue::Bool(false)));
    assert!(outcomes[0].timestamp_ms.is_some());
}

#[tokio::test]
async fn test_get_unknown_control_is_per_entry_error() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let outcomes = harness
        .adapter
        .get_control_values(&["Gain1.gain".to_string(), "Ghost.control".to_string()])
        .await
        .expect("get");
    assert!(outcomes[0].error.is_none());
    assert_eq!(outcomes[1].error.as_deref(), Some("unknown control"));
}

#[tokio::test]
async fn test_get_control_values_batch_boundary() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let hundred: Vec<String> = (0..100).map(|i| format!("Gain1.fake{i}")).collect();
    assert!(harness.adapter.get_control_values(&hundred).await.is_ok());

    let too_many: Vec<String> = (0..101).map(|i| format!("Gain1.fake{i}")).collect();
    let err = harness
        .adapter
        .get_control_values(&too_many)
        .await
        .expect_err("101 rejected");
    assert!(matches!(err, BrokerError::Validation { .. }));
}

#[tokio::test]
async fn test_set_then_get_round_trip() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let outcomes = harness
        .adapter
        .set_control_values(&[SetRequest {
            name: "Gain1.gain".to_string(),
            value: ControlValue::Number(-20.0),
            validate: false,
            ignored_fields: Vec::new(),
        }])
        .await
        .expect("set");
    assert!(outcomes[0].ok, "set accepted: {:?}", outcomes[0].error);
    assert_eq!(core.value_of("Gain1.gain"), Some(json!(-20.0)));

    let reads = harness
        .adapter
        .get_control_values(&["Gain1.gain".to_string()])
        .await
        .expect("get");
    assert_eq!(reads[0].value, Some(ControlValue::Number(-20.0)));
    let string = reads[0].string.clone().expect("string");
    assert!(string.contains("-20"), "formatted string: {string}");
    assert!(string.contains("dB"), "unit suffix: {string}");
}

#[tokio::test]
async fn test_set_with_validate_clamps_and_reports() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let outcomes = harness
        .adapter
        .set_control_values(&[SetRequest {
            name: "Gain1.gain".to_string(),
            value: ControlValue::Number(-250.0),
            validate: true,
            ignored_fields: Vec::new(),
        }])
        .await
        .expect("set");
    assert!(outcomes[0].ok);
    assert_eq!(outcomes[0].clamped_to, Some(-100.0), "clamped to ValueMin");
    assert_eq!(core.value_of("Gain1.gain"), Some(json!(-100.0)));
}

#[tokio::test]
async fn test_set_partial_failure_is_per_entry() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let outcomes = harness
        .adapter
        .set_control_values(&[
            SetRequest {
                name: "Ghost.control".to_string(),
                value: ControlValue::Number(1.0),
                validate: false,
                ignored_fields: Vec::new(),
            },
            SetRequest {
                name: "Gain1.gain".to_string(),
                value: ControlValue::Number(-5.0),
                validate: false,
                ignored_fields: vec!["ramp".to_string()],
            },
        ])
        .await
        .expect("set");
    assert!(!outcomes[0].ok, "unknown control fails its entry");
    assert!(outcomes[1].ok, "neighbor entry still applies");
    assert_eq!(outcomes[1].ignored, vec!["ramp".to_string()]);
    assert_eq!(core.value_of("Gain1.gain"), Some(json!(-5.0)));
}

#[tokio::test]
async fn test_change_group_baseline_then_empty_poll() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    harness.adapter.create_change_group("g1").expect("create");
    harness
        .adapter
        .add_controls_to_group("g1", &["Gain1.gain".to_string()])
        .expect("add");

    let first = harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("first poll");
    assert_eq!(first.changes.len(), 1, "baseline poll reports the control");
    assert_eq!(first.changes[0].value, ControlValue::Number(-10.0));

    let second = harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("second poll");
    assert!(second.changes.is_empty(), "no intervening change");
    assert_eq!(second.sequence, first.sequence + 1);
}

#[tokio::test]
async fn test_external_change_detected_by_poll() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    harness.adapter.create_change_group("g1").expect("create");
    harness
        .adapter
        .add_controls_to_group("g1", &["Gain1.mute".to_string()])
        .expect("add");
    harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("baseline");

    core.set_value("Gain1.mute", json!(true));
    let event = harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("poll");
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].value, ControlValue::Bool(true));
    assert_eq!(event.changes[0].previous, Some(ControlValue::Bool(false)));
}

#[tokio::test]
async fn test_recording_polls_end_to_end() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let mut recorder = EventRecorder::new(&RecorderConfig {
        enabled: true,
        path: dir.path().to_path_buf(),
        retention_days: 7,
        buffer_size: 100,
        flush_interval_ms: 50,
    });

    harness.adapter.create_change_group("g1").expect("create");
    harness
        .adapter
        .add_controls_to_group("g1", &["Gain1.mute".to_string()])
        .expect("add");

    // Baseline, then two external toggles, polled in between.
    harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("baseline");
    core.set_value("Gain1.mute", json!(true));
    harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("poll 2");
    core.set_value("Gain1.mute", json!(false));
    harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("poll 3");

    pump_engine_events(&mut harness.engine_events, &mut recorder);

    let (events, _) = recorder
        .query(&EventQuery {
            group_id: Some("g1".to_string()),
            ..EventQuery::default()
        })
        .expect("query");
    // Baseline emission + two toggles, in order.
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].value, json!(false));
    assert_eq!(events[1].value, json!(true));
    assert_eq!(events[2].value, json!(false));

    let stats = recorder.statistics().expect("stats");
    assert_eq!(stats.total_events, 3);
    assert_eq!(stats.unique_groups, 1);
}

#[tokio::test]
async fn test_destroyed_group_stops_emitting() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    harness.adapter.create_change_group("g1").expect("create");
    harness
        .adapter
        .add_controls_to_group("g1", &["Gain1.gain".to_string()])
        .expect("add");
    harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("baseline");
    harness.adapter.engine_mut().destroy("g1").expect("destroy");

    let err = harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect_err("destroyed");
    assert!(matches!(err, BrokerError::State(_)));
    assert!(harness.adapter.list_change_groups().is_empty());
}

#[tokio::test]
async fn test_reconnect_rebuilds_cache_and_rebaselines_groups() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    harness
        .adapter
        .ensure_cache()
        .await
        .expect("initial discovery");
    harness.adapter.create_change_group("g1").expect("create");
    harness
        .adapter
        .add_controls_to_group(
            "g1",
            &["Gain1.gain".to_string(), "Gain1.mute".to_string()],
        )
        .expect("add");
    harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("baseline");

    // Kill the link; the client reconnects on its backoff schedule.
    core.kill_connections();
    let mut saw_disconnect = false;
    let mut saw_reconnect = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline && !saw_reconnect {
        match tokio::time::timeout_at(deadline, harness.core_events.recv()).await {
            Ok(Some(CoreEvent::Disconnected { .. })) => saw_disconnect = true,
            Ok(Some(CoreEvent::Connected {
                reconnected: true, ..
            })) => saw_reconnect = true,
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert!(saw_disconnect, "disconnect observed");
    assert!(saw_reconnect, "reconnect observed");

    // What the broker loop does on the reconnected event.
    let count = harness
        .adapter
        .on_reconnected()
        .await
        .expect("rebuild discovery");
    assert_eq!(count, 2, "components survive reconnect");

    // Group survives, and its next poll re-baselines every control.
    let event = harness
        .adapter
        .poll_change_group("g1", false)
        .await
        .expect("post-reconnect poll");
    assert_eq!(event.changes.len(), 2, "invalidate-on-reconnect applied");
}

#[tokio::test]
async fn test_component_get_bulk() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let result = harness
        .adapter
        .component_get("Mixer", Some(&["out1.gain".to_string()]))
        .await
        .expect("component get");
    let controls = result["Controls"].as_array().expect("controls");
    assert_eq!(controls.len(), 1);
    assert_eq!(controls[0]["Name"], "out1.gain");
    assert_eq!(controls[0]["Value"], 0.0);
}

#[tokio::test]
async fn test_query_core_status_fields() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let status = harness.adapter.query_core_status().await.expect("status");
    assert_eq!(status["Platform"], "Core 110f");
    assert_eq!(status["DesignName"], "TestDesign");
    assert_eq!(status["IsEmulator"], true);
    assert_eq!(status["IsRedundant"], false);
}

#[tokio::test]
async fn test_unknown_method_rejected_before_the_wire() {
    let core = MockCore::start().await;
    let mut harness = connect_adapter(&core).await;

    let err = harness
        .adapter
        .send_command("Design.Delete", json!({}))
        .await
        .expect_err("not in catalogue");
    assert!(matches!(err, BrokerError::UnknownMethod(_)));
}
