//! Change-group engine: subscriptions, poll diffing, and event emission.
//!
//! A change group binds a client-chosen id to an ordered list of
//! fully-qualified control names plus the last value observed for each.
//! Polling compares fresh readings against those baselines and emits one
//! `changes` event per poll — totally ordered per group by a strictly
//! increasing sequence number.
//!
//! The engine never talks to the core itself: the adapter fetches current
//! readings and feeds them in, so this module stays pure state-machine
//! logic that tests can drive without a link.
//!
//! # State machine
//!
//! ```text
//! create ──► Created ──add──► Populated ──poll/auto-poll──► Subscribed / AutoPolling
//!                                                                │ destroy
//!                                                                ▼
//!                                                            Destroyed (terminal)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapter::types::{split_control_path, ControlValue};
use crate::constants;
use crate::error::{BrokerError, BrokerResult};

/// Lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Created, no controls yet.
    Created,
    /// Has controls, never polled.
    Populated,
    /// Polled at least once; its emissions are recorded.
    Subscribed,
    /// Subscribed with a live timer.
    AutoPolling,
}

/// Where a change event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    /// Manual or timed group poll.
    Poll,
    /// Unsolicited core update notification.
    SdkUpdate,
    /// A set issued through the broker.
    Set,
}

impl EventSource {
    /// Tag stored in the event segment's `source` column.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::SdkUpdate => "sdk-update",
            Self::Set => "set",
        }
    }
}

/// One control's delta inside a `changes` event.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeDelta {
    /// Fully-qualified `Component.control` path.
    #[serde(rename = "Name")]
    pub name: String,
    /// Current value.
    #[serde(rename = "Value")]
    pub value: ControlValue,
    /// Formatted string rendering, recomputed for this poll.
    #[serde(rename = "String")]
    pub string: String,
    /// Prior value, absent on the baseline emission.
    #[serde(rename = "Previous", skip_serializing_if = "Option::is_none")]
    pub previous: Option<ControlValue>,
}

/// One poll's emission: the totally-ordered unit of the engine contract.
#[derive(Debug, Clone, Serialize)]
pub struct ChangesEvent {
    /// Group the poll ran against.
    pub group_id: String,
    /// Strictly increasing per group for the life of the process.
    pub sequence: u64,
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Controls whose value changed since the last poll.
    pub changes: Vec<ChangeDelta>,
    /// Origin of the poll.
    pub source: EventSource,
}

/// Events published by the engine to the broker loop.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A poll ran; carries its full emission.
    Changes(ChangesEvent),
    /// Group entered the recorded (subscribed) set.
    Subscribed {
        /// Group id.
        group_id: String,
    },
    /// Group left the recorded set (destroy).
    Unsubscribed {
        /// Group id.
        group_id: String,
    },
    /// An auto-poll timer stopped itself after repeated failures.
    AutoPollStopped {
        /// Group id.
        group_id: String,
        /// Why the timer stopped.
        reason: String,
    },
}

/// Auto-poll bookkeeping for one group.
struct AutoPoll {
    /// Poll rate in seconds.
    rate_secs: f64,
    /// Ticker task handle; aborted on replace/destroy/stop.
    handle: JoinHandle<()>,
}

/// One change group.
struct Group {
    /// Membership in insertion order.
    controls: Vec<String>,
    /// Last observed value per control; empty entries mean "no baseline".
    last_values: HashMap<String, ControlValue>,
    /// Sequence of the last emitted event.
    sequence: u64,
    state: GroupState,
    auto_poll: Option<AutoPoll>,
    /// Consecutive auto-poll failures; resets on success.
    auto_poll_failures: u32,
    /// A timer tick arrived while the link was down; run one poll when
    /// the link returns. At most one poll is coalesced.
    pending_poll: bool,
}

/// Summary of a group for `list_change_groups`.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    /// Group id.
    pub id: String,
    /// Lifecycle state.
    pub state: GroupState,
    /// Number of member controls.
    pub control_count: usize,
    /// Auto-poll rate in seconds, when a timer is live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_poll_rate: Option<f64>,
    /// Sequence of the last emitted event.
    pub sequence: u64,
}

/// The registry of change groups plus the emission hook.
pub struct ChangeGroupEngine {
    groups: BTreeMap<String, Group>,
    /// Ids of destroyed groups; operations on them are state errors
    /// rather than unknown-group errors.
    destroyed: HashSet<String>,
    emit_tx: mpsc::UnboundedSender<EngineEvent>,
    /// Auto-poll ticks destined for the broker loop.
    tick_tx: mpsc::UnboundedSender<String>,
}

impl ChangeGroupEngine {
    /// Create an engine whose emissions flow to `emit_tx` and whose
    /// auto-poll ticks flow to `tick_tx`.
    #[must_use]
    pub fn new(
        emit_tx: mpsc::UnboundedSender<EngineEvent>,
        tick_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            groups: BTreeMap::new(),
            destroyed: HashSet::new(),
            emit_tx,
            tick_tx,
        }
    }

    /// Create a group. Duplicate ids are a state error.
    pub fn create(&mut self, id: &str) -> BrokerResult<()> {
        if id.is_empty() {
            return Err(BrokerError::Validation {
                field: "groupId".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.groups.contains_key(id) {
            return Err(BrokerError::State(format!(
                "change group '{id}' already exists"
            )));
        }
        self.destroyed.remove(id);
        self.groups.insert(
            id.to_string(),
            Group {
                controls: Vec::new(),
                last_values: HashMap::new(),
                sequence: 0,
                state: GroupState::Created,
                auto_poll: None,
                auto_poll_failures: 0,
                pending_poll: false,
            },
        );
        Ok(())
    }

    /// Add controls to a group. Unknown-to-the-index names are accepted
    /// (the caller logs the warning); duplicates are no-ops. Returns the
    /// number actually added.
    pub fn add_controls(&mut self, id: &str, names: &[String]) -> BrokerResult<usize> {
        let group = self.group_mut(id)?;
        let mut added = 0;
        for name in names {
            if split_control_path(name).is_none() {
                return Err(BrokerError::Validation {
                    field: "controlNames".to_string(),
                    reason: format!("'{name}' is not a Component.control path"),
                });
            }
            if !group.controls.iter().any(|c| c == name) {
                group.controls.push(name.clone());
                added += 1;
            }
        }
        if group.state == GroupState::Created && !group.controls.is_empty() {
            group.state = GroupState::Populated;
        }
        Ok(added)
    }

    /// Remove controls from a group. Names not in the group are ignored.
    /// Returns the number removed.
    pub fn remove_controls(&mut self, id: &str, names: &[String]) -> BrokerResult<usize> {
        let group = self.group_mut(id)?;
        let before = group.controls.len();
        group.controls.retain(|c| !names.contains(c));
        for name in names {
            group.last_values.remove(name);
        }
        Ok(before - group.controls.len())
    }

    /// Remove every control but keep the group (and its timer).
    pub fn clear(&mut self, id: &str) -> BrokerResult<()> {
        let group = self.group_mut(id)?;
        group.controls.clear();
        group.last_values.clear();
        Ok(())
    }

    /// Discard baselines so the next poll reports every member control.
    pub fn invalidate(&mut self, id: &str) -> BrokerResult<()> {
        let group = self.group_mut(id)?;
        group.last_values.clear();
        Ok(())
    }

    /// Discard baselines for every group (applied on reconnect).
    pub fn invalidate_all(&mut self) {
        for group in self.groups.values_mut() {
            group.last_values.clear();
        }
    }

    /// Destroy a group: cancel its timer, remove it, and emit
    /// `Unsubscribed`. Terminal — later operations on the id are state
    /// errors.
    pub fn destroy(&mut self, id: &str) -> BrokerResult<()> {
        let Some(group) = self.groups.remove(id) else {
            return self.group_missing(id);
        };
        if let Some(auto) = group.auto_poll {
            auto.handle.abort();
        }
        self.destroyed.insert(id.to_string());
        let _ = self.emit_tx.send(EngineEvent::Unsubscribed {
            group_id: id.to_string(),
        });
        Ok(())
    }

    /// Membership of a group, in insertion order.
    pub fn controls_of(&self, id: &str) -> BrokerResult<Vec<String>> {
        match self.groups.get(id) {
            Some(group) => Ok(group.controls.clone()),
            None => self.group_missing(id),
        }
    }

    /// True if the group exists (and is not destroyed).
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    /// Summaries for `list_change_groups`.
    #[must_use]
    pub fn list(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|(id, group)| GroupSummary {
                id: id.clone(),
                state: group.state,
                control_count: group.controls.len(),
                auto_poll_rate: group.auto_poll.as_ref().map(|a| a.rate_secs),
                sequence: group.sequence,
            })
            .collect()
    }

    /// Run one poll against fresh readings.
    ///
    /// `readings` carries (path, value, string) for each member control
    /// the adapter could resolve; members without a reading are skipped
    /// this round and will baseline on the first poll that reads them.
    ///
    /// Emits exactly one `changes` event (possibly with an empty delta
    /// list) and returns it. With `show_all`, unchanged controls are
    /// included in the emission as well.
    pub fn poll(
        &mut self,
        id: &str,
        readings: &[(String, ControlValue, String)],
        show_all: bool,
        source: EventSource,
    ) -> BrokerResult<ChangesEvent> {
        let newly_subscribed = {
            let group = self.group_mut(id)?;
            matches!(group.state, GroupState::Created | GroupState::Populated)
        };
        if newly_subscribed {
            // Entering the recorded set must be visible to the recorder
            // before the first emission arrives.
            let _ = self.emit_tx.send(EngineEvent::Subscribed {
                group_id: id.to_string(),
            });
        }

        let group = self.group_mut(id)?;
        if matches!(group.state, GroupState::Created | GroupState::Populated) {
            group.state = GroupState::Subscribed;
        }
        group.pending_poll = false;

        let by_path: HashMap<&str, (&ControlValue, &str)> = readings
            .iter()
            .map(|(path, value, string)| (path.as_str(), (value, string.as_str())))
            .collect();

        let mut changes = Vec::new();
        for path in &group.controls {
            let Some((value, string)) = by_path.get(path.as_str()) else {
                continue;
            };
            let previous = group.last_values.get(path).cloned();
            let changed = previous.as_ref() != Some(*value);
            if changed || show_all {
                changes.push(ChangeDelta {
                    name: path.clone(),
                    value: (*value).clone(),
                    string: (*string).to_string(),
                    previous,
                });
            }
            group.last_values.insert(path.clone(), (*value).clone());
        }

        group.sequence += 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let event = ChangesEvent {
            group_id: id.to_string(),
            sequence: group.sequence,
            timestamp_ns: now.as_nanos() as u64,
            timestamp_ms: now.as_millis() as i64,
            changes,
            source,
        };
        let _ = self.emit_tx.send(EngineEvent::Changes(event.clone()));
        Ok(event)
    }

    /// Record a broker-issued write against every subscribed group.
    ///
    /// Only groups that already hold a baseline for the control emit;
    /// groups that never polled it will report the value on their first
    /// poll instead. The baseline is updated so the next poll does not
    /// re-report the same transition.
    pub fn note_set(&mut self, path: &str, value: &ControlValue, string: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut emissions = Vec::new();
        for (id, group) in &mut self.groups {
            if !matches!(
                group.state,
                GroupState::Subscribed | GroupState::AutoPolling
            ) {
                continue;
            }
            let Some(previous) = group.last_values.get(path).cloned() else {
                continue;
            };
            if &previous == value {
                continue;
            }
            group
                .last_values
                .insert(path.to_string(), value.clone());
            group.sequence += 1;
            emissions.push(ChangesEvent {
                group_id: id.clone(),
                sequence: group.sequence,
                timestamp_ns: now.as_nanos() as u64,
                timestamp_ms: now.as_millis() as i64,
                changes: vec![ChangeDelta {
                    name: path.to_string(),
                    value: value.clone(),
                    string: string.to_string(),
                    previous: Some(previous),
                }],
                source: EventSource::Set,
            });
        }
        for event in emissions {
            let _ = self.emit_tx.send(EngineEvent::Changes(event));
        }
    }

    /// Enable (or reconfigure) auto-poll for a group.
    ///
    /// Rates below the minimum are rejected; an existing timer is
    /// replaced atomically.
    pub fn set_auto_poll(&mut self, id: &str, rate_secs: f64) -> BrokerResult<()> {
        if !rate_secs.is_finite() || rate_secs < constants::MIN_AUTO_POLL_RATE_SECS {
            return Err(BrokerError::Validation {
                field: "pollRate".to_string(),
                reason: format!(
                    "must be >= {}s, got {rate_secs}",
                    constants::MIN_AUTO_POLL_RATE_SECS
                ),
            });
        }
        let tick_tx = self.tick_tx.clone();
        let group_id = id.to_string();
        let newly_subscribed = {
            let group = self.group_mut(id)?;
            matches!(group.state, GroupState::Created | GroupState::Populated)
        };
        if newly_subscribed {
            let _ = self.emit_tx.send(EngineEvent::Subscribed {
                group_id: id.to_string(),
            });
        }

        let handle = tokio::spawn(async move {
            let period = std::time::Duration::from_secs_f64(rate_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.reset(); // first poll happens one period from now
            loop {
                ticker.tick().await;
                if tick_tx.send(group_id.clone()).is_err() {
                    return;
                }
            }
        });

        let group = self.group_mut(id)?;
        if let Some(old) = group.auto_poll.replace(AutoPoll { rate_secs, handle }) {
            old.handle.abort();
        }
        group.auto_poll_failures = 0;
        group.state = GroupState::AutoPolling;
        Ok(())
    }

    /// Stop a group's auto-poll timer, keeping the group.
    pub fn stop_auto_poll(&mut self, id: &str) -> BrokerResult<()> {
        let group = self.group_mut(id)?;
        if let Some(auto) = group.auto_poll.take() {
            auto.handle.abort();
        }
        if group.state == GroupState::AutoPolling {
            group.state = GroupState::Subscribed;
        }
        Ok(())
    }

    /// Record an auto-poll failure. After the limit, the timer stops
    /// itself and an error event is emitted; the group survives.
    pub fn note_auto_poll_failure(&mut self, id: &str) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        group.auto_poll_failures += 1;
        if group.auto_poll_failures >= constants::AUTO_POLL_FAILURE_LIMIT {
            if let Some(auto) = group.auto_poll.take() {
                auto.handle.abort();
            }
            group.state = GroupState::Subscribed;
            group.auto_poll_failures = 0;
            log::error!(
                "auto-poll for group '{id}' stopped after {} consecutive failures",
                constants::AUTO_POLL_FAILURE_LIMIT
            );
            let _ = self.emit_tx.send(EngineEvent::AutoPollStopped {
                group_id: id.to_string(),
                reason: format!(
                    "{} consecutive poll failures",
                    constants::AUTO_POLL_FAILURE_LIMIT
                ),
            });
        }
    }

    /// Record an auto-poll success, resetting the failure streak.
    pub fn note_auto_poll_success(&mut self, id: &str) {
        if let Some(group) = self.groups.get_mut(id) {
            group.auto_poll_failures = 0;
        }
    }

    /// Mark that a timer tick fired while the link was down.
    pub fn defer_poll(&mut self, id: &str) {
        if let Some(group) = self.groups.get_mut(id) {
            group.pending_poll = true;
        }
    }

    /// Groups with a deferred poll, drained for execution after reconnect.
    pub fn take_deferred(&mut self) -> Vec<String> {
        let mut due = Vec::new();
        for (id, group) in &mut self.groups {
            if group.pending_poll {
                group.pending_poll = false;
                due.push(id.clone());
            }
        }
        due
    }

    /// Cancel every auto-poll timer (shutdown path).
    pub fn cancel_all_timers(&mut self) {
        for group in self.groups.values_mut() {
            if let Some(auto) = group.auto_poll.take() {
                auto.handle.abort();
            }
        }
    }

    fn group_mut(&mut self, id: &str) -> BrokerResult<&mut Group> {
        if self.destroyed.contains(id) {
            return Err(BrokerError::State(format!(
                "change group '{id}' was destroyed"
            )));
        }
        self.groups
            .get_mut(id)
            .ok_or_else(|| BrokerError::UnknownGroup(id.to_string()))
    }

    fn group_missing<T>(&self, id: &str) -> BrokerResult<T> {
        if self.destroyed.contains(id) {
            Err(BrokerError::State(format!(
                "change group '{id}' was destroyed"
            )))
        } else {
            Err(BrokerError::UnknownGroup(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (
        ChangeGroupEngine,
        mpsc::UnboundedReceiver<EngineEvent>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        (ChangeGroupEngine::new(emit_tx, tick_tx), emit_rx, tick_rx)
    }

    fn reading(path: &str, value: f64) -> (String, ControlValue, String) {
        (
            path.to_string(),
            ControlValue::Number(value),
            format!("{value}"),
        )
    }

    #[test]
    fn test_create_and_duplicate() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        let err = engine.create("g1").expect_err("duplicate");
        assert!(matches!(err, BrokerError::State(_)));
    }

    #[test]
    fn test_add_is_idempotent() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        let added = engine
            .add_controls("g1", &["Gain1.gain".to_string(), "Gain1.gain".to_string()])
            .expect("add");
        assert_eq!(added, 1);
        let added = engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("re-add");
        assert_eq!(added, 0);
        assert_eq!(engine.controls_of("g1").expect("controls").len(), 1);
    }

    #[test]
    fn test_add_rejects_unqualified_names() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        let err = engine
            .add_controls("g1", &["noseparator".to_string()])
            .expect_err("bad name");
        assert!(matches!(err, BrokerError::Validation { .. }));
    }

    #[test]
    fn test_poll_unknown_group_fails() {
        let (mut engine, _emit, _tick) = engine();
        let err = engine
            .poll("nope", &[], false, EventSource::Poll)
            .expect_err("unknown");
        assert!(matches!(err, BrokerError::UnknownGroup(_)));
    }

    #[test]
    fn test_first_poll_baselines_second_is_empty() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");

        let first = engine
            .poll("g1", &[reading("Gain1.gain", -20.0)], false, EventSource::Poll)
            .expect("poll");
        assert_eq!(first.changes.len(), 1, "baseline emits every control");
        assert!(first.changes[0].previous.is_none());

        let second = engine
            .poll("g1", &[reading("Gain1.gain", -20.0)], false, EventSource::Poll)
            .expect("poll");
        assert!(second.changes.is_empty(), "unchanged value emits nothing");
    }

    #[test]
    fn test_change_carries_previous_value() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");
        engine
            .poll("g1", &[reading("Gain1.gain", -20.0)], false, EventSource::Poll)
            .expect("baseline");
        let event = engine
            .poll("g1", &[reading("Gain1.gain", -10.0)], false, EventSource::Poll)
            .expect("poll");
        assert_eq!(event.changes.len(), 1);
        assert_eq!(
            event.changes[0].previous,
            Some(ControlValue::Number(-20.0))
        );
        assert_eq!(event.changes[0].value, ControlValue::Number(-10.0));
    }

    #[test]
    fn test_sequences_strictly_increase_without_gaps() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");
        let mut expected = 0;
        for i in 0..10 {
            let event = engine
                .poll(
                    "g1",
                    &[reading("Gain1.gain", f64::from(i))],
                    false,
                    EventSource::Poll,
                )
                .expect("poll");
            expected += 1;
            assert_eq!(event.sequence, expected);
        }
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");
        let mut last_ns = 0;
        for i in 0..5 {
            let event = engine
                .poll(
                    "g1",
                    &[reading("Gain1.gain", f64::from(i))],
                    false,
                    EventSource::Poll,
                )
                .expect("poll");
            assert!(event.timestamp_ns >= last_ns);
            last_ns = event.timestamp_ns;
        }
    }

    #[test]
    fn test_invalidate_rebaselines_next_poll() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls(
                "g1",
                &["Gain1.gain".to_string(), "Gain1.mute".to_string()],
            )
            .expect("add");
        let readings = vec![
            reading("Gain1.gain", -20.0),
            (
                "Gain1.mute".to_string(),
                ControlValue::Bool(false),
                "false".to_string(),
            ),
        ];
        engine
            .poll("g1", &readings, false, EventSource::Poll)
            .expect("baseline");
        engine.invalidate("g1").expect("invalidate");
        let event = engine
            .poll("g1", &readings, false, EventSource::Poll)
            .expect("poll");
        assert_eq!(
            event.changes.len(),
            2,
            "every member control re-emits after invalidate"
        );
    }

    #[test]
    fn test_show_all_includes_unchanged() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");
        engine
            .poll("g1", &[reading("Gain1.gain", 0.0)], false, EventSource::Poll)
            .expect("baseline");
        let event = engine
            .poll("g1", &[reading("Gain1.gain", 0.0)], true, EventSource::Poll)
            .expect("poll");
        assert_eq!(event.changes.len(), 1, "show_all overrides the diff");
        assert_eq!(event.changes[0].previous, Some(ControlValue::Number(0.0)));
    }

    #[test]
    fn test_clear_preserves_group() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");
        engine.clear("g1").expect("clear");
        assert!(engine.exists("g1"));
        assert!(engine.controls_of("g1").expect("controls").is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_terminal_state_error() {
        let (mut engine, mut emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine.destroy("g1").expect("destroy");
        assert!(!engine.exists("g1"));
        let err = engine
            .poll("g1", &[], false, EventSource::Poll)
            .expect_err("destroyed");
        assert!(matches!(err, BrokerError::State(_)));
        // And the recorder was told to stop monitoring.
        match emit.recv().await {
            Some(EngineEvent::Unsubscribed { group_id }) => assert_eq!(group_id, "g1"),
            other => panic!("expected Unsubscribed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_poll_rejects_low_rates() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        for bad in [0.0, -1.0, 0.049, f64::NAN] {
            let err = engine.set_auto_poll("g1", bad).expect_err("too fast");
            assert!(matches!(err, BrokerError::Validation { .. }), "rate {bad}");
        }
        engine.set_auto_poll("g1", 0.05).expect("minimum rate ok");
    }

    #[tokio::test]
    async fn test_auto_poll_ticks_flow_to_channel() {
        let (mut engine, _emit, mut tick) = engine();
        engine.create("g1").expect("create");
        engine.set_auto_poll("g1", 0.05).expect("enable");
        let id = tokio::time::timeout(std::time::Duration::from_secs(1), tick.recv())
            .await
            .expect("tick before timeout")
            .expect("channel open");
        assert_eq!(id, "g1");
    }

    #[tokio::test]
    async fn test_auto_poll_replacement_is_atomic() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine.set_auto_poll("g1", 10.0).expect("first timer");
        engine.set_auto_poll("g1", 20.0).expect("replace");
        let list = engine.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].auto_poll_rate, Some(20.0));
    }

    #[tokio::test]
    async fn test_auto_poll_failure_limit_stops_timer() {
        let (mut engine, mut emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine.set_auto_poll("g1", 10.0).expect("enable");
        // Drain the Subscribed event.
        let _ = emit.recv().await;
        for _ in 0..constants::AUTO_POLL_FAILURE_LIMIT {
            engine.note_auto_poll_failure("g1");
        }
        match emit.recv().await {
            Some(EngineEvent::AutoPollStopped { group_id, .. }) => assert_eq!(group_id, "g1"),
            other => panic!("expected AutoPollStopped, got {other:?}"),
        }
        // Group preserved, timer gone.
        assert!(engine.exists("g1"));
        assert_eq!(engine.list()[0].auto_poll_rate, None);
    }

    #[tokio::test]
    async fn test_subscribed_emitted_before_first_changes() {
        let (mut engine, mut emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");
        engine
            .poll("g1", &[reading("Gain1.gain", 1.0)], false, EventSource::Poll)
            .expect("poll");
        match emit.recv().await {
            Some(EngineEvent::Subscribed { group_id }) => assert_eq!(group_id, "g1"),
            other => panic!("expected Subscribed first, got {other:?}"),
        }
        match emit.recv().await {
            Some(EngineEvent::Changes(event)) => assert_eq!(event.sequence, 1),
            other => panic!("expected Changes second, got {other:?}"),
        }
    }

    #[test]
    fn test_note_set_emits_only_for_baselined_groups() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("polled").expect("create");
        engine.create("fresh").expect("create");
        for id in ["polled", "fresh"] {
            engine
                .add_controls(id, &["Gain1.gain".to_string()])
                .expect("add");
        }
        engine
            .poll(
                "polled",
                &[reading("Gain1.gain", -20.0)],
                false,
                EventSource::Poll,
            )
            .expect("baseline");

        engine.note_set("Gain1.gain", &ControlValue::Number(-10.0), "-10dB");

        // The polled group advanced its sequence; the fresh group did not.
        let list = engine.list();
        let polled = list.iter().find(|g| g.id == "polled").expect("polled");
        let fresh = list.iter().find(|g| g.id == "fresh").expect("fresh");
        assert_eq!(polled.sequence, 2);
        assert_eq!(fresh.sequence, 0);

        // And the next poll of the polled group is quiet — the baseline
        // was advanced with the set.
        let event = engine
            .poll(
                "polled",
                &[reading("Gain1.gain", -10.0)],
                false,
                EventSource::Poll,
            )
            .expect("poll");
        assert!(event.changes.is_empty());
    }

    #[test]
    fn test_note_set_same_value_is_silent() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine
            .add_controls("g1", &["Gain1.gain".to_string()])
            .expect("add");
        engine
            .poll("g1", &[reading("Gain1.gain", -20.0)], false, EventSource::Poll)
            .expect("baseline");
        engine.note_set("Gain1.gain", &ControlValue::Number(-20.0), "-20dB");
        assert_eq!(engine.list()[0].sequence, 1, "no emission for a no-op set");
    }

    #[test]
    fn test_deferred_polls_coalesce() {
        let (mut engine, _emit, _tick) = engine();
        engine.create("g1").expect("create");
        engine.defer_poll("g1");
        engine.defer_poll("g1");
        engine.defer_poll("g1");
        assert_eq!(engine.take_deferred(), vec!["g1".to_string()]);
        assert!(engine.take_deferred().is_empty(), "drained");
    }
}
