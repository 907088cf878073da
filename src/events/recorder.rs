//! Event recorder: buffers change emissions and persists them.
//!
//! Subscribes to the change-group engine's emissions, filters them to
//! monitored groups, buffers rows in memory, and flushes them into the
//! daily store in one transaction when the buffer fills or the flush
//! interval elapses — whichever first.
//!
//! # Failure semantics
//!
//! If the store cannot be opened at startup, recording is disabled for
//! the session; control operations are unaffected and event tools fail
//! with a typed persistence error. A failed flush re-queues its rows at
//! the head of the buffer for a bounded number of retries, then drops
//! them with a logged error.
//!
//! # Backpressure
//!
//! Past the high-water mark (10× the flush threshold) the buffer sheds
//! its oldest rows and counts the drops; the counter is part of the
//! statistics surface.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::adapter::types::split_control_path;
use crate::changegroup::{ChangesEvent, EngineEvent};
use crate::config::RecorderConfig;
use crate::constants;
use crate::error::{BrokerError, BrokerResult};

use super::store::{EventQuery, EventRow, EventStore, MaintenanceReport, StoredEvent};

/// Statistics surface for `get_event_statistics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatistics {
    /// Whether recording is live this session.
    pub enabled: bool,
    /// Total persisted events across all segments.
    pub total_events: u64,
    /// Distinct control paths seen.
    pub unique_controls: u64,
    /// Distinct group ids seen.
    pub unique_groups: u64,
    /// Oldest persisted timestamp, Unix ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_ms: Option<i64>,
    /// Newest persisted timestamp, Unix ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_ms: Option<i64>,
    /// On-disk bytes across segments and journals.
    pub disk_bytes: u64,
    /// Daily segments on disk.
    pub segment_count: u64,
    /// Rows waiting in the write buffer.
    pub buffer_length: usize,
    /// Rows dropped under backpressure or after flush-retry exhaustion.
    pub dropped_events: u64,
    /// Rows successfully persisted this session.
    pub recorded_events: u64,
    /// Groups currently in the monitored set.
    pub monitored_groups: usize,
}

/// The recorder.
pub struct EventRecorder {
    store: Option<EventStore>,
    monitored: HashSet<String>,
    buffer: VecDeque<EventRow>,
    buffer_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
    flush_failures: u32,
    dropped: u64,
    recorded: u64,
    /// Latched when the high-water mark is crossed, so the pressure
    /// warning logs once per episode instead of once per event.
    over_pressure: bool,
}

impl EventRecorder {
    /// Build the recorder, opening the store when recording is enabled.
    ///
    /// A store that cannot be opened disables recording for the session
    /// but never fails broker startup.
    #[must_use]
    pub fn new(cfg: &RecorderConfig) -> Self {
        let store = if cfg.enabled {
            match EventStore::open(&cfg.path) {
                Ok(store) => {
                    log::info!("event recording to {}", store.dir().display());
                    Some(store)
                }
                Err(e) => {
                    log::error!("event recording disabled: {e}");
                    None
                }
            }
        } else {
            log::info!("event recording disabled by configuration");
            None
        };
        Self {
            store,
            monitored: HashSet::new(),
            buffer: VecDeque::new(),
            buffer_size: cfg.buffer_size.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            last_flush: Instant::now(),
            flush_failures: 0,
            dropped: 0,
            recorded: 0,
            over_pressure: false,
        }
    }

    /// Whether recording is live this session.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Flush interval, for the broker loop's tick timer.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Consume one engine event.
    pub fn on_engine_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Subscribed { group_id } => {
                self.monitored.insert(group_id.clone());
            }
            EngineEvent::Unsubscribed { group_id } => {
                self.monitored.remove(group_id);
            }
            EngineEvent::AutoPollStopped { group_id, reason } => {
                log::warn!("auto-poll stopped for '{group_id}': {reason}");
            }
            EngineEvent::Changes(changes) => self.buffer_changes(changes),
        }
    }

    /// True when a flush is due by size or by time.
    #[must_use]
    pub fn flush_due(&self) -> bool {
        if self.buffer.is_empty() || self.store.is_none() {
            return false;
        }
        self.buffer.len() >= self.buffer_size || self.last_flush.elapsed() >= self.flush_interval
    }

    /// Flush the buffer in one transaction.
    ///
    /// On failure the rows return to the head of the buffer; after
    /// [`constants::FLUSH_RETRY_LIMIT`] consecutive failures they are
    /// dropped instead, so a dead disk cannot grow the buffer forever.
    pub fn flush(&mut self) -> BrokerResult<()> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }
        let Some(store) = self.store.as_mut() else {
            return Err(BrokerError::Persistence(
                "event recording is disabled".to_string(),
            ));
        };

        let rows: Vec<EventRow> = self.buffer.drain(..).collect();
        match store.insert_batch(&rows) {
            Ok(()) => {
                self.recorded += rows.len() as u64;
                self.flush_failures = 0;
                self.last_flush = Instant::now();
                self.over_pressure = false;
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                if self.flush_failures >= constants::FLUSH_RETRY_LIMIT {
                    self.dropped += rows.len() as u64;
                    self.flush_failures = 0;
                    log::error!(
                        "dropping {} buffered events after {} failed flushes: {e}",
                        rows.len(),
                        constants::FLUSH_RETRY_LIMIT
                    );
                } else {
                    // Re-queue at the head, preserving original order.
                    for row in rows.into_iter().rev() {
                        self.buffer.push_front(row);
                    }
                    log::warn!(
                        "flush failed (attempt {}), {} events re-queued: {e}",
                        self.flush_failures,
                        self.buffer.len()
                    );
                }
                self.last_flush = Instant::now();
                Err(e)
            }
        }
    }

    /// Query persisted events, flushing first so reads see every write
    /// accepted before the call (read-your-writes within the process).
    pub fn query(&mut self, query: &EventQuery) -> BrokerResult<(Vec<StoredEvent>, bool)> {
        if self.store.is_none() {
            return Err(BrokerError::Persistence(
                "event recording is disabled".to_string(),
            ));
        }
        if !self.buffer.is_empty() {
            self.flush()?;
        }
        let Some(store) = self.store.as_mut() else {
            return Err(BrokerError::Persistence(
                "event recording is disabled".to_string(),
            ));
        };
        store.query(query)
    }

    /// The statistics surface. Works with recording disabled (store
    /// numbers read as zero) so operators can still see drop counters.
    pub fn statistics(&mut self) -> BrokerResult<RecorderStatistics> {
        let store_stats = match self.store.as_mut() {
            Some(store) => store.statistics()?,
            None => super::store::StoreStatistics::default(),
        };
        Ok(RecorderStatistics {
            enabled: self.store.is_some(),
            total_events: store_stats.total_events,
            unique_controls: store_stats.unique_controls,
            unique_groups: store_stats.unique_groups,
            oldest_ms: store_stats.oldest_ms,
            newest_ms: store_stats.newest_ms,
            disk_bytes: store_stats.disk_bytes,
            segment_count: store_stats.segment_count,
            buffer_length: self.buffer.len(),
            dropped_events: self.dropped,
            recorded_events: self.recorded,
            monitored_groups: self.monitored.len(),
        })
    }

    /// Retention + vacuum pass. The buffer is drained first — retention
    /// never runs over unsaved rows.
    pub fn run_maintenance(&mut self, retention_days: u32) -> BrokerResult<MaintenanceReport> {
        if !self.buffer.is_empty() {
            self.flush()?;
        }
        match self.store.as_mut() {
            Some(store) => store.run_maintenance(retention_days),
            None => Err(BrokerError::Persistence(
                "event recording is disabled".to_string(),
            )),
        }
    }

    /// Drain the buffer on graceful shutdown. Failures are logged, not
    /// propagated — shutdown must proceed.
    pub fn shutdown(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        log::info!("draining {} buffered events before shutdown", self.buffer.len());
        if let Err(e) = self.flush() {
            log::error!("final flush failed, {} events lost: {e}", self.buffer.len());
        }
    }

    /// Groups currently in the monitored set (sorted for stable output).
    #[must_use]
    pub fn monitored_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.monitored.iter().cloned().collect();
        groups.sort();
        groups
    }

    fn buffer_changes(&mut self, changes: &ChangesEvent) {
        if self.store.is_none() || !self.monitored.contains(&changes.group_id) {
            return;
        }
        for delta in &changes.changes {
            // show-all polls emit unchanged entries for the caller's
            // benefit; only actual transitions are history.
            if delta.previous.as_ref() == Some(&delta.value) {
                continue;
            }
            let Some((component, control)) = split_control_path(&delta.name) else {
                continue;
            };
            self.buffer.push_back(EventRow {
                ts_ms: changes.timestamp_ms,
                group_id: changes.group_id.clone(),
                control_path: delta.name.clone(),
                component_name: component.to_string(),
                control_name: control.to_string(),
                value_json: delta.value.to_json().to_string(),
                prev_value_json: delta.previous.as_ref().map(|p| p.to_json().to_string()),
                source: changes.source.tag(),
            });
        }

        let high_water = self.buffer_size * constants::BUFFER_HIGH_WATER_MULTIPLIER;
        if self.buffer.len() > high_water {
            if !self.over_pressure {
                self.over_pressure = true;
                log::warn!(
                    "event buffer past high-water mark ({high_water}); shedding oldest rows"
                );
            }
            while self.buffer.len() > high_water {
                self.buffer.pop_front();
                self.dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::types::ControlValue;
    use crate::changegroup::{ChangeDelta, EventSource};
    use std::path::Path;

    fn recorder(dir: &Path) -> EventRecorder {
        EventRecorder::new(&RecorderConfig {
            enabled: true,
            path: dir.to_path_buf(),
            retention_days: 7,
            buffer_size: 4,
            flush_interval_ms: 50,
        })
    }

    fn changes(group: &str, sequence: u64, value: f64) -> EngineEvent {
        EngineEvent::Changes(ChangesEvent {
            group_id: group.to_string(),
            sequence,
            timestamp_ns: sequence * 1_000_000,
            timestamp_ms: sequence as i64,
            changes: vec![ChangeDelta {
                name: "Gain1.gain".to_string(),
                value: ControlValue::Number(value),
                string: format!("{value}dB"),
                previous: None,
            }],
            source: EventSource::Poll,
        })
    }

    fn subscribe(group: &str) -> EngineEvent {
        EngineEvent::Subscribed {
            group_id: group.to_string(),
        }
    }

    #[test]
    fn test_unmonitored_groups_are_filtered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path());
        recorder.on_engine_event(&changes("ghost", 1, 0.0));
        assert!(!recorder.flush_due());
        let stats = recorder.statistics().expect("stats");
        assert_eq!(stats.buffer_length, 0);
    }

    #[test]
    fn test_monitored_events_buffer_and_flush_by_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path());
        recorder.on_engine_event(&subscribe("g1"));
        for i in 0..4 {
            recorder.on_engine_event(&changes("g1", i + 1, i as f64));
        }
        assert!(recorder.flush_due(), "buffer_size reached");
        recorder.flush().expect("flush");
        let stats = recorder.statistics().expect("stats");
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.buffer_length, 0);
        assert_eq!(stats.recorded_events, 4);
    }

    #[test]
    fn test_query_flushes_first_read_your_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path());
        recorder.on_engine_event(&subscribe("g1"));
        recorder.on_engine_event(&changes("g1", 1, -20.0));

        // One buffered row, no flush yet — the query must still see it.
        let (rows, _) = recorder.query(&EventQuery::default()).expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_id, "g1");
        assert_eq!(rows[0].value, serde_json::json!(-20.0));
    }

    #[test]
    fn test_unsubscribe_stops_recording() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path());
        recorder.on_engine_event(&subscribe("g1"));
        recorder.on_engine_event(&changes("g1", 1, 1.0));
        recorder.on_engine_event(&EngineEvent::Unsubscribed {
            group_id: "g1".to_string(),
        });
        recorder.on_engine_event(&changes("g1", 2, 2.0));
        let (rows, _) = recorder.query(&EventQuery::default()).expect("query");
        assert_eq!(rows.len(), 1, "post-unsubscribe event not recorded");
    }

    #[test]
    fn test_backpressure_sheds_oldest_and_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path());
        recorder.on_engine_event(&subscribe("g1"));
        // buffer_size 4 → high water 40; push 50 single-delta events.
        for i in 0..50 {
            recorder.on_engine_event(&changes("g1", i + 1, i as f64));
        }
        let stats = recorder.statistics().expect("stats");
        assert_eq!(stats.buffer_length, 40);
        assert_eq!(stats.dropped_events, 10);
    }

    #[test]
    fn test_disabled_recorder_fails_queries_not_process() {
        let mut recorder = EventRecorder::new(&RecorderConfig {
            enabled: false,
            ..RecorderConfig::default()
        });
        assert!(!recorder.is_enabled());
        let err = recorder.query(&EventQuery::default()).expect_err("disabled");
        assert!(matches!(err, BrokerError::Persistence(_)));
        // Statistics still answer so operators see the disabled flag.
        let stats = recorder.statistics().expect("stats");
        assert!(!stats.enabled);
        assert_eq!(stats.total_events, 0);
    }

    #[test]
    fn test_shutdown_drains_buffer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path());
        recorder.on_engine_event(&subscribe("g1"));
        recorder.on_engine_event(&changes("g1", 1, 5.0));
        recorder.shutdown();
        let stats = recorder.statistics().expect("stats");
        assert_eq!(stats.buffer_length, 0);
        assert_eq!(stats.total_events, 1);
    }

    #[test]
    fn test_maintenance_flushes_before_retention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut recorder = recorder(dir.path());
        recorder.on_engine_event(&subscribe("g1"));
        recorder.on_engine_event(&changes("g1", 1, 5.0));
        let report = recorder.run_maintenance(7).expect("maintenance");
        assert_eq!(report.deleted_segments, 0);
        let stats = recorder.statistics().expect("stats");
        assert_eq!(stats.buffer_length, 0, "buffer drained before retention");
        assert_eq!(stats.total_events, 1);
    }
}
