//! Daily SQLite segments for change events.
//!
//! One file per UTC day, `events-YYYY-MM-DD.db`, created lazily on the
//! first write of that day. The current segment is held open with WAL
//! journaling; older segments are opened read-only on demand for queries
//! and deleted by the maintenance pass once they age past retention.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde::Serialize;
use serde_json::Value;

use crate::constants;
use crate::error::{BrokerError, BrokerResult};

/// One row bound for insertion.
#[derive(Debug, Clone)]
pub struct EventRow {
    /// Millisecond timestamp of the emission.
    pub ts_ms: i64,
    /// Group the event belongs to.
    pub group_id: String,
    /// Fully-qualified `Component.control` path.
    pub control_path: String,
    /// Component half of the path.
    pub component_name: String,
    /// Control half of the path.
    pub control_name: String,
    /// JSON-encoded current value.
    pub value_json: String,
    /// JSON-encoded prior value, absent on baseline emissions.
    pub prev_value_json: Option<String>,
    /// Source tag: "poll" | "sdk-update" | "set".
    pub source: &'static str,
}

/// One row read back out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Row id within its segment.
    pub id: i64,
    /// Millisecond timestamp of the emission.
    pub timestamp_ms: i64,
    /// Group id.
    pub group_id: String,
    /// Fully-qualified control path.
    pub control_path: String,
    /// Component name.
    pub component_name: String,
    /// Control name.
    pub control_name: String,
    /// Current value.
    pub value: Value,
    /// Prior value, when one existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    /// Source tag.
    pub source: String,
}

/// Query filter for [`EventStore::query`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Inclusive lower bound, Unix ms.
    pub start_ms: Option<i64>,
    /// Inclusive upper bound, Unix ms.
    pub end_ms: Option<i64>,
    /// Restrict to one group.
    pub group_id: Option<String>,
    /// Restrict to these control paths (empty = all).
    pub control_names: Vec<String>,
    /// Restrict to these components (empty = all).
    pub component_names: Vec<String>,
    /// Maximum rows (capped at the hard limit).
    pub limit: usize,
    /// Rows to skip.
    pub offset: usize,
}

/// Store-level statistics (the recorder adds buffer counters on top).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatistics {
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
    /// On-disk bytes across segments and their journals.
    pub disk_bytes: u64,
    /// Number of daily segments on disk.
    pub segment_count: u64,
}

/// Outcome of a maintenance pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Segments deleted for aging past retention.
    pub deleted_segments: usize,
    /// True when the current segment was vacuumed.
    pub vacuumed: bool,
}

/// The rotating daily event store.
pub struct EventStore {
    dir: PathBuf,
    day: NaiveDate,
    conn: Connection,
}

impl EventStore {
    /// Open the store: create the directory if missing, probe write
    /// permission, and open today's segment.
    pub fn open(dir: &Path) -> BrokerResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            BrokerError::Persistence(format!("create event dir {}: {e}", dir.display()))
        })?;

        // Probe write permission up front so a read-only mount fails the
        // store at startup instead of on the first flush.
        let probe = dir.join(".write-probe");
        fs::write(&probe, b"probe")
            .and_then(|()| fs::remove_file(&probe))
            .map_err(|e| {
                BrokerError::Persistence(format!(
                    "event dir {} is not writable: {e}",
                    dir.display()
                ))
            })?;

        let day = Utc::now().date_naive();
        let conn = open_segment(&segment_path(dir, day))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            day,
            conn,
        })
    }

    /// Directory the segments live in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Insert a batch of rows in one transaction, preserving order.
    pub fn insert_batch(&mut self, rows: &[EventRow]) -> BrokerResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.rotate_if_needed()?;
        let tx = self
            .conn
            .transaction()
            .map_err(|e| BrokerError::Persistence(format!("begin transaction: {e}")))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO events (ts_ms, group_id, control_path, component_name, \
                     control_name, value_json, prev_value_json, source) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(|e| BrokerError::Persistence(format!("prepare insert: {e}")))?;
            for row in rows {
                stmt.execute(params![
                    row.ts_ms,
                    row.group_id,
                    row.control_path,
                    row.component_name,
                    row.control_name,
                    row.value_json,
                    row.prev_value_json,
                    row.source,
                ])
                .map_err(|e| BrokerError::Persistence(format!("insert event: {e}")))?;
            }
        }
        tx.commit()
            .map_err(|e| BrokerError::Persistence(format!("commit batch: {e}")))
    }

    /// Query events across segments, oldest first.
    ///
    /// Returns the rows plus a truncation flag set when the hard cap cut
    /// the result short.
    pub fn query(&mut self, query: &EventQuery) -> BrokerResult<(Vec<StoredEvent>, bool)> {
        let limit = if query.limit == 0 {
            1000
        } else {
            query.limit.min(constants::EVENT_QUERY_HARD_CAP)
        };

        let mut rows: Vec<StoredEvent> = Vec::new();
        let mut remaining_offset = query.offset;
        let mut truncated = false;

        for (date, path) in self.segments()? {
            if !segment_in_range(date, query.start_ms, query.end_ms) {
                continue;
            }
            let conn = if date == self.day {
                None // use the live connection
            } else {
                Some(
                    Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                        .map_err(|e| {
                            BrokerError::Persistence(format!(
                                "open segment {}: {e}",
                                path.display()
                            ))
                        })?,
                )
            };
            let conn_ref = conn.as_ref().unwrap_or(&self.conn);

            if rows.len() >= limit {
                // The window is full; the flag only needs to know whether
                // any matching row was left behind.
                if count_matching(conn_ref, query)? > 0 {
                    truncated = true;
                    break;
                }
                continue;
            }

            let want = limit - rows.len();
            let (mut segment_rows, cursor) =
                query_segment(conn_ref, query, want, remaining_offset)?;
            // The offset consumes matching rows that were skipped, not
            // returned; query_segment reports how many it absorbed.
            remaining_offset = remaining_offset.saturating_sub(cursor.skipped);
            truncated = truncated || cursor.more;
            rows.append(&mut segment_rows);
        }
        Ok((rows, truncated))
    }

    /// Aggregate statistics across every segment on disk.
    pub fn statistics(&mut self) -> BrokerResult<StoreStatistics> {
        let mut stats = StoreStatistics::default();
        for (date, path) in self.segments()? {
            stats.segment_count += 1;
            stats.disk_bytes += file_size(&path);
            stats.disk_bytes += file_size(&path.with_extension("db-wal"));
            stats.disk_bytes += file_size(&path.with_extension("db-shm"));

            let other;
            let conn_ref: &Connection = if date == self.day {
                &self.conn
            } else {
                match Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
                    Ok(conn) => {
                        other = conn;
                        &other
                    }
                    Err(e) => {
                        log::warn!("statistics: open {} failed: {e}", path.display());
                        continue;
                    }
                }
            };
            let row = conn_ref.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT control_path), COUNT(DISTINCT group_id), \
                 MIN(ts_ms), MAX(ts_ms) FROM events",
                [],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            );
            if let Ok((total, controls, groups, oldest, newest)) = row {
                stats.total_events += total;
                // Distinct counts are per-segment; the max across days
                // undercounts slightly but never double-counts a control
                // that appears every day. Fine for an operational stat.
                stats.unique_controls = stats.unique_controls.max(controls);
                stats.unique_groups = stats.unique_groups.max(groups);
                stats.oldest_ms = match (stats.oldest_ms, oldest) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                stats.newest_ms = match (stats.newest_ms, newest) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        Ok(stats)
    }

    /// Delete segments older than `retention_days` and vacuum the
    /// current one.
    pub fn run_maintenance(&mut self, retention_days: u32) -> BrokerResult<MaintenanceReport> {
        let cutoff = Utc::now().date_naive() - chrono::Days::new(u64::from(retention_days));
        let mut deleted = 0;
        for (date, path) in self.segments()? {
            if date < cutoff && date != self.day {
                log::info!("retention: deleting segment {}", path.display());
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("retention: delete {} failed: {e}", path.display());
                    continue;
                }
                // Journal leftovers go with the segment.
                let _ = fs::remove_file(path.with_extension("db-wal"));
                let _ = fs::remove_file(path.with_extension("db-shm"));
                deleted += 1;
            }
        }
        let vacuumed = match self.conn.execute_batch("VACUUM") {
            Ok(()) => true,
            Err(e) => {
                log::warn!("vacuum failed: {e}");
                false
            }
        };
        Ok(MaintenanceReport {
            deleted_segments: deleted,
            vacuumed,
        })
    }

    /// Roll to a new segment when the UTC day has changed.
    fn rotate_if_needed(&mut self) -> BrokerResult<()> {
        let today = Utc::now().date_naive();
        if today == self.day {
            return Ok(());
        }
        log::info!("rotating event segment: {} -> {today}", self.day);
        let conn = open_segment(&segment_path(&self.dir, today))?;
        self.conn = conn;
        self.day = today;
        Ok(())
    }

    /// Every segment on disk, ascending by date.
    fn segments(&self) -> BrokerResult<Vec<(NaiveDate, PathBuf)>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| BrokerError::Persistence(format!("read event dir: {e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(date) = parse_segment_name(name) {
                out.push((date, path));
            }
        }
        out.sort_by_key(|(date, _)| *date);
        Ok(out)
    }
}

/// Offset/truncation bookkeeping returned by [`query_segment`].
struct SegmentCursor {
    /// Matching rows skipped by the offset within this segment.
    skipped: usize,
    /// More matching rows existed beyond the requested window.
    more: bool,
}

/// Query one segment, applying filters, offset, and a row cap.
fn query_segment(
    conn: &Connection,
    query: &EventQuery,
    want: usize,
    offset: usize,
) -> BrokerResult<(Vec<StoredEvent>, SegmentCursor)> {
    let mut sql = String::from(
        "SELECT id, ts_ms, group_id, control_path, component_name, control_name, \
         value_json, prev_value_json, source FROM events WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(start) = query.start_ms {
        sql.push_str(" AND ts_ms >= ?");
        args.push(Box::new(start));
    }
    if let Some(end) = query.end_ms {
        sql.push_str(" AND ts_ms <= ?");
        args.push(Box::new(end));
    }
    if let Some(group) = &query.group_id {
        sql.push_str(" AND group_id = ?");
        args.push(Box::new(group.clone()));
    }
    if !query.control_names.is_empty() {
        sql.push_str(" AND control_path IN (");
        sql.push_str(&vec!["?"; query.control_names.len()].join(","));
        sql.push(')');
        for name in &query.control_names {
            args.push(Box::new(name.clone()));
        }
    }
    if !query.component_names.is_empty() {
        sql.push_str(" AND component_name IN (");
        sql.push_str(&vec!["?"; query.component_names.len()].join(","));
        sql.push(')');
        for name in &query.component_names {
            args.push(Box::new(name.clone()));
        }
    }
    // Fetch one extra row to detect truncation.
    sql.push_str(" ORDER BY ts_ms ASC, id ASC LIMIT ? OFFSET ?");
    args.push(Box::new((want + 1) as i64));
    args.push(Box::new(offset as i64));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| BrokerError::Persistence(format!("prepare query: {e}")))?;
    let mapped = stmt
        .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok(StoredEvent {
                id: row.get(0)?,
                timestamp_ms: row.get(1)?,
                group_id: row.get(2)?,
                control_path: row.get(3)?,
                component_name: row.get(4)?,
                control_name: row.get(5)?,
                value: serde_json::from_str(&row.get::<_, String>(6)?)
                    .unwrap_or(Value::Null),
                previous_value: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                source: row.get(8)?,
            })
        })
        .map_err(|e| BrokerError::Persistence(format!("run query: {e}")))?;

    let mut rows = Vec::new();
    for row in mapped {
        rows.push(row.map_err(|e| BrokerError::Persistence(format!("read row: {e}")))?);
    }

    // The offset rows were consumed by SQL, but the caller needs to know
    // how many matched here to adjust the offset for later segments. If
    // we got any rows back, this segment absorbed the entire remaining
    // offset; otherwise it may have had fewer matches than the offset,
    // which the cheap COUNT below resolves.
    let skipped = if rows.is_empty() && offset > 0 {
        count_matching(conn, query).unwrap_or(0).min(offset)
    } else {
        offset
    };

    let more = rows.len() > want;
    rows.truncate(want);
    Ok((rows, SegmentCursor { skipped, more }))
}

/// Count rows matching the filters (offset correction path only).
fn count_matching(conn: &Connection, query: &EventQuery) -> BrokerResult<usize> {
    let mut sql = String::from("SELECT COUNT(*) FROM events WHERE 1=1");
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(start) = query.start_ms {
        sql.push_str(" AND ts_ms >= ?");
        args.push(Box::new(start));
    }
    if let Some(end) = query.end_ms {
        sql.push_str(" AND ts_ms <= ?");
        args.push(Box::new(end));
    }
    if let Some(group) = &query.group_id {
        sql.push_str(" AND group_id = ?");
        args.push(Box::new(group.clone()));
    }
    if !query.control_names.is_empty() {
        sql.push_str(" AND control_path IN (");
        sql.push_str(&vec!["?"; query.control_names.len()].join(","));
        sql.push(')');
        for name in &query.control_names {
            args.push(Box::new(name.clone()));
        }
    }
    if !query.component_names.is_empty() {
        sql.push_str(" AND component_name IN (");
        sql.push_str(&vec!["?"; query.component_names.len()].join(","));
        sql.push(')');
        for name in &query.component_names {
            args.push(Box::new(name.clone()));
        }
    }
    conn.query_row(
        &sql,
        params_from_iter(args.iter().map(|a| a.as_ref())),
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as usize)
    .map_err(|e| BrokerError::Persistence(format!("count query: {e}")))
}

/// `events-YYYY-MM-DD.db` for a date.
fn segment_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("events-{}.db", date.format("%Y-%m-%d")))
}

/// Parse a segment filename back into its date.
fn parse_segment_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix("events-")?.strip_suffix(".db")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Whether a segment's day can contain rows in [start, end].
fn segment_in_range(date: NaiveDate, start_ms: Option<i64>, end_ms: Option<i64>) -> bool {
    let day_start = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(i64::MIN);
    let day_end = day_start + 24 * 3600 * 1000 - 1;
    if let Some(end) = end_ms {
        if day_start > end {
            return false;
        }
    }
    if let Some(start) = start_ms {
        if day_end < start {
            return false;
        }
    }
    true
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Open (or create) one segment with the schema, indexes, and pragmas.
fn open_segment(path: &Path) -> BrokerResult<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| BrokerError::Persistence(format!("open {}: {e}", path.display())))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -10240;
         CREATE TABLE IF NOT EXISTS events (
             id              INTEGER PRIMARY KEY AUTOINCREMENT,
             ts_ms           INTEGER NOT NULL,
             group_id        TEXT NOT NULL,
             control_path    TEXT NOT NULL,
             component_name  TEXT NOT NULL,
             control_name    TEXT NOT NULL,
             value_json      TEXT NOT NULL,
             prev_value_json TEXT,
             source          TEXT NOT NULL,
             created_ms      INTEGER NOT NULL
                 DEFAULT (CAST(strftime('%s','now') AS INTEGER) * 1000)
         );
         CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts_ms DESC);
         CREATE INDEX IF NOT EXISTS idx_events_group ON events (group_id, ts_ms DESC);
         CREATE INDEX IF NOT EXISTS idx_events_control ON events (control_path, ts_ms DESC);
         CREATE INDEX IF NOT EXISTS idx_events_component ON events (component_name, ts_ms DESC);",
    )
    .map_err(|e| BrokerError::Persistence(format!("initialize {}: {e}", path.display())))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts_ms: i64, group: &str, path: &str, value: &str) -> EventRow {
        let (component, control) = path.split_once('.').expect("qualified path");
        EventRow {
            ts_ms,
            group_id: group.to_string(),
            control_path: path.to_string(),
            component_name: component.to_string(),
            control_name: control.to_string(),
            value_json: value.to_string(),
            prev_value_json: None,
            source: "poll",
        }
    }

    #[test]
    fn test_open_creates_directory_and_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("events/broker");
        let store = EventStore::open(&nested).expect("open");
        assert!(nested.exists());
        let segments = store.segments().expect("segments");
        assert_eq!(segments.len(), 1);
        assert!(segments[0]
            .1
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name")
            .starts_with("events-"));
    }

    #[test]
    fn test_insert_and_query_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EventStore::open(dir.path()).expect("open");
        store
            .insert_batch(&[
                row(1000, "g1", "Gain1.gain", "-20.0"),
                row(2000, "g1", "Gain1.mute", "true"),
                row(3000, "g2", "Mixer.out1.gain", "0.0"),
            ])
            .expect("insert");

        let (rows, truncated) = store.query(&EventQuery::default()).expect("query");
        assert!(!truncated);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].timestamp_ms, 1000, "ascending order");
        assert_eq!(rows[0].value, serde_json::json!(-20.0));
        assert_eq!(rows[1].value, serde_json::json!(true));
        assert_eq!(rows[2].component_name, "Mixer");
        assert_eq!(rows[2].control_name, "out1.gain");
    }

    #[test]
    fn test_query_filters_by_group_and_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EventStore::open(dir.path()).expect("open");
        store
            .insert_batch(&[
                row(1000, "g1", "Gain1.gain", "1"),
                row(2000, "g2", "Gain1.gain", "2"),
                row(3000, "g1", "Gain1.gain", "3"),
            ])
            .expect("insert");

        let (rows, _) = store
            .query(&EventQuery {
                group_id: Some("g1".to_string()),
                ..EventQuery::default()
            })
            .expect("query");
        assert_eq!(rows.len(), 2);

        let (rows, _) = store
            .query(&EventQuery {
                start_ms: Some(1500),
                end_ms: Some(2500),
                ..EventQuery::default()
            })
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_id, "g2");
    }

    #[test]
    fn test_query_filters_by_control_and_component() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EventStore::open(dir.path()).expect("open");
        store
            .insert_batch(&[
                row(1000, "g1", "Gain1.gain", "1"),
                row(2000, "g1", "Gain1.mute", "true"),
                row(3000, "g1", "Mixer.out1.gain", "0"),
            ])
            .expect("insert");

        let (rows, _) = store
            .query(&EventQuery {
                control_names: vec!["Gain1.mute".to_string()],
                ..EventQuery::default()
            })
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].control_path, "Gain1.mute");

        let (rows, _) = store
            .query(&EventQuery {
                component_names: vec!["Mixer".to_string()],
                ..EventQuery::default()
            })
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].component_name, "Mixer");
    }

    #[test]
    fn test_limit_and_offset_with_truncation_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EventStore::open(dir.path()).expect("open");
        let rows: Vec<EventRow> = (0..10)
            .map(|i| row(1000 + i, "g1", "Gain1.gain", &format!("{i}")))
            .collect();
        store.insert_batch(&rows).expect("insert");

        let (page, truncated) = store
            .query(&EventQuery {
                limit: 4,
                offset: 2,
                ..EventQuery::default()
            })
            .expect("query");
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].timestamp_ms, 1002);
        assert!(truncated, "more rows existed beyond the window");

        let (page, truncated) = store
            .query(&EventQuery {
                limit: 100,
                offset: 8,
                ..EventQuery::default()
            })
            .expect("query");
        assert_eq!(page.len(), 2);
        assert!(!truncated);
    }

    #[test]
    fn test_limit_capped_at_hard_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EventStore::open(dir.path()).expect("open");
        // The cap applies even when the caller asks for more.
        let (rows, _) = store
            .query(&EventQuery {
                limit: constants::EVENT_QUERY_HARD_CAP + 5000,
                ..EventQuery::default()
            })
            .expect("query");
        assert!(rows.len() <= constants::EVENT_QUERY_HARD_CAP);
    }

    #[test]
    fn test_statistics_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EventStore::open(dir.path()).expect("open");
        store
            .insert_batch(&[
                row(1000, "g1", "Gain1.gain", "1"),
                row(2000, "g1", "Gain1.mute", "true"),
                row(3000, "g2", "Gain1.gain", "2"),
            ])
            .expect("insert");
        let stats = store.statistics().expect("stats");
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.unique_controls, 2);
        assert_eq!(stats.unique_groups, 2);
        assert_eq!(stats.oldest_ms, Some(1000));
        assert_eq!(stats.newest_ms, Some(3000));
        assert!(stats.disk_bytes > 0);
        assert_eq!(stats.segment_count, 1);
    }

    #[test]
    fn test_maintenance_deletes_old_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EventStore::open(dir.path()).expect("open");

        // Fabricate an ancient segment on disk.
        let old = segment_path(dir.path(), NaiveDate::from_ymd_opt(2020, 1, 1).expect("date"));
        drop(open_segment(&old).expect("create old segment"));
        assert_eq!(store.segments().expect("segments").len(), 2);

        let report = store.run_maintenance(7).expect("maintenance");
        assert_eq!(report.deleted_segments, 1);
        assert!(report.vacuumed);
        assert_eq!(store.segments().expect("segments").len(), 1);
    }

    #[test]
    fn test_segment_name_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).expect("date");
        let path = segment_path(Path::new("/tmp/events"), date);
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("events-2026-08-01.db")
        );
        assert_eq!(parse_segment_name("events-2026-08-01.db"), Some(date));
        assert_eq!(parse_segment_name("events-garbage.db"), None);
        assert_eq!(parse_segment_name("other.db"), None);
    }

    #[test]
    fn test_segment_in_range_filtering() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).expect("date");
        let day_start = date
            .and_hms_opt(0, 0, 0)
            .expect("time")
            .and_utc()
            .timestamp_millis();
        assert!(segment_in_range(date, None, None));
        assert!(segment_in_range(date, Some(day_start), None));
        assert!(!segment_in_range(date, Some(day_start + 86_400_000), None));
        assert!(!segment_in_range(date, None, Some(day_start - 1)));
    }
}
