//! Fixed-capacity audit ring for dispatched tool calls.
//!
//! When the ring is full, appending a record silently evicts the oldest.
//! Memory is bounded at `capacity` records regardless of call volume.
//! The ring is read-only from the outside; `manage_connection` exposes a
//! recent-records view.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

use serde::Serialize;

/// One dispatched call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Unix-ms when the call completed.
    pub timestamp_ms: i64,
    /// Caller identity ("anonymous" when none was presented).
    pub caller: String,
    /// Tool id.
    pub tool: String,
    /// True when the handler returned a result.
    pub success: bool,
    /// Wall time of the handler, in milliseconds.
    pub duration_ms: u64,
    /// Stable error code for failed calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
}

/// Fixed-capacity record ring.
pub struct AuditRing {
    records: VecDeque<AuditRecord>,
    capacity: usize,
}

impl AuditRing {
    /// Create a ring holding at most `capacity` records.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "AuditRing capacity must be > 0");
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a record, evicting the oldest when full.
    pub fn push(&mut self, record: AuditRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// The most recent `limit` records, newest last.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
