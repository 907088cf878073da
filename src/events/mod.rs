//! Change-event persistence: buffered recorder over daily SQLite segments.

pub mod recorder;
pub mod store;

pub use recorder::{EventRecorder, RecorderStatistics};
pub use store::{EventQuery, EventStore, StoredEvent};
