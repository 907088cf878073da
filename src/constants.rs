//! Application-wide constants for qsys-broker.
//!
//! This module centralizes all magic numbers and configuration constants
//! to improve maintainability and discoverability. Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Timeouts**: Command and connection deadlines
//! - **Reconnection**: Backoff schedule for the core link
//! - **Change groups**: Polling limits
//! - **Event store**: Buffering and retention defaults

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Server name reported in the MCP `initialize` handshake.
pub const SERVER_NAME: &str = "qsys-broker";

/// Path component of the Q-SYS remote-control WebSocket endpoint.
pub const QRC_ENDPOINT_PATH: &str = "/qrc-public-api/v0";

// ============================================================================
// Timeouts
// ============================================================================

/// Default deadline for a single command to the core.
///
/// Most Q-SYS commands answer within tens of milliseconds on a LAN;
/// 5 seconds covers status queries on a busy core without letting a
/// wedged link stall the tool pipeline indefinitely.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard upper bound for a configured command timeout.
///
/// Anything longer than 30 seconds would hold the single task queue
/// hostage; configuration values above this are clamped.
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of send attempts inside `send_command` for retryable failures.
pub const COMMAND_SEND_ATTEMPTS: u32 = 3;

// ============================================================================
// Reconnection & heartbeat
// ============================================================================

/// Base delay for the exponential reconnect backoff.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Cap for the exponential reconnect backoff.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Short-term reconnect attempts before switching to long-term mode.
///
/// Ten attempts with the capped exponential schedule span roughly two
/// minutes — long enough to ride out a core reboot.
pub const RECONNECT_SHORT_TERM_ATTEMPTS: u32 = 10;

/// Fixed retry interval once short-term attempts are exhausted.
///
/// Long-term mode retries forever at this pace until `disconnect()` is
/// called, so a core that comes back hours later is still picked up.
pub const RECONNECT_LONG_TERM_INTERVAL: Duration = Duration::from_secs(60);

/// Default keep-alive interval for the core link.
///
/// The core drops idle QRC sessions after 60 seconds; a 30-second
/// heartbeat keeps the session alive with margin for one lost beat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive heartbeat failures treated as a disconnect.
pub const HEARTBEAT_FAILURE_LIMIT: u32 = 2;

// ============================================================================
// Circuit breaker
// ============================================================================

/// Consecutive command failures that open the breaker.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Cool-down before the breaker admits a half-open probe.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(10);

/// Longer cool-down applied when the half-open probe fails.
pub const BREAKER_REOPEN_COOLDOWN: Duration = Duration::from_secs(30);

// ============================================================================
// Change groups
// ============================================================================

/// Maximum control names accepted by a single batch get/set or group add.
pub const MAX_BATCH_CONTROLS: usize = 100;

/// Minimum auto-poll rate in seconds.
///
/// 20 Hz is already faster than the core refreshes most meters;
/// anything below this would only burn the link.
pub const MIN_AUTO_POLL_RATE_SECS: f64 = 0.05;

/// Consecutive auto-poll failures that stop a group's timer.
pub const AUTO_POLL_FAILURE_LIMIT: u32 = 10;

// ============================================================================
// Event store
// ============================================================================

/// Default write-buffer size before a flush is forced.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1000;

/// Default flush interval for the write buffer.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Default retention for daily event segments, in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// High-water multiplier: buffer length beyond `size * this` sheds oldest.
pub const BUFFER_HIGH_WATER_MULTIPLIER: usize = 10;

/// Hard cap on rows returned by a single event query.
pub const EVENT_QUERY_HARD_CAP: usize = 10_000;

/// Maximum flush retries before buffered events are dropped.
pub const FLUSH_RETRY_LIMIT: u32 = 3;

// ============================================================================
// Dispatcher
// ============================================================================

/// Default rate-limit: requests per minute per caller.
pub const DEFAULT_RATE_LIMIT_RPM: u32 = 60;

/// Default token-bucket burst capacity per caller.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 10;

/// Capacity of the in-memory audit ring.
pub const AUDIT_RING_CAPACITY: usize = 1000;

/// Connection-history ring capacity (state transitions with reasons).
pub const CONNECTION_HISTORY_CAPACITY: usize = 100;
