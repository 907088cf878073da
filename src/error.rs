//! Typed error taxonomy for the broker.
//!
//! Every component boundary returns [`BrokerError`] so that callers can
//! branch on kind without string matching, and so the MCP dispatcher can
//! map failures onto stable JSON-RPC error objects. Codes are part of the
//! public contract and must not change between releases.
//!
//! # Propagation policy
//!
//! - `Connection` and `Timeout` are retried locally by the core client
//!   with capped backoff; after exhaustion they surface unchanged.
//! - `CircuitOpen` bypasses retries entirely (fast fail).
//! - `Persistence` disables recording but never affects control paths.
//! - `Internal` always carries a correlation id that also appears in the
//!   structured log line, so a user-visible failure can be joined back
//!   to the stderr log.

use serde_json::{json, Value};
use thiserror::Error;

/// Domain error carried across all component boundaries.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Core link not available or reconnect failing.
    #[error("core connection unavailable: {0}")]
    Connection(String),

    /// Command exceeded its deadline.
    #[error("command timed out after {timeout_ms}ms: {method}")]
    Timeout {
        /// Command that timed out.
        method: String,
        /// Deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// Circuit breaker open, request fast-failed without touching the core.
    #[error("circuit breaker open; retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Milliseconds until the next half-open probe is admitted.
        retry_after_ms: u64,
    },

    /// Missing or invalid credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Caller exceeded the token bucket.
    #[error("rate limit exceeded; retry after {retry_after_ms}ms")]
    RateLimit {
        /// Milliseconds until a token becomes available.
        retry_after_ms: u64,
        /// Bucket refill rate, requests per minute.
        limit_rpm: u32,
    },

    /// Parameter schema mismatch.
    #[error("invalid params: {field}: {reason}")]
    Validation {
        /// Dotted path of the offending field.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Tool id not registered, or core method not in the QRC catalogue.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Referenced component absent from the discovery cache.
    #[error("unknown component: {0}")]
    UnknownComponent(String),

    /// Referenced control absent from the control index.
    #[error("unknown control: {0}")]
    UnknownControl(String),

    /// Referenced change group does not exist.
    #[error("unknown change group: {0}")]
    UnknownGroup(String),

    /// Event store unavailable or a write failed.
    #[error("event store failure: {0}")]
    Persistence(String),

    /// Operation invalid for the current state.
    #[error("invalid state: {0}")]
    State(String),

    /// Anything else. The correlation id also appears in the log.
    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        /// UUID joining this failure to its stderr log line.
        correlation_id: String,
        /// Description, never shown raw to agents without the id.
        message: String,
    },
}

impl BrokerError {
    /// Construct an [`BrokerError::Internal`] with a fresh correlation id,
    /// logging the full message at error level.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        log::error!("internal error [{correlation_id}]: {message}");
        Self::Internal {
            correlation_id,
            message,
        }
    }

    /// Stable numeric code for this error kind.
    ///
    /// These are the positive domain codes from the public contract;
    /// JSON-RPC transport-level codes (-32700 etc.) are handled by the
    /// dispatcher before an error of this type ever exists.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Connection(_) => 1001,
            Self::Timeout { .. } => 1002,
            Self::CircuitOpen { .. } => 1003,
            Self::Auth(_) => 1004,
            Self::RateLimit { .. } => 1005,
            Self::Validation { .. } => 1006,
            Self::UnknownMethod(_) => 1007,
            Self::UnknownComponent(_) => 1008,
            Self::UnknownControl(_) => 1009,
            Self::UnknownGroup(_) => 1010,
            Self::Persistence(_) => 1011,
            Self::State(_) => 1012,
            Self::Internal { .. } => 1013,
        }
    }

    /// Short machine-readable kind tag for the JSON-RPC `data` payload.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Auth(_) => "auth",
            Self::RateLimit { .. } => "rate_limit",
            Self::Validation { .. } => "validation",
            Self::UnknownMethod(_) => "unknown_method",
            Self::UnknownComponent(_) => "unknown_component",
            Self::UnknownControl(_) => "unknown_control",
            Self::UnknownGroup(_) => "unknown_group",
            Self::Persistence(_) => "persistence",
            Self::State(_) => "state",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether the core client may retry this failure inside a single
    /// `send_command` call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }

    /// Render as a JSON-RPC error object (`code`, `message`, `data`).
    #[must_use]
    pub fn to_jsonrpc(&self) -> Value {
        let mut data = json!({ "kind": self.kind() });
        match self {
            Self::RateLimit {
                retry_after_ms,
                limit_rpm,
            } => {
                data["retryAfterMs"] = json!(retry_after_ms);
                data["limitRpm"] = json!(limit_rpm);
            }
            Self::CircuitOpen { retry_after_ms } => {
                data["retryAfterMs"] = json!(retry_after_ms);
            }
            Self::Validation { field, reason } => {
                data["field"] = json!(field);
                data["reason"] = json!(reason);
            }
            Self::Internal { correlation_id, .. } => {
                data["correlationId"] = json!(correlation_id);
            }
            _ => {}
        }
        json!({
            "code": self.code(),
            "message": self.to_string(),
            "data": data,
        })
    }
}

/// Convenience alias used throughout the crate.
pub type BrokerResult<T> = Result<T, BrokerError>;
