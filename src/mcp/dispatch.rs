//! Tool dispatch pipeline: rate limit → authenticate → validate → execute
//! → audit.
//!
//! Parameter validation happens inside each handler (field-level errors
//! from the `schema` module); everything before the handler is uniform
//! across tools and lives here.

use std::collections::HashSet;
use std::time::Instant;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::DispatcherConfig;
use crate::error::{BrokerError, BrokerResult};

use super::audit::{AuditRecord, AuditRing};
use super::rate_limit::RateLimiter;
use super::tools::{self, ToolContext};

/// Who is calling, as far as the transport can tell.
///
/// stdio has no headers; callers identify themselves through the MCP
/// `_meta` object on the call params. Absent identity is "anonymous",
/// which only passes for allowlisted tools.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    /// Display id for rate limiting and audit.
    pub id: String,
    /// Presented API token, if any.
    pub token: Option<String>,
}

impl CallerIdentity {
    /// Extract identity from the call params' `_meta` object.
    #[must_use]
    pub fn from_params(params: &Value) -> Self {
        let meta = params.get("_meta");
        let id = meta
            .and_then(|m| m.get("caller"))
            .and_then(Value::as_str)
            .unwrap_or("anonymous")
            .to_string();
        let token = meta
            .and_then(|m| m.get("apiToken"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { id, token }
    }
}

/// The dispatcher: per-caller limiter, credential set, audit ring.
pub struct Dispatcher {
    cfg: DispatcherConfig,
    limiter: RateLimiter,
    audit: AuditRing,
    registered: HashSet<&'static str>,
}

impl Dispatcher {
    /// Build from config, registering the full tool catalogue.
    #[must_use]
    pub fn new(cfg: DispatcherConfig) -> Self {
        let limiter = RateLimiter::new(cfg.rate_limit_rpm, cfg.rate_limit_burst);
        let audit = AuditRing::new(cfg.audit_capacity.max(1));
        let registered = tools::catalog().iter().map(|t| t.id).collect();
        Self {
            cfg,
            limiter,
            audit,
            registered,
        }
    }

    /// Run one tool call through the full pipeline.
    pub async fn dispatch(
        &mut self,
        ctx: &mut ToolContext<'_>,
        caller: &CallerIdentity,
        tool: &str,
        params: &Value,
    ) -> BrokerResult<Value> {
        if !self.registered.contains(tool) {
            return Err(BrokerError::UnknownMethod(tool.to_string()));
        }

        if let Err(retry_after_ms) = self.limiter.check(&caller.id) {
            // Rate-limit rejections are audited too — a misbehaving
            // agent shows up in the ring even when nothing executes.
            self.audit.push(AuditRecord {
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                caller: caller.id.clone(),
                tool: tool.to_string(),
                success: false,
                duration_ms: 0,
                error_code: Some(1005),
            });
            return Err(BrokerError::RateLimit {
                retry_after_ms,
                limit_rpm: self.limiter.rpm(),
            });
        }

        if let Err(e) = self.authenticate(caller, tool) {
            self.audit.push(AuditRecord {
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                caller: caller.id.clone(),
                tool: tool.to_string(),
                success: false,
                duration_ms: 0,
                error_code: Some(e.code()),
            });
            return Err(e);
        }

        let started = Instant::now();
        let result = tools::dispatch(ctx, tool, params).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (success, error_code) = match &result {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.code())),
        };
        self.audit.push(AuditRecord {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            caller: caller.id.clone(),
            tool: tool.to_string(),
            success,
            duration_ms,
            error_code,
        });
        match &result {
            Ok(_) => log::debug!(
                "tool {tool} ok caller={} duration_ms={duration_ms}",
                caller.id
            ),
            Err(e) => log::warn!(
                "tool {tool} failed caller={} duration_ms={duration_ms} code={} kind={}",
                caller.id,
                e.code(),
                e.kind()
            ),
        }
        result
    }

    /// Validate the caller's credential for this tool.
    ///
    /// Tokens are compared by SHA-256 digest; plaintext never touches
    /// the config. Anonymous callers pass only for allowlisted tools.
    fn authenticate(&self, caller: &CallerIdentity, tool: &str) -> BrokerResult<()> {
        // No credentials provisioned at all: open broker (lab setups).
        if self.cfg.auth_tokens_hashed.is_empty() {
            return Ok(());
        }
        if let Some(token) = &caller.token {
            let digest = hex_sha256(token);
            if self
                .cfg
                .auth_tokens_hashed
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&digest))
            {
                return Ok(());
            }
            return Err(BrokerError::Auth("invalid API token".to_string()));
        }
        if self.cfg.anonymous_allow.iter().any(|t| t == tool) {
            return Ok(());
        }
        Err(BrokerError::Auth(format!(
            "tool '{tool}' requires an API token"
        )))
    }

    /// The most recent audit records, newest last.
    #[must_use]
    pub fn audit_recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.audit.recent(limit)
    }

    /// Drop fully-refilled limiter buckets (periodic housekeeping).
    pub fn prune_limiter(&mut self) {
        self.limiter.prune();
    }
}

/// Lowercase hex SHA-256 of a token.
fn hex_sha256(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
