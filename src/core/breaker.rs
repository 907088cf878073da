//! Circuit breaker around outward core commands.
//!
//! Protects the broker (and the core) from hammering a failing link:
//! after [`crate::constants::BREAKER_FAILURE_THRESHOLD`] consecutive
//! command failures the breaker opens and rejects requests without
//! touching the wire. A cool-down later, one probe command is admitted;
//! its outcome decides between closing again and re-opening with a
//! longer cool-down.
//!
//! ```text
//!             N consecutive failures
//!   Closed ───────────────────────────► Open
//!     ▲                                  │ cool-down elapsed
//!     │ probe ok                         ▼
//!     └───────────────────────────── HalfOpen
//!                                        │ probe fails
//!                                        ▼
//!                                      Open (longer cool-down)
//! ```

use std::time::{Duration, Instant};

use crate::constants;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Commands flow normally.
    Closed,
    /// Commands are rejected without reaching the core.
    Open,
    /// One probe command is in flight; everything else is rejected.
    HalfOpen,
}

impl BreakerState {
    /// Human-readable label for status payloads.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Circuit breaker state machine.
///
/// Not thread-safe by design — it is owned by the core client and only
/// touched from the broker's single task queue.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
    reopen_cooldown: Duration,
    /// When the current Open period ends.
    open_until: Option<Instant>,
    /// True once the half-open probe slot has been handed out.
    probe_issued: bool,
    /// Lifetime counters for the status surface.
    opened_count: u64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            constants::BREAKER_FAILURE_THRESHOLD,
            constants::BREAKER_COOLDOWN,
            constants::BREAKER_REOPEN_COOLDOWN,
        )
    }
}

impl CircuitBreaker {
    /// Create a breaker with explicit thresholds (tests use small ones).
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration, reopen_cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold,
            cooldown,
            reopen_cooldown,
            open_until: None,
            probe_issued: false,
            opened_count: 0,
        }
    }

    /// Current state, advancing Open → HalfOpen if the cool-down elapsed.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(until) = self.open_until {
                if Instant::now() >= until {
                    self.state = BreakerState::HalfOpen;
                    self.probe_issued = false;
                    log::info!("circuit breaker: open -> half-open");
                }
            }
        }
        self.state
    }

    /// Whether a command may be issued right now.
    ///
    /// In half-open state exactly one caller gets `Ok(())` — the probe.
    /// Everyone else receives the remaining cool-down for their
    /// fast-fail error payload.
    pub fn check(&mut self) -> Result<(), u64> {
        match self.state() {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if self.probe_issued {
                    Err(self.retry_after_ms())
                } else {
                    self.probe_issued = true;
                    Ok(())
                }
            }
            BreakerState::Open => Err(self.retry_after_ms()),
        }
    }

    /// Record a successful command.
    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            log::info!("circuit breaker: probe succeeded, half-open -> closed");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.open_until = None;
        self.probe_issued = false;
    }

    /// Record a failed command, possibly opening the breaker.
    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                // Probe failed — reopen with the longer cool-down.
                self.open(self.reopen_cooldown);
                log::warn!(
                    "circuit breaker: probe failed, reopening for {:?}",
                    self.reopen_cooldown
                );
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.open(self.cooldown);
                    log::warn!(
                        "circuit breaker: {} consecutive failures, opening for {:?}",
                        self.consecutive_failures,
                        self.cooldown
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Force the breaker closed (used by `manage_connection reset`).
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.open_until = None;
        self.probe_issued = false;
    }

    /// Times the breaker has opened since process start.
    #[must_use]
    pub fn opened_count(&self) -> u64 {
        self.opened_count
    }

    fn open(&mut self, cooldown: Duration) {
        self.state = BreakerState::Open;
        self.open_until = Some(Instant::now() + cooldown);
        self.probe_issued = false;
        self.opened_count += 1;
    }

    fn retry_after_ms(&self) -> u64 {
        self.open_until
            .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0)
    }
}
