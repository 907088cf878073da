//! Core link client: the resilient secure-WebSocket session to the Q-SYS core.
//!
//! Owns connect/disconnect lifecycle, exponential-backoff reconnection,
//! heartbeat, the outstanding-call table, and the circuit breaker around
//! `send_command`.
//!
//! # Architecture
//!
//! ```text
//! CoreClient (handle, owned by the broker loop)
//!     │  LinkControl::Send { method, params, reply }
//!     ▼
//! link task ──── run_session ──── QRC socket halves (ws module)
//!     │
//!     └──► CoreEvent channel (Connected / Disconnected / Notification)
//!          consumed by the broker loop
//! ```
//!
//! The link task owns the socket for its whole life: it connects, runs a
//! session until the link drops, then sleeps out the backoff schedule and
//! reconnects — forever, until `disconnect()` is called. Commands sent
//! while the link is down fail fast with a connection error; the caller
//! (`send_command`) applies its own bounded retry on top.

// Rust guideline compliant 2026-02

pub mod breaker;
pub mod protocol;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ConnectionConfig;
use crate::constants;
use crate::error::{BrokerError, BrokerResult};
use crate::ws;
use breaker::{BreakerState, CircuitBreaker};
use protocol::CoreFrame;

/// Connection state of the core link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and none being attempted.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Session established and healthy.
    Connected,
    /// Session lost; backoff schedule running.
    Reconnecting,
    /// `disconnect()` called; no further attempts.
    ShuttingDown,
}

impl ConnectionState {
    /// Human-readable label for status payloads.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ShuttingDown => "shutting-down",
        }
    }
}

/// Snapshot of link health published by the link task.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    /// Current connection state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful session.
    pub attempts: u32,
    /// Unix-ms of the last successful connect, if any.
    pub last_success_ms: Option<i64>,
    /// Reason the last session ended, if any.
    pub last_disconnect_reason: Option<String>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_success_ms: None,
            last_disconnect_reason: None,
        }
    }
}

/// Events published by the link task to the broker loop.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A session was established.
    Connected {
        /// False for the very first session of this link.
        reconnected: bool,
        /// Outage duration when `reconnected` is true.
        downtime_ms: u64,
    },
    /// The session ended.
    Disconnected {
        /// Why the session ended.
        reason: String,
    },
    /// Unsolicited notification from the core (EngineStatus, ...).
    Notification {
        /// Notification method name.
        method: String,
        /// Notification params.
        params: Value,
    },
}

/// One connection state transition, for the history surface.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTransition {
    /// Unix-ms of the transition.
    pub timestamp_ms: i64,
    /// State entered.
    pub state: String,
    /// Reason, when one is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Bounded ring of connection transitions (`manage_connection history`).
pub struct ConnectionHistory {
    ring: VecDeque<ConnectionTransition>,
    capacity: usize,
}

impl Default for ConnectionHistory {
    fn default() -> Self {
        Self {
            ring: VecDeque::new(),
            capacity: constants::CONNECTION_HISTORY_CAPACITY,
        }
    }
}

impl ConnectionHistory {
    /// Record a transition, evicting the oldest entry when full.
    pub fn push(&mut self, state: &str, reason: Option<String>) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(ConnectionTransition {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            state: state.to_string(),
            reason,
        });
    }

    /// All recorded transitions, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<ConnectionTransition> {
        self.ring.iter().cloned().collect()
    }
}

/// Control messages from the handle into the link task.
enum LinkControl {
    /// Issue a command and route the response to `reply`.
    Send {
        method: String,
        params: Value,
        reply: oneshot::Sender<BrokerResult<Value>>,
    },
    /// Drop the current session and reconnect immediately.
    Reconnect,
    /// Close the session and stop the link task.
    Disconnect,
}

/// Why a single session ended.
enum SessionEnd {
    /// `disconnect()` was called — the link task must stop.
    Shutdown,
    /// The link dropped; reconnect per policy.
    LinkLost(String),
}

/// Handle to the core link, owned by the broker loop.
pub struct CoreClient {
    cfg: ConnectionConfig,
    url: String,
    ctl_tx: Option<mpsc::UnboundedSender<LinkControl>>,
    /// Receiver side of the current link task's status channel; replaced
    /// on every `connect()`.
    status_rx: watch::Receiver<LinkStatus>,
    event_tx: mpsc::UnboundedSender<CoreEvent>,
    breaker: CircuitBreaker,
}

impl CoreClient {
    /// Create a client for the configured core.
    ///
    /// `event_tx` receives lifecycle events and core notifications; the
    /// broker loop is the single consumer. No connection is attempted
    /// until [`CoreClient::connect`].
    #[must_use]
    pub fn new(cfg: ConnectionConfig, event_tx: mpsc::UnboundedSender<CoreEvent>) -> Self {
        let url = cfg.url();
        Self::with_url(cfg, url, event_tx)
    }

    /// Create a client targeting an explicit URL.
    ///
    /// Production uses [`CoreClient::new`]; tests point this at an
    /// in-process `ws://` mock core.
    #[must_use]
    pub fn with_url(
        cfg: ConnectionConfig,
        url: String,
        event_tx: mpsc::UnboundedSender<CoreEvent>,
    ) -> Self {
        // Placeholder channel until connect() starts a link task; the
        // receiver keeps answering with the last (default) value.
        let (_initial_tx, status_rx) = watch::channel(LinkStatus::default());
        Self {
            cfg,
            url,
            ctl_tx: None,
            status_rx,
            event_tx,
            breaker: CircuitBreaker::default(),
        }
    }

    /// Start the link task and wait for the first connection attempt.
    ///
    /// On first-attempt failure the task keeps reconnecting in the
    /// background when `auto_reconnect` is enabled, but the error is
    /// still surfaced so the caller can report it.
    pub async fn connect(&mut self) -> BrokerResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (first_tx, first_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        self.status_rx = status_rx;
        let task = LinkTask {
            cfg: self.cfg.clone(),
            url: self.url.clone(),
            status: status_tx,
            event_tx: self.event_tx.clone(),
        };
        tokio::spawn(task.run(ctl_rx, first_tx));
        self.ctl_tx = Some(ctl_tx);

        match first_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => {
                if !self.cfg.auto_reconnect {
                    self.ctl_tx = None;
                }
                Err(BrokerError::Connection(reason))
            }
            Err(_) => Err(BrokerError::Connection("link task died".to_string())),
        }
    }

    /// Stop the link task and close the session.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.ctl_tx.take() {
            let _ = tx.send(LinkControl::Disconnect);
        }
    }

    /// Drop the current session and reconnect immediately.
    pub fn force_reconnect(&self) -> BrokerResult<()> {
        match &self.ctl_tx {
            Some(tx) => {
                tx.send(LinkControl::Reconnect)
                    .map_err(|_| BrokerError::Connection("link task gone".to_string()))?;
                Ok(())
            }
            None => Err(BrokerError::State(
                "not connected; use connect instead".to_string(),
            )),
        }
    }

    /// True when a session is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().state == ConnectionState::Connected
    }

    /// Current link status snapshot.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    /// Current breaker state (advances open → half-open when due).
    pub fn breaker_state(&mut self) -> BreakerState {
        self.breaker.state()
    }

    /// Times the breaker has opened since process start.
    #[must_use]
    pub fn breaker_opened_count(&self) -> u64 {
        self.breaker.opened_count()
    }

    /// Force the breaker closed (`manage_connection reset`).
    pub fn reset_breaker(&mut self) {
        self.breaker.reset();
    }

    /// Adjust the per-command timeout at runtime, clamped to the hard
    /// maximum. Returns the applied value in milliseconds.
    pub fn set_command_timeout_ms(&mut self, ms: u64) -> u64 {
        self.cfg.timeout_ms = ms.min(constants::MAX_COMMAND_TIMEOUT.as_millis() as u64);
        self.cfg.timeout_ms
    }

    /// Issue a command to the core.
    ///
    /// Applies, in order: catalogue validation, circuit-breaker check,
    /// then up to [`constants::COMMAND_SEND_ATTEMPTS`] attempts with
    /// capped backoff for retryable failures. Every attempt is bounded
    /// by the configured command timeout; timeouts count toward the
    /// breaker.
    pub async fn send_command(&mut self, method: &str, params: Value) -> BrokerResult<Value> {
        if !protocol::is_known_method(method) {
            return Err(BrokerError::UnknownMethod(method.to_string()));
        }
        if let Err(retry_after_ms) = self.breaker.check() {
            return Err(BrokerError::CircuitOpen { retry_after_ms });
        }

        let timeout = self.cfg.command_timeout();
        let mut last_err = BrokerError::Connection("no attempt made".to_string());
        for attempt in 0..constants::COMMAND_SEND_ATTEMPTS {
            if attempt > 0 {
                // Capped backoff between attempts: 100ms, 200ms.
                let delay = Duration::from_millis(100 << (attempt - 1).min(4));
                tokio::time::sleep(delay).await;
            }
            match self.send_once(method, params.clone(), timeout).await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    if matches!(
                        err,
                        BrokerError::Connection(_) | BrokerError::Timeout { .. }
                    ) {
                        self.breaker.record_failure();
                    } else {
                        // The core answered (auth rejection, unknown method,
                        // domain error) — the wire itself is healthy.
                        self.breaker.record_success();
                    }
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// One command attempt against the live session.
    async fn send_once(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> BrokerResult<Value> {
        let Some(ctl_tx) = &self.ctl_tx else {
            return Err(BrokerError::Connection("core link not started".to_string()));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        ctl_tx
            .send(LinkControl::Send {
                method: method.to_string(),
                params,
                reply: reply_tx,
            })
            .map_err(|_| BrokerError::Connection("link task gone".to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Connection(
                "session dropped before responding".to_string(),
            )),
            Err(_) => Err(BrokerError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// State owned by the spawned link task.
struct LinkTask {
    cfg: ConnectionConfig,
    url: String,
    status: watch::Sender<LinkStatus>,
    event_tx: mpsc::UnboundedSender<CoreEvent>,
}

impl LinkTask {
    /// Outer connect/reconnect loop.
    async fn run(
        self,
        mut ctl_rx: mpsc::UnboundedReceiver<LinkControl>,
        first_tx: oneshot::Sender<Result<(), String>>,
    ) {
        let mut first_tx = Some(first_tx);
        let mut attempts: u32 = 0;
        let mut ever_connected = false;
        let mut disconnected_at: Option<Instant> = None;

        loop {
            self.set_state(if ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            match self.open_session().await {
                Ok((tx, rx)) => {
                    attempts = 0;
                    self.status.send_modify(|s| {
                        s.state = ConnectionState::Connected;
                        s.attempts = 0;
                        s.last_success_ms = Some(chrono::Utc::now().timestamp_millis());
                    });
                    let downtime_ms = disconnected_at
                        .map(|at| at.elapsed().as_millis() as u64)
                        .unwrap_or(0);
                    let _ = self.event_tx.send(CoreEvent::Connected {
                        reconnected: ever_connected,
                        downtime_ms,
                    });
                    if ever_connected {
                        log::info!("core link re-established after {downtime_ms}ms");
                    } else {
                        log::info!("core link established: {}", self.url);
                    }
                    ever_connected = true;
                    if let Some(tx) = first_tx.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let end = self.run_session(tx, rx, &mut ctl_rx).await;
                    disconnected_at = Some(Instant::now());
                    match end {
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::ShuttingDown);
                            self.note_disconnect("disconnect requested");
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::LinkLost(reason) => {
                            log::warn!("core link lost: {reason}");
                            self.note_disconnect(&reason);
                            let _ = self.event_tx.send(CoreEvent::Disconnected { reason });
                            if !self.cfg.auto_reconnect {
                                self.set_state(ConnectionState::Disconnected);
                                return;
                            }
                        }
                    }
                }
                Err(reason) => {
                    attempts += 1;
                    self.status.send_modify(|s| s.attempts = attempts);
                    log::warn!("core connect attempt {attempts} failed: {reason}");
                    if let Some(tx) = first_tx.take() {
                        let _ = tx.send(Err(reason.clone()));
                        if !self.cfg.auto_reconnect {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }

            // Backoff wait, staying responsive to control messages.
            let delay = backoff_delay(attempts, &self.cfg);
            if !self.wait_backoff(delay, &mut ctl_rx).await {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }

    /// Connect and log on when credentials are configured.
    async fn open_session(&self) -> Result<(ws::CoreTx, ws::CoreRx), String> {
        let (mut tx, mut rx) = ws::connect(&self.url).await.map_err(|e| e.to_string())?;

        if let (Some(user), Some(pass)) = (&self.cfg.username, &self.cfg.password) {
            let logon = protocol::encode_request(
                0,
                "Logon",
                &json!({ "User": user, "Password": pass }),
            );
            tx.send_json(&logon).await.map_err(|e| e.to_string())?;
            // Await the logon response before announcing the session.
            match rx.next().await {
                ws::SocketEvent::Json(doc) => match protocol::decode_frame(&doc) {
                    Ok(CoreFrame::Response {
                        outcome: Err((code, message)),
                        ..
                    }) => return Err(format!("logon rejected ({code}): {message}")),
                    Ok(_) => {}
                    Err(e) => return Err(format!("bad logon response: {e}")),
                },
                ws::SocketEvent::Ping(_) => {
                    return Err("core pinged instead of answering logon".to_string())
                }
                ws::SocketEvent::Gone(reason) => {
                    return Err(format!("link dropped during logon: {reason}"))
                }
            }
        }
        Ok((tx, rx))
    }

    /// Run one session until the link drops or shutdown is requested.
    async fn run_session(
        &self,
        mut tx: ws::CoreTx,
        mut rx: ws::CoreRx,
        ctl_rx: &mut mpsc::UnboundedReceiver<LinkControl>,
    ) -> SessionEnd {
        // Outstanding calls in send order. Responses with a non-null id
        // are matched by id; `id: null` responses consume the oldest
        // entry (the core answers strictly in order).
        let mut pending: VecDeque<(u64, oneshot::Sender<BrokerResult<Value>>)> = VecDeque::new();
        let mut next_id: u64 = 1;
        let mut unanswered_heartbeats: u32 = 0;
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset(); // skip the immediate first tick

        loop {
            tokio::select! {
                ctl = ctl_rx.recv() => {
                    match ctl {
                        Some(LinkControl::Send { method, params, reply }) => {
                            let id = next_id;
                            next_id += 1;
                            let doc = protocol::encode_request(id, &method, &params);
                            if tx.send_json(&doc).await.is_err() {
                                let _ = reply.send(Err(BrokerError::Connection(
                                    "write to core failed".to_string(),
                                )));
                                fail_pending(&mut pending);
                                return SessionEnd::LinkLost("write failed".to_string());
                            }
                            pending.push_back((id, reply));
                        }
                        Some(LinkControl::Reconnect) => {
                            fail_pending(&mut pending);
                            return SessionEnd::LinkLost("reconnect requested".to_string());
                        }
                        Some(LinkControl::Disconnect) | None => {
                            let _ = tx.close().await;
                            fail_pending(&mut pending);
                            return SessionEnd::Shutdown;
                        }
                    }
                }

                event = rx.next() => {
                    match event {
                        ws::SocketEvent::Json(doc) => {
                            unanswered_heartbeats = 0;
                            self.handle_frame(&doc, &mut pending);
                        }
                        ws::SocketEvent::Ping(payload) => {
                            if tx.pong(payload).await.is_err() {
                                fail_pending(&mut pending);
                                return SessionEnd::LinkLost("pong write failed".to_string());
                            }
                        }
                        ws::SocketEvent::Gone(reason) => {
                            fail_pending(&mut pending);
                            return SessionEnd::LinkLost(reason);
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if unanswered_heartbeats >= constants::HEARTBEAT_FAILURE_LIMIT {
                        fail_pending(&mut pending);
                        return SessionEnd::LinkLost("heartbeat timeout".to_string());
                    }
                    let id = next_id;
                    next_id += 1;
                    let doc = protocol::encode_request(id, "NoOp", &json!({}));
                    if tx.send_json(&doc).await.is_err() {
                        fail_pending(&mut pending);
                        return SessionEnd::LinkLost("heartbeat write failed".to_string());
                    }
                    unanswered_heartbeats += 1;
                    // Heartbeats get a reply slot too so id/order
                    // correlation stays aligned; the receiver is dropped.
                    let (slot_tx, _slot_rx) = oneshot::channel();
                    pending.push_back((id, slot_tx));
                }
            }
        }
    }

    /// Decode one core frame and route it.
    fn handle_frame(
        &self,
        text: &str,
        pending: &mut VecDeque<(u64, oneshot::Sender<BrokerResult<Value>>)>,
    ) {
        match protocol::decode_frame(text) {
            Ok(CoreFrame::Response { id, outcome }) => {
                let slot = match id {
                    Some(id) => pending
                        .iter()
                        .position(|(pid, _)| *pid == id)
                        .and_then(|i| pending.remove(i)),
                    // id: null — the core answers in order.
                    None => pending.pop_front(),
                };
                let Some((_, reply)) = slot else {
                    log::debug!("unmatched core response (id {id:?})");
                    return;
                };
                let result = outcome.map_err(|(code, message)| {
                    if code == 10 || code == 11 {
                        BrokerError::Auth(message)
                    } else if code == -32601 {
                        BrokerError::UnknownMethod(message)
                    } else if protocol::is_retryable_core_error(code) {
                        BrokerError::Connection(format!("core error {code}: {message}"))
                    } else {
                        BrokerError::internal(format!("core error {code}: {message}"))
                    }
                });
                let _ = reply.send(result);
            }
            Ok(CoreFrame::Notification { method, params }) => {
                let _ = self
                    .event_tx
                    .send(CoreEvent::Notification { method, params });
            }
            Err(e) => {
                log::warn!("undecodable core frame: {e}");
            }
        }
    }

    /// Sleep out a backoff delay while staying responsive to control.
    ///
    /// Returns false when the task must stop (disconnect requested).
    async fn wait_backoff(
        &self,
        delay: Duration,
        ctl_rx: &mut mpsc::UnboundedReceiver<LinkControl>,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                ctl = ctl_rx.recv() => {
                    match ctl {
                        Some(LinkControl::Send { reply, .. }) => {
                            // Fail fast while the link is down; the caller's
                            // own retry loop decides whether to wait.
                            let _ = reply.send(Err(BrokerError::Connection(
                                "core link down (reconnecting)".to_string(),
                            )));
                        }
                        Some(LinkControl::Reconnect) => return true,
                        Some(LinkControl::Disconnect) | None => return false,
                    }
                }
                () = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn note_disconnect(&self, reason: &str) {
        self.status
            .send_modify(|s| s.last_disconnect_reason = Some(reason.to_string()));
    }
}

/// Fail every outstanding call with a connection error.
fn fail_pending(pending: &mut VecDeque<(u64, oneshot::Sender<BrokerResult<Value>>)>) {
    for (_, reply) in pending.drain(..) {
        let _ = reply.send(Err(BrokerError::Connection(
            "session ended with call outstanding".to_string(),
        )));
    }
}

/// Backoff delay for reconnect attempt `attempts` (1-based).
///
/// Exponential from the base, capped at 30 s, with ±10% jitter so a
/// fleet of brokers does not reconnect in lockstep. Past the short-term
/// attempt limit, the configured long-term interval applies instead.
fn backoff_delay(attempts: u32, cfg: &ConnectionConfig) -> Duration {
    use rand::Rng;

    let base = if attempts > constants::RECONNECT_SHORT_TERM_ATTEMPTS {
        cfg.reconnect_interval()
    } else {
        let exp = constants::RECONNECT_BASE_DELAY
            .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1).min(16)));
        exp.min(constants::RECONNECT_MAX_DELAY)
    };
    let jitter = rand::rng().random_range(0.9..1.1);
    base.mul_f64(jitter)
}
