//! The broker runtime: one loop that owns every component.
//!
//! All tool dispatch, adapter work, change-group logic, and event
//! recording run on this single task queue. The only true I/O points
//! are the core WebSocket (owned by the client's link task), stdio,
//! and the SQLite store; everything else is message passing into this
//! loop.
//!
//! ```text
//! stdin ──reader task──► line channel ─┐
//! core link ──────────► CoreEvent ─────┤
//! engine ─────────────► EngineEvent ───┼──► select loop ──► stdout
//! auto-poll timers ───► group ticks ───┤        │
//! flush / maintenance timers ──────────┘        ▼
//!                                      adapter / recorder / dispatcher
//! ```
//!
//! Ordering: requests are processed one at a time in arrival order, so
//! a reconnect's cache rebuild always completes before any queued tool
//! call touches the adapter.

// Rust guideline compliant 2026-02

use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::adapter::QsysAdapter;
use crate::changegroup::{ChangeGroupEngine, EngineEvent};
use crate::config::Config;
use crate::core::{ConnectionHistory, CoreClient, CoreEvent};
use crate::error::BrokerError;
use crate::events::EventRecorder;
use crate::mcp::dispatch::{CallerIdentity, Dispatcher};
use crate::mcp::tools::ToolContext;
use crate::mcp::{self, RpcRequest};

/// The assembled broker.
pub struct Broker {
    config: Config,
    adapter: QsysAdapter,
    recorder: EventRecorder,
    dispatcher: Dispatcher,
    history: ConnectionHistory,
    core_events: mpsc::UnboundedReceiver<CoreEvent>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    poll_ticks: mpsc::UnboundedReceiver<String>,
    started_at: Instant,
}

impl Broker {
    /// Assemble the broker from validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let url = config.connection.url();
        Self::with_core_url(config, url)
    }

    /// Assemble with an explicit core URL (tests point this at an
    /// in-process mock core over `ws://`).
    #[must_use]
    pub fn with_core_url(config: Config, url: String) -> Self {
        let (core_tx, core_events) = mpsc::unbounded_channel();
        let (emit_tx, engine_events) = mpsc::unbounded_channel();
        let (tick_tx, poll_ticks) = mpsc::unbounded_channel();

        let client = CoreClient::with_url(config.connection.clone(), url, core_tx);
        let engine = ChangeGroupEngine::new(emit_tx, tick_tx);
        let adapter = QsysAdapter::new(client, engine);
        let recorder = EventRecorder::new(&config.recorder);
        let dispatcher = Dispatcher::new(config.dispatcher.clone());

        Self {
            config,
            adapter,
            recorder,
            dispatcher,
            history: ConnectionHistory::default(),
            core_events,
            engine_events,
            poll_ticks,
            started_at: Instant::now(),
        }
    }

    /// Run until stdin closes or a shutdown signal arrives.
    pub async fn run(mut self) -> Result<()> {
        // First connect. Failure is not fatal when auto-reconnect is on:
        // the link task keeps trying and tools answer with typed
        // connection errors meanwhile.
        match self.adapter.client_mut().connect().await {
            // The Connected event lands in core_events and writes the
            // history entry when the loop drains it.
            Ok(()) => {}
            Err(e) => {
                log::warn!("initial core connect failed: {e}");
                self.history.push("connecting", Some(e.to_string()));
                if !self.config.connection.auto_reconnect {
                    anyhow::bail!("core connect failed and autoReconnect is off: {e}");
                }
            }
        }

        // Pump stdin from a blocking task for the life of the process.
        // One reused line buffer; blank lines never cross the channel,
        // and what does cross is already trimmed to the bare document.
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            let mut handle = stdin.lock();
            let mut line = String::new();
            loop {
                line.clear();
                match handle.read_line(&mut line) {
                    Ok(0) => break, // EOF: agent hung up
                    Ok(_) => {
                        let doc = line.trim();
                        if doc.is_empty() {
                            continue;
                        }
                        if stdin_tx.send(doc.to_owned()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("stdin read failed: {e}");
                        break;
                    }
                }
            }
        });

        let mut stdout = io::stdout();
        let mut flush_tick = tokio::time::interval(self.recorder.flush_interval());
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let maintenance = tokio::time::sleep(next_maintenance_delay());
        tokio::pin!(maintenance);

        log::info!("broker ready; serving MCP on stdio");
        loop {
            tokio::select! {
                // Biased: lifecycle events and emissions drain before any
                // queued request runs, so a reconnect's cache rebuild
                // completes first and the recorder's monitored set is
                // current when a query arrives.
                biased;

                // Core link lifecycle and notifications.
                event = self.core_events.recv() => {
                    if let Some(event) = event {
                        self.handle_core_event(event).await;
                    }
                }

                // Engine emissions feed the recorder.
                event = self.engine_events.recv() => {
                    if let Some(event) = event {
                        self.recorder.on_engine_event(&event);
                    }
                }

                // Auto-poll timer fired for a group.
                group_id = self.poll_ticks.recv() => {
                    if let Some(group_id) = group_id {
                        self.run_auto_poll(&group_id).await;
                    }
                }

                // MCP request from the agent.
                line = stdin_rx.recv() => {
                    let Some(line) = line else {
                        log::info!("stdin closed; shutting down");
                        break;
                    };
                    if let Some(response) = self.handle_line(&line).await {
                        writeln!(stdout, "{response}")?;
                        stdout.flush()?;
                    }
                }

                // Recorder flush cadence.
                _ = flush_tick.tick() => {
                    if self.recorder.flush_due() {
                        // Failures are logged inside; retry policy is the
                        // recorder's own.
                        let _ = self.recorder.flush();
                    }
                }

                // Early-morning retention + vacuum.
                () = &mut maintenance => {
                    match self.recorder.run_maintenance(self.config.recorder.retention_days) {
                        Ok(report) => log::info!(
                            "maintenance: {} segments deleted, vacuumed={}",
                            report.deleted_segments,
                            report.vacuumed
                        ),
                        Err(e) => log::warn!("maintenance failed: {e}"),
                    }
                    self.dispatcher.prune_limiter();
                    maintenance
                        .as_mut()
                        .reset(tokio::time::Instant::now() + next_maintenance_delay());
                }

                // Operator interrupt.
                _ = tokio::signal::ctrl_c() => {
                    log::info!("interrupt; shutting down");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Ordered shutdown: timers first, then the write buffer, then the
    /// core session.
    fn shutdown(&mut self) {
        self.adapter.engine_mut().cancel_all_timers();
        self.recorder.shutdown();
        self.adapter.client_mut().disconnect();
        self.history.push("shutting-down", None);
    }

    /// Process one request line; `None` for notifications.
    async fn handle_line(&mut self, line: &str) -> Option<String> {
        let request = match mcp::parse_request(line) {
            Ok(request) => request,
            Err(response) => return Some(response.to_string()),
        };
        let is_notification = request.id.is_none();
        let response = self.handle_request(request).await;
        match response {
            Some(response) if !is_notification => Some(response.to_string()),
            _ => None,
        }
    }

    /// Route one decoded request.
    async fn handle_request(&mut self, request: RpcRequest) -> Option<Value> {
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "initialize" => Some(mcp::success_response(id, mcp::initialize_result())),
            "notifications/initialized" | "notifications/cancelled" => None,
            "ping" => Some(mcp::success_response(id, json!({}))),
            "tools/list" => Some(mcp::success_response(id, mcp::tools_list_result())),
            "tools/call" => {
                let tool = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let arguments = request
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                // Caller metadata may ride on the call params or inside
                // the arguments themselves.
                let caller = if request.params.get("_meta").is_some() {
                    CallerIdentity::from_params(&request.params)
                } else {
                    CallerIdentity::from_params(&arguments)
                };
                Some(self.call_tool(id, &caller, &tool, &arguments).await)
            }
            // A registered tool id used directly as the JSON-RPC method.
            method if self.is_tool(method) => {
                let caller = CallerIdentity::from_params(&request.params);
                let method = method.to_string();
                Some(self.call_tool(id, &caller, &method, &request.params).await)
            }
            other => {
                log::debug!("unknown method '{other}'");
                Some(mcp::error_response(
                    id,
                    mcp::METHOD_NOT_FOUND,
                    &format!("Method not found: {other}"),
                ))
            }
        }
    }

    fn is_tool(&self, method: &str) -> bool {
        crate::mcp::tools::catalog().iter().any(|t| t.id == method)
    }

    /// Dispatch one tool call and shape the response.
    async fn call_tool(
        &mut self,
        id: Value,
        caller: &CallerIdentity,
        tool: &str,
        params: &Value,
    ) -> Value {
        let mut ctx = ToolContext {
            adapter: &mut self.adapter,
            recorder: &mut self.recorder,
            history: &mut self.history,
            config: &self.config,
            audit: self.dispatcher.audit_recent(50),
            started_at: self.started_at,
        };
        match self.dispatcher.dispatch(&mut ctx, caller, tool, params).await {
            Ok(result) => mcp::success_response(id, result),
            Err(e) => mcp::broker_error_response(id, &e),
        }
    }

    /// Handle one core lifecycle event.
    async fn handle_core_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Connected {
                reconnected,
                downtime_ms,
            } => {
                if reconnected {
                    self.history.push(
                        "reconnected",
                        Some(format!("outage {downtime_ms}ms")),
                    );
                    // The cache is authoritative per session: rebuild it
                    // now, before any queued tool call runs, and discard
                    // every group baseline so next polls re-baseline.
                    match self.adapter.on_reconnected().await {
                        Ok(count) => log::info!("rebuilt discovery cache: {count} components"),
                        Err(e) => log::warn!("discovery rebuild after reconnect failed: {e}"),
                    }
                    // Run polls deferred while the link was down.
                    for group_id in self.adapter.engine_mut().take_deferred() {
                        self.run_auto_poll(&group_id).await;
                    }
                } else {
                    self.history.push("connected", None);
                }
            }
            CoreEvent::Disconnected { reason } => {
                self.history.push("disconnected", Some(reason));
            }
            CoreEvent::Notification { method, params } => {
                self.adapter.apply_notification(&method, &params);
            }
        }
    }

    /// Execute one auto-poll tick for a group.
    ///
    /// While the link is down the poll is deferred (coalesced to one)
    /// and runs right after the reconnect rebuild.
    async fn run_auto_poll(&mut self, group_id: &str) {
        if !self.adapter.engine_mut().exists(group_id) {
            return; // destroyed between tick and dispatch
        }
        if !self.adapter.client().is_connected() {
            self.adapter.engine_mut().defer_poll(group_id);
            return;
        }
        match self.adapter.poll_change_group(group_id, false).await {
            Ok(event) => {
                self.adapter.engine_mut().note_auto_poll_success(group_id);
                if !event.changes.is_empty() {
                    log::debug!(
                        "auto-poll {group_id}: {} changes (seq {})",
                        event.changes.len(),
                        event.sequence
                    );
                }
            }
            Err(BrokerError::UnknownGroup(_) | BrokerError::State(_)) => {
                // Raced with destroy; the timer is already cancelled.
            }
            Err(e) => {
                log::warn!("auto-poll {group_id} failed: {e}");
                self.adapter.engine_mut().note_auto_poll_failure(group_id);
            }
        }
    }
}

/// Delay until the next 03:00 local time.
fn next_maintenance_delay() -> Duration {
    let now = chrono::Local::now();
    let Some(today) = now.date_naive().and_hms_opt(3, 0, 0) else {
        return Duration::from_secs(24 * 3600);
    };
    let next = if now.naive_local() < today {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now.naive_local())
        .to_std()
        .unwrap_or(Duration::from_secs(24 * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_maintenance_delay_is_within_a_day() {
        let delay = next_maintenance_delay();
        assert!(delay > Duration::ZERO);
        assert!(delay <= Duration::from_secs(24 * 3600));
    }
}
