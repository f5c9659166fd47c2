//! Child supervisor - owns the stdio child's lifecycle and the request path to it.
//!
//! Flow:
//! 1. Spawn child via the configured [`ChildSpawner`]
//! 2. Monitor task routes stdout frames to the [`Correlator`], stderr to logs
//! 3. Callers `send` requests; writes go through one FIFO-locked `FramedWrite`
//! 4. On child exit: reset handshake, fail all pending requests, apply restart policy
//!
//! Restart policy:
//!
//! ```text
//! Running --exit--> restart_count < max ? RestartScheduled --delay--> Running
//!                                       : PermanentlyStopped
//! ```
//!
//! The delay before attempt `k` is `base_backoff * k`. The counter is never
//! reset, so `max_restarts` bounds restarts for the whole life of the bridge.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::NdjsonCodec;
use crate::bridge::protocol::{
    ChildId, InboundMessage, METHOD_NOT_FOUND, RequestId, RpcRequest, error_response,
    result_response,
};
use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::handshake::Handshake;
use crate::spawner::{ChildOutputReader, ChildSpawner, ChildStdinWriter, SpawnedChild};

/// How long to wait for an exit status once the child closed stdout.
const EXIT_GRACE: Duration = Duration::from_secs(2);

type ChildWriter = FramedWrite<ChildStdinWriter, NdjsonCodec<Value>>;
type ChildReader = FramedRead<ChildOutputReader, NdjsonCodec<Value>>;

/// Lifecycle of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    NotStarted,
    Running,
    RestartScheduled,
    /// Stopped by `shutdown()`.
    Stopped,
    /// Restart budget exhausted; nothing will be spawned again.
    PermanentlyStopped,
}

/// Point-in-time view of the supervisor for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: ChildState,
    pub child_id: Option<ChildId>,
    pub pid: Option<u32>,
    pub initialized: bool,
    pub inflight_requests: usize,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
}

impl SupervisorStatus {
    pub fn is_running(&self) -> bool {
        self.child_id.is_some()
    }

    pub fn production_ready(&self) -> bool {
        self.is_running() && self.initialized
    }
}

/// Delay before restart attempt `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

#[derive(Clone)]
struct LiveChild {
    id: ChildId,
    pid: Option<u32>,
    writer: Arc<tokio::sync::Mutex<ChildWriter>>,
    stop: CancellationToken,
}

#[derive(Debug, PartialEq, Eq)]
enum ExitAction {
    Restart { attempt: u32, delay: Duration },
    GiveUp { restarts: u32 },
    Idle,
}

struct State {
    lifecycle: ChildState,
    current: Option<LiveChild>,
    restart_count: u32,
    restarting: bool,
    last_restart_at: Option<DateTime<Utc>>,
    shutting_down: bool,
}

impl State {
    fn new() -> Self {
        Self {
            lifecycle: ChildState::NotStarted,
            current: None,
            restart_count: 0,
            restarting: false,
            last_restart_at: None,
            shutting_down: false,
        }
    }

    /// Restart policy, evaluated once the current child is gone.
    fn on_death(&mut self, config: &BridgeConfig) -> ExitAction {
        if self.shutting_down {
            self.lifecycle = ChildState::Stopped;
            return ExitAction::Idle;
        }
        if self.restarting {
            return ExitAction::Idle;
        }
        if self.restart_count >= config.max_restarts {
            self.lifecycle = ChildState::PermanentlyStopped;
            return ExitAction::GiveUp {
                restarts: self.restart_count,
            };
        }
        self.restart_count += 1;
        self.restarting = true;
        self.lifecycle = ChildState::RestartScheduled;
        self.last_restart_at = Some(Utc::now());
        ExitAction::Restart {
            attempt: self.restart_count,
            delay: backoff_delay(config.base_backoff, self.restart_count),
        }
    }

    /// The child a request may be written to right now.
    fn live_child(&self, expected: Option<ChildId>) -> Result<LiveChild, BridgeError> {
        let Some(current) = self.current.as_ref() else {
            return Err(match self.lifecycle {
                ChildState::PermanentlyStopped => BridgeError::PermanentlyStopped {
                    restarts: self.restart_count,
                },
                _ if self.shutting_down => BridgeError::ShuttingDown,
                _ => BridgeError::NotRunning,
            });
        };
        if let Some(expected) = expected
            && expected != current.id
        {
            return Err(BridgeError::ProcessExited(format!(
                "child {expected} was replaced"
            )));
        }
        Ok(current.clone())
    }
}

enum MonitorEvent {
    Frame(Option<std::io::Result<Value>>),
    Exited(std::io::Result<ExitStatus>),
    Stopped,
}

/// Owns the child process and exposes a stable request path to it.
pub struct Supervisor {
    config: BridgeConfig,
    spawner: Arc<dyn ChildSpawner>,
    correlator: Arc<Correlator>,
    handshake: Handshake,
    state: StdMutex<State>,
    next_request_id: AtomicI64,
}

impl Supervisor {
    pub fn new(config: BridgeConfig, spawner: Arc<dyn ChildSpawner>) -> Arc<Self> {
        Arc::new(Self {
            config,
            spawner,
            correlator: Correlator::new(),
            handshake: Handshake::new(),
            state: StdMutex::new(State::new()),
            next_request_id: AtomicI64::new(1),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Supervisor state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Number of requests waiting for a response.
    pub fn inflight(&self) -> usize {
        self.correlator.len()
    }

    /// Spawn the first child. Once the supervisor has left `NotStarted` this
    /// only reports the current child; restarts belong to the restart policy.
    ///
    /// A spawn failure is fed into the restart policy like any other death,
    /// and also returned so the caller can log it.
    pub fn start(self: &Arc<Self>) -> Result<ChildId, BridgeError> {
        {
            let st = self.lock_state();
            if st.lifecycle != ChildState::NotStarted {
                return st.live_child(None).map(|c| c.id);
            }
        }
        self.spawn_child()
    }

    pub fn current_child(&self) -> Result<ChildId, BridgeError> {
        self.lock_state().live_child(None).map(|c| c.id)
    }

    pub fn status(&self) -> SupervisorStatus {
        let st = self.lock_state();
        let child_id = st.current.as_ref().map(|c| c.id);
        SupervisorStatus {
            state: st.lifecycle,
            child_id,
            pid: st.current.as_ref().and_then(|c| c.pid),
            initialized: child_id.is_some_and(|c| self.handshake.is_complete_for(c)),
            inflight_requests: self.correlator.len(),
            restart_count: st.restart_count,
            max_restarts: self.config.max_restarts,
            last_restart_at: st.last_restart_at,
        }
    }

    /// Wait for the handshake against the current child (see [`Handshake::ensure_ready`]).
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<ChildId, BridgeError> {
        self.handshake.ensure_ready(self).await
    }

    /// Send a request to whichever child is current, without waiting for the handshake.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, BridgeError> {
        self.dispatch(None, method, params).await
    }

    /// Send a request, but only to `child`. Fails if it has been replaced.
    pub async fn send_to(
        &self,
        child: ChildId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        self.dispatch(Some(child), method, params).await
    }

    /// Write a notification to `child`. No response is expected.
    pub async fn notify_to(
        &self,
        child: ChildId,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), BridgeError> {
        let live = self.lock_state().live_child(Some(child))?;
        tracing::debug!(%child, method, "Writing notification");
        let timeout = self.config.request_timeout;
        let write = async {
            live.writer
                .lock()
                .await
                .send(RpcRequest::notification(method, params))
                .await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(written) => written.map_err(|e| BridgeError::Write(e.to_string())),
            Err(_) => {
                tracing::warn!(%child, method, "Write to child timed out");
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn dispatch(
        &self,
        expected: Option<ChildId>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        // Registration happens under the state lock so a concurrent death
        // either sees this entry in drain_all or we see no live child.
        let (child, pending) = {
            let st = self.lock_state();
            let child = st.live_child(expected)?;
            let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst));
            let pending = self
                .correlator
                .register(id, method, self.config.request_timeout)?;
            (child, pending)
        };

        tracing::debug!(child = %child.id, request_id = %pending.id(), method, "Writing request");
        let request = RpcRequest::new(pending.id().clone(), method, params);
        // The deadline covers waiting for the writer and a child that stopped
        // reading stdin, not just the response.
        let write = async { child.writer.lock().await.send(request).await };
        let error = match tokio::time::timeout_at(pending.deadline(), write).await {
            Ok(Ok(())) => return pending.wait().await,
            Ok(Err(e)) => {
                tracing::warn!(child = %child.id, method, error = %e, "Write to child failed");
                BridgeError::Write(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    child = %child.id,
                    request_id = %pending.id(),
                    method,
                    "Write to child timed out"
                );
                pending.timeout_error()
            }
        };
        pending.cancel(error.clone());
        Err(error)
    }

    /// Stop the child for good and fail whatever is still pending.
    pub async fn shutdown(&self) {
        let child = {
            let mut st = self.lock_state();
            st.shutting_down = true;
            st.lifecycle = ChildState::Stopped;
            st.current.clone()
        };
        let drained = self.correlator.drain_all(BridgeError::ShuttingDown);
        if let Some(child) = child {
            tracing::info!(child = %child.id, drained, "Stopping child process");
            child.stop.cancel();
        }
    }

    fn spawn_child(self: &Arc<Self>) -> Result<ChildId, BridgeError> {
        if self.lock_state().shutting_down {
            return Err(BridgeError::ShuttingDown);
        }

        let spawned = match self.spawner.spawn() {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn child process");
                self.on_child_gone(None, format!("spawn failed: {e}"));
                return Err(BridgeError::Spawn(e.to_string()));
            }
        };

        let child_id = ChildId::new();
        let pid = spawned.pid();
        let SpawnedChild {
            stdin,
            stdout,
            stderr,
            process,
        } = spawned;

        let live = LiveChild {
            id: child_id,
            pid,
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                stdin,
                NdjsonCodec::new(),
            ))),
            stop: CancellationToken::new(),
        };
        let reader = FramedRead::new(stdout, NdjsonCodec::<Value>::new());
        let stop = live.stop.clone();

        let restart_count = {
            let mut st = self.lock_state();
            if st.shutting_down {
                // `process` is dropped here, which kills it.
                return Err(BridgeError::ShuttingDown);
            }
            if let Some(replaced) = st.current.replace(live) {
                tracing::warn!(child = %replaced.id, "Stopping child replaced by a new spawn");
                replaced.stop.cancel();
            }
            st.lifecycle = ChildState::Running;
            st.restarting = false;
            st.restart_count
        };
        tracing::info!(%child_id, pid, restart_count, "Child process started");

        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(child_id, stderr));
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let reason = this.run_monitor(child_id, reader, process, stop).await;
            this.on_child_gone(Some(child_id), reason);
        });

        Ok(child_id)
    }

    /// Read the child's stdout until it goes away. Returns why it went away.
    async fn run_monitor(
        &self,
        child_id: ChildId,
        mut reader: ChildReader,
        mut process: Option<Child>,
        stop: CancellationToken,
    ) -> String {
        let reason = loop {
            let event = tokio::select! {
                biased;

                _ = stop.cancelled() => MonitorEvent::Stopped,
                frame = reader.next() => MonitorEvent::Frame(frame),
                status = wait_process(&mut process) => MonitorEvent::Exited(status),
            };

            match event {
                MonitorEvent::Frame(Some(Ok(message))) => self.route_inbound(child_id, message),
                MonitorEvent::Frame(Some(Err(e))) => break format!("stdout read error: {e}"),
                MonitorEvent::Frame(None) => {
                    let status = match process.as_mut() {
                        Some(p) => tokio::time::timeout(EXIT_GRACE, p.wait()).await.ok(),
                        None => None,
                    };
                    break match status {
                        Some(Ok(status)) => format!("stdout closed, process exited ({status})"),
                        _ => "stdout closed".to_string(),
                    };
                }
                MonitorEvent::Exited(Ok(status)) => break format!("process exited ({status})"),
                MonitorEvent::Exited(Err(e)) => break format!("failed to wait for process: {e}"),
                MonitorEvent::Stopped => break "stopped by supervisor".to_string(),
            }
        };

        let dropped = reader.decoder().dropped_lines();
        if dropped > 0 {
            tracing::warn!(%child_id, dropped, "Child wrote lines that could not be decoded");
        }

        if let Some(mut p) = process.take()
            && !matches!(p.try_wait(), Ok(Some(_)))
        {
            let _ = p.start_kill();
            let _ = p.wait().await;
        }

        reason
    }

    fn route_inbound(&self, child_id: ChildId, message: Value) {
        match InboundMessage::classify(message) {
            InboundMessage::Response { id, message } => {
                self.correlator.resolve(&id, message);
            }
            InboundMessage::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    result_response(Some(&id), json!({}))
                } else {
                    error_response(
                        Some(&id),
                        METHOD_NOT_FOUND,
                        format!("bridge does not handle '{method}'"),
                    )
                };
                tracing::debug!(%child_id, request_id = %id, %method, "Answering request from child");
                self.reply_to_child(child_id, reply);
            }
            InboundMessage::Notification { method, params } => {
                if method == "notifications/message" {
                    let data = params.as_ref().and_then(|p| p.get("data")).cloned();
                    tracing::info!(target: "mcp_bridge::child", %child_id, data = ?data, "Child log message");
                } else {
                    tracing::debug!(%child_id, %method, "Notification from child");
                }
            }
            InboundMessage::Invalid(_) => {
                tracing::warn!(%child_id, "Ignoring non-JSON-RPC message from child");
            }
        }
    }

    fn reply_to_child(&self, child_id: ChildId, reply: Value) {
        let writer = match &self.lock_state().current {
            Some(c) if c.id == child_id => Arc::clone(&c.writer),
            _ => return,
        };
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let write = async { writer.lock().await.send(reply).await };
            match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(%child_id, error = %e, "Failed to answer child request")
                }
                Err(_) => tracing::debug!(%child_id, "Timed out answering child request"),
            }
        });
    }

    /// Death bookkeeping. `child` is `None` when the spawn itself failed.
    ///
    /// Clearing the handle, resetting the handshake and draining pending
    /// requests happen under one lock with no await in between.
    fn on_child_gone(self: &Arc<Self>, child: Option<ChildId>, reason: String) {
        let (action, drained) = {
            let mut st = self.lock_state();
            match child {
                Some(id) => {
                    if !st.current.as_ref().is_some_and(|c| c.id == id) {
                        tracing::debug!(child = %id, "Ignoring exit of replaced child");
                        return;
                    }
                    st.current = None;
                }
                None => st.restarting = false,
            }
            self.handshake.reset();
            let drained = self
                .correlator
                .drain_all(BridgeError::ProcessExited(reason.clone()));
            (st.on_death(&self.config), drained)
        };

        if let Some(id) = child {
            tracing::warn!(child = %id, %reason, failed_requests = drained, "Child process exited");
        }

        match action {
            ExitAction::Restart { attempt, delay } => {
                tracing::warn!(
                    attempt,
                    max_restarts = self.config.max_restarts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling child restart"
                );
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = this.spawn_child() {
                        tracing::warn!(attempt, error = %e, "Restart attempt failed");
                    }
                });
            }
            ExitAction::GiveUp { restarts } => {
                tracing::error!(restarts, "Restart budget exhausted, child permanently stopped");
            }
            ExitAction::Idle => {}
        }
    }
}

async fn wait_process(process: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match process {
        Some(p) => p.wait().await,
        None => std::future::pending().await,
    }
}

/// Re-emit the child's stderr as opaque diagnostic lines.
async fn forward_stderr(child_id: ChildId, stderr: ChildOutputReader) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "mcp_bridge::child", %child_id, "{}", line);
                }
            }
            Err(e) => {
                tracing::debug!(%child_id, error = %e, "Child stderr read failed");
                break;
            }
        }
    }
}
