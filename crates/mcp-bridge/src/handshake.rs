//! MCP initialization handshake, once per child lifetime.
//!
//! State machine:
//!
//! ```text
//! NotStarted --ensure_ready--> InProgress --ok--> Complete
//!                                  |
//!                                  +--err--> NotStarted (retryable)
//! any state --child restart--> NotStarted
//! ```
//!
//! Concurrent callers that arrive while a handshake is in flight share its
//! outcome; exactly one `initialize` request is written to the child.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::{Value, json};

use crate::bridge::protocol::ChildId;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::supervisor::Supervisor;
use crate::version::BRIDGE_VERSION;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

type HandshakeFuture = Shared<BoxFuture<'static, Result<Value, BridgeError>>>;

/// Observable handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    NotStarted,
    InProgress,
    Complete,
}

enum State {
    NotStarted,
    InProgress {
        child: ChildId,
        outcome: HandshakeFuture,
    },
    Complete {
        child: ChildId,
        result: Value,
    },
}

pub struct Handshake {
    state: StdMutex<State>,
    attempts: AtomicU64,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(State::NotStarted),
            attempts: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Handshake state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        match &*self.lock() {
            State::NotStarted => HandshakePhase::NotStarted,
            State::InProgress { .. } => HandshakePhase::InProgress,
            State::Complete { .. } => HandshakePhase::Complete,
        }
    }

    pub fn is_complete_for(&self, child: ChildId) -> bool {
        matches!(&*self.lock(), State::Complete { child: c, .. } if *c == child)
    }

    /// Result of the last successful `initialize`, if the handshake is complete.
    pub fn initialize_result(&self) -> Option<Value> {
        match &*self.lock() {
            State::Complete { result, .. } => Some(result.clone()),
            _ => None,
        }
    }

    /// Number of handshakes started since the bridge came up.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Force `NotStarted`. Called whenever the child goes away.
    pub fn reset(&self) {
        *self.lock() = State::NotStarted;
    }

    /// Wait until `initialize` has completed against the current child.
    ///
    /// Returns the child the handshake completed for; callers must send to
    /// that child only (see [`Supervisor::send_to`]).
    pub async fn ensure_ready(&self, supervisor: &Arc<Supervisor>) -> Result<ChildId, BridgeError> {
        let child = supervisor.current_child()?;

        let outcome = {
            let mut state = self.lock();
            let joined = match &*state {
                State::Complete { child: c, .. } if *c == child => return Ok(child),
                State::InProgress { child: c, outcome } if *c == child => Some(outcome.clone()),
                _ => None,
            };
            match joined {
                Some(outcome) => outcome,
                None => {
                    self.attempts.fetch_add(1, Ordering::SeqCst);
                    let outcome = start(Arc::clone(supervisor), child);
                    *state = State::InProgress {
                        child,
                        outcome: outcome.clone(),
                    };
                    outcome
                }
            }
        };

        outcome.await.map(|_| child)
    }

    fn finish(&self, child: ChildId, outcome: &Result<Value, BridgeError>) {
        let mut state = self.lock();
        // A reset (child died) or a newer handshake supersedes this one.
        if !matches!(&*state, State::InProgress { child: c, .. } if *c == child) {
            tracing::debug!(%child, "Discarding outcome of superseded handshake");
            return;
        }
        *state = match outcome {
            Ok(result) => State::Complete {
                child,
                result: result.clone(),
            },
            Err(_) => State::NotStarted,
        };
    }
}

/// Parameters of the `initialize` request sent to the child.
pub fn initialize_params(config: &BridgeConfig) -> Value {
    json!({
        "protocolVersion": config.protocol_version,
        "capabilities": {},
        "clientInfo": {
            "name": config.client_name,
            "version": BRIDGE_VERSION,
        },
    })
}

/// Run the exchange on its own task so it progresses even if every waiter
/// goes away.
fn start(supervisor: Arc<Supervisor>, child: ChildId) -> HandshakeFuture {
    let task = tokio::spawn(async move {
        let outcome = perform(&supervisor, child).await;
        match &outcome {
            Ok(_) => tracing::info!(%child, "MCP handshake complete"),
            Err(e) => tracing::warn!(%child, error = %e, "MCP handshake failed"),
        }
        supervisor.handshake().finish(child, &outcome);
        outcome
    });

    async move {
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(BridgeError::Handshake(format!("handshake task failed: {e}"))),
        }
    }
    .boxed()
    .shared()
}

async fn perform(supervisor: &Arc<Supervisor>, child: ChildId) -> Result<Value, BridgeError> {
    let config = supervisor.config();
    tracing::info!(%child, protocol_version = %config.protocol_version, "Starting MCP handshake");

    let exchange = supervisor.send_to(child, INITIALIZE, Some(initialize_params(config)));
    let response = match tokio::time::timeout(config.handshake_timeout, exchange).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(BridgeError::Handshake(e.to_string())),
        Err(_) => {
            return Err(BridgeError::Handshake(format!(
                "initialize timed out after {}ms",
                config.handshake_timeout.as_millis()
            )));
        }
    };

    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(BridgeError::Handshake(format!(
            "child rejected initialize: {message}"
        )));
    }
    let result = response
        .get("result")
        .cloned()
        .ok_or_else(|| BridgeError::Handshake("initialize response has no result".to_string()))?;

    if let Some(server) = result.pointer("/serverInfo/name").and_then(Value::as_str) {
        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        tracing::debug!(%child, server, protocol_version, "Child identified itself");
    }

    supervisor
        .notify_to(child, INITIALIZED_NOTIFICATION, None)
        .await
        .map_err(|e| BridgeError::Handshake(e.to_string()))?;

    Ok(result)
}
