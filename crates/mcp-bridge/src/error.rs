use std::time::Duration;

use thiserror::Error;

use crate::bridge::protocol::RequestId;

/// Failure surfaced to a caller of the bridge.
///
/// `Clone` so a single handshake outcome can be fanned out to every waiter.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("child process is not running")]
    NotRunning,

    #[error("child process permanently stopped after {restarts} restarts")]
    PermanentlyStopped { restarts: u32 },

    #[error("child process exited: {0}")]
    ProcessExited(String),

    #[error("failed to spawn child process: {0}")]
    Spawn(String),

    #[error("failed to write to child stdin: {0}")]
    Write(String),

    #[error("request '{method}' timed out after {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),

    #[error("bridge is shutting down")]
    ShuttingDown,
}

impl BridgeError {
    /// True for errors caused by the child not being available.
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            Self::NotRunning
                | Self::PermanentlyStopped { .. }
                | Self::ProcessExited(_)
                | Self::Spawn(_)
                | Self::ShuttingDown
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
