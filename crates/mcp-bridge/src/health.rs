//! Health report served on `/health`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::supervisor::{ChildState, SupervisorStatus};
use crate::version::VersionInfo;

/// Overall bridge health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Child running and initialized
    Ok,
    /// Child starting, restarting or not yet initialized
    Degraded,
    /// Restart budget exhausted or bridge stopped
    Unavailable,
}

/// Whether a child process is currently attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildLiveness {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub transport: &'static str,
    pub stdio_child: ChildLiveness,
    pub mcp_initialized: bool,
    pub inflight_requests: usize,
    pub restart_count: u32,
    pub production_ready: bool,
    pub max_restarts: u32,
    pub child_state: ChildState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    pub version: VersionInfo,
}

impl HealthResponse {
    pub fn from_status(status: SupervisorStatus, version: VersionInfo) -> Self {
        let overall = match status.state {
            ChildState::PermanentlyStopped | ChildState::Stopped => HealthStatus::Unavailable,
            _ if status.production_ready() => HealthStatus::Ok,
            _ => HealthStatus::Degraded,
        };

        Self {
            status: overall,
            transport: "stdio",
            stdio_child: if status.is_running() {
                ChildLiveness::Running
            } else {
                ChildLiveness::Stopped
            },
            mcp_initialized: status.initialized,
            inflight_requests: status.inflight_requests,
            restart_count: status.restart_count,
            production_ready: status.production_ready(),
            max_restarts: status.max_restarts,
            child_state: status.state,
            last_restart_at: status.last_restart_at,
            version,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}
