//! mcp-bridge: exposes a stdio MCP server over HTTP and keeps it alive.

mod health;
mod version;

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod error;
pub mod handshake;
pub mod normalize;
pub mod service;
pub mod spawner;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use bridge::protocol::{ChildId, RequestId, RpcRequest};
pub use config::{BridgeConfig, ChildCommand, Secret};
pub use error::BridgeError;
pub use health::{ChildLiveness, HealthResponse, HealthStatus};
pub use normalize::{CanonicalMethod, normalize};
pub use service::{BridgeService, CallOutcome};
pub use spawner::{ChildSpawner, CommandSpawner, SpawnError, SpawnedChild};
pub use supervisor::{ChildState, Supervisor, SupervisorStatus};
pub use version::{BRIDGE_VERSION, VersionInfo};
