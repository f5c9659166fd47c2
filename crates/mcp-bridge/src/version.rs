//! Version information for the bridge.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by `/health` and `/`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub bridge: &'static str,
    /// MCP protocol version offered to the child.
    pub protocol: String,
}

impl VersionInfo {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            protocol: protocol.into(),
        }
    }
}
