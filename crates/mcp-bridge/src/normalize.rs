//! Maps the method spellings HTTP callers use onto canonical MCP methods.

use serde_json::{Value, json};

/// MCP methods that accept alternate spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalMethod {
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
}

impl CanonicalMethod {
    pub fn from_alias(method: &str) -> Option<Self> {
        match method {
            "tools/list" | "listTools" | "list_tools" | "tools.list" | "tools_list" => {
                Some(Self::ToolsList)
            }
            "tools/call" | "callTool" | "call_tool" | "tools.call" | "tools_call" => {
                Some(Self::ToolsCall)
            }
            "resources/list" | "listResources" | "list_resources" | "resources.list"
            | "resources_list" => Some(Self::ResourcesList),
            "resources/read" | "readResource" | "read_resource" | "resources.read"
            | "resources_read" => Some(Self::ResourcesRead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
        }
    }

    /// List methods take no arguments; whatever the caller sent is replaced.
    fn takes_params(&self) -> bool {
        matches!(self, Self::ToolsCall | Self::ResourcesRead)
    }
}

impl std::fmt::Display for CanonicalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rewrite `(method, params)` into the form the child understands.
///
/// Unknown methods pass through unchanged. Missing (or `null`) params become `{}`.
pub fn normalize(method: &str, params: Option<Value>) -> (String, Value) {
    let params = match params {
        None | Some(Value::Null) => json!({}),
        Some(params) => params,
    };
    match CanonicalMethod::from_alias(method) {
        Some(canonical) if canonical.takes_params() => (canonical.as_str().to_string(), params),
        Some(canonical) => (canonical.as_str().to_string(), json!({})),
        None => (method.to_string(), params),
    }
}
